//! File state cache and porcelain status parsing

mod recent;
pub mod state;
pub mod status;
mod store;

pub use recent::RecentlyRefreshed;
pub use state::{FileState, FileStatus, LockState};
pub use status::{StatusEntry, parse_porcelain, parse_porcelain_line, states_for_batch};
pub use store::StateCache;
