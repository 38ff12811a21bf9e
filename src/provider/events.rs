//! State-change notifications for the host application.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::dispatch::{OperationId, OperationKind, OperationResult};
use crate::util::lock_recover;

/// Events published by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Cached state of these paths changed.
    StateChanged { paths: Vec<String> },
    OperationCompleted {
        id: OperationId,
        kind: OperationKind,
        result: OperationResult,
    },
}

/// Optional behaviour the host application supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// The host listens for `StateChanged` events.
    pub state_change_events: bool,
    /// The host wants a background refresh when the user selects files.
    pub refresh_on_selection: bool,
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self {
            state_change_events: true,
            refresh_on_selection: false,
        }
    }
}

/// Fan-out of provider events to any number of subscribers.
#[derive(Debug)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ProviderEvent>>>,
    state_events: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            state_events: AtomicBool::new(true),
        }
    }

    pub fn subscribe(&self) -> Receiver<ProviderEvent> {
        let (tx, rx) = unbounded();
        lock_recover(&self.subscribers).push(tx);
        rx
    }

    pub fn set_state_events(&self, enabled: bool) {
        self.state_events.store(enabled, Ordering::SeqCst);
    }

    /// Send to every live subscriber; dropped receivers are forgotten.
    pub fn publish(&self, event: ProviderEvent) {
        if matches!(event, ProviderEvent::StateChanged { .. })
            && !self.state_events.load(Ordering::SeqCst)
        {
            return;
        }
        lock_recover(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock_recover(&self.subscribers).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(ProviderEvent::StateChanged {
            paths: vec!["a.txt".into()],
        });

        assert!(matches!(a.try_recv(), Ok(ProviderEvent::StateChanged { .. })));
        assert!(matches!(b.try_recv(), Ok(ProviderEvent::StateChanged { .. })));
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(ProviderEvent::OperationCompleted {
            id: 1,
            kind: OperationKind::Fetch,
            result: OperationResult::Succeeded,
        });

        assert_eq!(bus.subscriber_count(), 1);
        assert!(a.try_recv().is_ok());
    }

    #[test]
    fn test_state_events_can_be_disabled() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.set_state_events(false);

        bus.publish(ProviderEvent::StateChanged { paths: vec![] });
        assert!(rx.try_recv().is_err());

        bus.publish(ProviderEvent::OperationCompleted {
            id: 2,
            kind: OperationKind::Add,
            result: OperationResult::Failed,
        });
        assert!(rx.try_recv().is_ok());
    }
}
