use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Change feed per scope: a tutorial group id, or the course id for course-level events.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to committed events of a scope. Creates the channel if needed.
    pub fn subscribe(&self, scope: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(scope)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, scope: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&scope) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a scope's channel; subscribers see the stream close.
    pub fn remove(&self, scope: &Ulid) {
        self.channels.remove(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let group = Ulid::new();
        let mut rx = hub.subscribe(group);

        let event = Event::GroupCreated {
            id: group,
            title: "Tutorial 3".into(),
        };
        hub.send(group, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_scopes_are_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        let other = Ulid::new();
        hub.send(other, &Event::GroupDeleted { id: other });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_scope_closes_stream() {
        let hub = NotifyHub::new();
        let group = Ulid::new();
        let mut rx = hub.subscribe(group);
        hub.remove(&group);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
