use tokio::sync::broadcast;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Typed publish/subscribe channel.
///
/// Delivery is at-most-once to the subscribers that exist when `publish` is
/// called. Publishing never waits; a subscriber that falls behind by more
/// than the capacity observes `RecvError::Lagged`. Dropping the receiver
/// unsubscribes.
pub struct EventBus<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns how many subscribers received it.
    pub fn publish(&self, event: T) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus: EventBus<u32> = EventBus::new();
        assert_eq!(bus.publish(1), 0);
    }

    #[tokio::test]
    async fn test_only_current_subscribers_receive() {
        let bus = EventBus::new();
        let mut early = bus.subscribe();

        assert_eq!(bus.publish("first"), 1);

        let mut late = bus.subscribe();
        assert_eq!(bus.publish("second"), 2);

        assert_eq!(early.recv().await.unwrap(), "first");
        assert_eq!(early.recv().await.unwrap(), "second");
        assert_eq!(late.recv().await.unwrap(), "second");
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus: EventBus<u8> = EventBus::new();
        let rx = bus.subscribe();
        let clone = bus.clone();
        assert_eq!(clone.subscriber_count(), 1);

        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();

        bus.publish(1);
        bus.publish(2);
        bus.publish(3);

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
    }
}
