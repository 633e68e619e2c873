//! Workload lifecycle events consumed by the synchronizer

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use super::instance_registry::{InstanceKey, InstanceRecord};

/// A change in the set of running instances, as reported by a cluster watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The instance appeared or changed; carries its full current state.
    Added(InstanceRecord),
    /// The instance is gone.
    Removed(InstanceKey),
}

impl LifecycleEvent {
    #[must_use]
    pub const fn key(&self) -> &InstanceKey {
        match self {
            Self::Added(record) => &record.key,
            Self::Removed(key) => key,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Removed(_) => "removed",
        }
    }
}

/// Source of lifecycle events for one workload kind.
///
/// Subscribing consumes the feed; the returned stream ends when the source is
/// exhausted or closed.
pub trait LifecycleFeed: Send + 'static {
    fn subscribe(self) -> BoxStream<'static, LifecycleEvent>;
}

/// Lifecycle feed backed by an in-process channel.
///
/// Lets embedders (and tests) drive the synchronizer without a cluster watch.
pub struct ChannelFeed {
    rx: mpsc::Receiver<LifecycleEvent>,
}

impl ChannelFeed {
    /// Create a feed and the sender that publishes into it.
    #[must_use]
    pub fn new(capacity: usize) -> (mpsc::Sender<LifecycleEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

impl LifecycleFeed for ChannelFeed {
    fn subscribe(self) -> BoxStream<'static, LifecycleEvent> {
        stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }
}

impl LifecycleFeed for BoxStream<'static, LifecycleEvent> {
    fn subscribe(self) -> BoxStream<'static, LifecycleEvent> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_feed_delivers_in_order_and_ends() {
        let (tx, feed) = ChannelFeed::new(4);
        let key = InstanceKey::new("default", "a");

        tx.send(LifecycleEvent::Added(InstanceRecord::new(key.clone())))
            .await
            .unwrap();
        tx.send(LifecycleEvent::Removed(key.clone())).await.unwrap();
        drop(tx);

        let events: Vec<_> = feed.subscribe().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "added");
        assert_eq!(events[1], LifecycleEvent::Removed(key));
    }

    #[test]
    fn test_event_key() {
        let key = InstanceKey::new("default", "a");
        let added = LifecycleEvent::Added(InstanceRecord::new(key.clone()));
        assert_eq!(added.key(), &key);
        assert_eq!(LifecycleEvent::Removed(key.clone()).key(), &key);
    }
}
