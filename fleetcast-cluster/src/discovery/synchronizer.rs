//! Registry synchronizer
//!
//! Applies lifecycle events from a cluster watch to the instance registry.
//! Events are applied exactly as received: a stale `Added` arriving after a
//! `Removed` re-creates the record, because the registry has no way to tell it
//! is stale. The next event for the key corrects it.

use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{LifecycleEvent, LifecycleFeed};
use super::instance_registry::InstanceRegistry;

/// Counters of applied events
#[derive(Debug, Default)]
pub struct SyncStats {
    added: AtomicU64,
    removed: AtomicU64,
}

impl SyncStats {
    #[must_use]
    pub fn added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }
}

/// Keeps an [`InstanceRegistry`] consistent with a [`LifecycleFeed`].
pub struct Synchronizer {
    registry: Arc<InstanceRegistry>,
    cancel_token: CancellationToken,
    stats: Arc<SyncStats>,
}

impl Synchronizer {
    #[must_use]
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self {
            registry,
            cancel_token: CancellationToken::new(),
            stats: Arc::new(SyncStats::default()),
        }
    }

    /// Apply one event to the registry.
    pub fn apply(&self, event: LifecycleEvent) {
        Self::apply_to(&self.registry, &self.stats, event);
    }

    fn apply_to(registry: &InstanceRegistry, stats: &SyncStats, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Added(record) => {
                registry.upsert(record);
                stats.added.fetch_add(1, Ordering::Relaxed);
            }
            LifecycleEvent::Removed(key) => {
                registry.delete(&key);
                stats.removed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Subscribe to `feed` and apply its events until the feed ends or [`stop`](Self::stop) is called.
    ///
    /// Returns the `JoinHandle` so the caller can detect panics or task completion.
    pub fn start(&self, feed: impl LifecycleFeed) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let cancel_token = self.cancel_token.clone();
        let mut events = feed.subscribe();

        tokio::spawn(async move {
            tracing::info!("Synchronizer started");

            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Synchronizer shutting down");
                        return;
                    }
                    next = events.next() => {
                        let Some(event) = next else {
                            tracing::info!("Lifecycle feed ended, synchronizer stopping");
                            return;
                        };

                        tracing::trace!(
                            kind = event.kind(),
                            instance = %event.key(),
                            "Lifecycle event received"
                        );
                        Self::apply_to(&registry, &stats, event);
                    }
                }
            }
        })
    }

    /// Stop the event loop. Safe to call repeatedly; does not wait for the loop to exit.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::events::ChannelFeed;
    use crate::discovery::instance_registry::{InstanceKey, InstanceRecord};
    use std::time::Duration;

    fn added(name: &str, address: &str) -> LifecycleEvent {
        LifecycleEvent::Added(
            InstanceRecord::new(InstanceKey::new("default", name))
                .with_address(address)
                .with_ports([7000]),
        )
    }

    #[tokio::test]
    async fn test_applies_events_until_feed_ends() {
        let registry = Arc::new(InstanceRegistry::new());
        let sync = Synchronizer::new(registry.clone());
        let (tx, feed) = ChannelFeed::new(8);

        let handle = sync.start(feed);

        tx.send(added("a", "10.0.0.1")).await.unwrap();
        tx.send(added("b", "10.0.0.2")).await.unwrap();
        tx.send(added("a", "10.0.0.9")).await.unwrap();
        tx.send(LifecycleEvent::Removed(InstanceKey::new("default", "b")))
            .await
            .unwrap();
        drop(tx);

        handle.await.unwrap();

        let a = registry.get(&InstanceKey::new("default", "a")).unwrap();
        assert_eq!(a.address, "10.0.0.9");
        assert!(registry.get(&InstanceKey::new("default", "b")).is_none());
        assert_eq!(sync.stats().added(), 3);
        assert_eq!(sync.stats().removed(), 1);
    }

    #[tokio::test]
    async fn test_stale_added_after_removed_is_applied_as_received() {
        let registry = Arc::new(InstanceRegistry::new());
        let sync = Synchronizer::new(registry.clone());

        sync.apply(added("a", "10.0.0.1"));
        sync.apply(LifecycleEvent::Removed(InstanceKey::new("default", "a")));
        sync.apply(added("a", "10.0.0.1"));

        assert!(registry.get(&InstanceKey::new("default", "a")).is_some());
    }

    #[tokio::test]
    async fn test_removed_for_unknown_key_is_noop() {
        let registry = Arc::new(InstanceRegistry::new());
        let sync = Synchronizer::new(registry.clone());
        sync.apply(LifecycleEvent::Removed(InstanceKey::new("default", "ghost")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_ends_loop() {
        let registry = Arc::new(InstanceRegistry::new());
        let sync = Synchronizer::new(registry);
        // Sender kept alive: only stop() can end the loop
        let (_tx, feed) = ChannelFeed::new(1);

        let handle = sync.start(feed);
        sync.stop();
        sync.stop();
        assert!(sync.is_stopped());

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit after stop")
            .unwrap();
    }
}
