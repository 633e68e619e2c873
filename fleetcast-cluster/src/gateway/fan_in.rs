//! Fan-in of per-instance remote streams
//!
//! One relay task per target opens the instance stream and forwards its items
//! into a bounded queue shared by all relays. Relays block when the queue is full,
//! so a slow consumer throttles every source instead of losing items.
//!
//! Completion is explicit: a remaining-sources counter starts at the number of
//! targets and each relay decrements it when its source ends (or fails). The
//! relay that brings it to zero enqueues a `Done` frame after its last item, and
//! every other relay has already enqueued all of its items by then, so `Done` is
//! always the final frame.

use futures::stream::Stream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::broadcast::InstanceFailure;
use super::caller::RemoteStream;
use super::targets::Target;
use crate::discovery::InstanceKey;
use crate::error::{Error, Result};

/// Lifecycle of one streaming broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    /// Endpoints resolved, some instance streams still opening.
    Dispatching,
    /// Every stream opened (or failed to); at least one source still open.
    Merging,
    /// All sources finished; queued items remain to be consumed.
    Draining,
    /// The consumer cancelled; relays are being torn down.
    Cancelled,
    /// Terminal.
    Closed,
}

enum Frame<T> {
    Item(T),
    Done,
}

#[derive(Debug)]
struct MergeShared {
    pending_opens: AtomicUsize,
    remaining: AtomicUsize,
    failures: Mutex<Vec<InstanceFailure>>,
}

impl MergeShared {
    fn record_failure(&self, operation: &str, instance: &InstanceKey, endpoint: Option<&str>, error: &Error) {
        warn!(
            operation,
            instance = %instance,
            endpoint = endpoint.unwrap_or(""),
            error = %error,
            "Stream source failed, treating it as finished"
        );
        self.failures.lock().push(InstanceFailure::new(
            instance.clone(),
            endpoint.map(str::to_string),
            error,
        ));
    }
}

/// Single stream multiplexing the item streams of every targeted instance.
///
/// Yields items as they arrive (no ordering across instances, per-instance order
/// preserved) and ends only once every source has finished. `Poll::Pending` means
/// "nothing yet"; end of stream means "finished for good".
///
/// Dropping the stream, calling [`cancel`](Self::cancel) or cancelling the parent
/// token stops every relay and drops every remote stream.
pub struct MergedStream<T> {
    rx: mpsc::Receiver<Frame<T>>,
    relays: JoinSet<()>,
    cancel_token: CancellationToken,
    shared: Arc<MergeShared>,
    closed: bool,
}

impl<T: Send + 'static> MergedStream<T> {
    pub(crate) fn spawn<S, F, Fut, M>(
        operation: &'static str,
        targets: Vec<Target>,
        open: F,
        map: M,
        buffer: usize,
        cancel_token: CancellationToken,
    ) -> Self
    where
        S: Send + 'static,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RemoteStream<S>>> + Send + 'static,
        M: Fn(&InstanceKey, S) -> Option<T> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let shared = Arc::new(MergeShared {
            pending_opens: AtomicUsize::new(targets.len()),
            remaining: AtomicUsize::new(targets.len()),
            failures: Mutex::new(Vec::new()),
        });

        let closed = targets.is_empty();
        let open = Arc::new(open);
        let map = Arc::new(map);
        let mut relays = JoinSet::new();

        for target in targets {
            relays.spawn(relay(
                operation,
                target,
                open.clone(),
                map.clone(),
                tx.clone(),
                shared.clone(),
                cancel_token.clone(),
            ));
        }

        Self {
            rx,
            relays,
            cancel_token,
            shared,
            closed,
        }
    }
}

impl<T> MergedStream<T> {
    /// Stop every relay. Items already queued are discarded.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn state(&self) -> MergeState {
        if self.closed {
            MergeState::Closed
        } else if self.cancel_token.is_cancelled() {
            MergeState::Cancelled
        } else if self.shared.remaining.load(Ordering::Acquire) == 0 {
            MergeState::Draining
        } else if self.shared.pending_opens.load(Ordering::Acquire) > 0 {
            MergeState::Dispatching
        } else {
            MergeState::Merging
        }
    }

    /// Whether the stream has ended and will yield nothing more.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.closed
    }

    /// Number of sources that have not finished yet.
    #[must_use]
    pub fn remaining_sources(&self) -> usize {
        self.shared.remaining.load(Ordering::Acquire)
    }

    /// Per-instance failures recorded so far (open or read errors).
    #[must_use]
    pub fn failures(&self) -> Vec<InstanceFailure> {
        self.shared.failures.lock().clone()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel_token.cancel();
        self.relays.abort_all();
        self.rx.close();
    }
}

impl<T> Unpin for MergedStream<T> {}

impl<T> Stream for MergedStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(None);
        }

        if this.cancel_token.is_cancelled() {
            debug!("Merged stream cancelled");
            this.close();
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Frame::Item(item))) => Poll::Ready(Some(item)),
            // Every relay is gone without a Done frame only after cancellation or abort
            Poll::Ready(Some(Frame::Done) | None) => {
                this.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for MergedStream<T> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn relay<S, T, F, Fut, M>(
    operation: &'static str,
    target: Target,
    open: Arc<F>,
    map: Arc<M>,
    tx: mpsc::Sender<Frame<T>>,
    shared: Arc<MergeShared>,
    cancel_token: CancellationToken,
) where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<RemoteStream<S>>>,
    M: Fn(&InstanceKey, S) -> Option<T>,
{
    let Target { instance, endpoint } = target;

    let source = match endpoint {
        Err(e) => {
            shared.record_failure(operation, &instance, None, &e);
            None
        }
        Ok(endpoint) => {
            let opened = tokio::select! {
                () = cancel_token.cancelled() => return,
                opened = open.as_ref()(endpoint.clone()) => opened,
            };
            match opened {
                Ok(stream) => Some((endpoint, stream)),
                Err(e) => {
                    shared.record_failure(operation, &instance, Some(&endpoint), &e);
                    None
                }
            }
        }
    };
    shared.pending_opens.fetch_sub(1, Ordering::AcqRel);

    if let Some((endpoint, mut stream)) = source {
        debug!(operation, instance = %instance, endpoint = %endpoint, "Relay started");
        let mut forwarded = 0usize;

        loop {
            let next = tokio::select! {
                () = cancel_token.cancelled() => return,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(item)) => {
                    let Some(item) = map.as_ref()(&instance, item) else {
                        continue;
                    };
                    tokio::select! {
                        () = cancel_token.cancelled() => return,
                        sent = tx.send(Frame::Item(item)) => {
                            if sent.is_err() {
                                return;
                            }
                            forwarded += 1;
                        }
                    }
                }
                Some(Err(e)) => {
                    shared.record_failure(operation, &instance, Some(&endpoint), &e);
                    break;
                }
                None => break,
            }
        }

        debug!(operation, instance = %instance, forwarded, "Relay source finished");
    }

    if shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        tokio::select! {
            () = cancel_token.cancelled() => {}
            _ = tx.send(Frame::Done) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::InstanceKey;
    use futures::stream;
    use std::collections::HashSet;
    use std::time::Duration;

    fn targets(endpoints: &[&str]) -> Vec<Target> {
        endpoints
            .iter()
            .map(|ep| Target {
                instance: InstanceKey::new("default", *ep),
                endpoint: Ok((*ep).to_string()),
            })
            .collect()
    }

    fn identity(_: &InstanceKey, item: String) -> Option<String> {
        Some(item)
    }

    fn finite_source(endpoint: String) -> impl Future<Output = Result<RemoteStream<String>>> {
        async move {
            let items: Vec<Result<String>> = (0..3).map(|i| Ok(format!("{endpoint}-{i}"))).collect();
            Ok(stream::iter(items).boxed())
        }
    }

    #[tokio::test]
    async fn test_merges_all_items_then_completes() {
        let mut merged = MergedStream::spawn(
            "list",
            targets(&["a", "b"]),
            finite_source,
            identity,
            8,
            CancellationToken::new(),
        );

        let mut seen = Vec::new();
        while let Some(item) = merged.next().await {
            seen.push(item);
        }

        assert_eq!(seen.len(), 6);
        let unique: HashSet<_> = seen.iter().cloned().collect();
        assert_eq!(unique.len(), 6);
        assert_eq!(merged.state(), MergeState::Closed);
        assert_eq!(merged.remaining_sources(), 0);
        assert!(merged.failures().is_empty());

        // Per-source order is preserved
        let from_a: Vec<_> = seen.iter().filter(|s| s.starts_with("a-")).cloned().collect();
        assert_eq!(from_a, vec!["a-0", "a-1", "a-2"]);
    }

    #[tokio::test]
    async fn test_no_targets_is_finished_immediately() {
        let mut merged = MergedStream::spawn(
            "list",
            Vec::new(),
            finite_source,
            identity,
            8,
            CancellationToken::new(),
        );
        assert!(merged.is_finished());
        assert!(merged.next().await.is_none());
    }

    #[tokio::test]
    async fn test_open_failure_counts_as_finished_source() {
        let open = |endpoint: String| async move {
            if endpoint == "bad" {
                Err(Error::Rpc("connection refused".to_string()))
            } else {
                finite_source(endpoint).await
            }
        };
        let mut all = targets(&["good", "bad"]);
        all.push(Target {
            instance: InstanceKey::new("default", "portless"),
            endpoint: Err(Error::NoEndpoint(InstanceKey::new("default", "portless"))),
        });

        let merged = MergedStream::spawn("list", all, open, identity, 8, CancellationToken::new());
        let failures_handle = merged.shared.clone();
        let items: Vec<_> = merged.collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(failures_handle.failures.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_read_failure_ends_only_that_source() {
        let open = |endpoint: String| async move {
            let items: Vec<Result<String>> = if endpoint == "flaky" {
                vec![Ok("flaky-0".to_string()), Err(Error::Rpc("reset".to_string()))]
            } else {
                (0..3).map(|i| Ok(format!("{endpoint}-{i}"))).collect()
            };
            Ok(stream::iter(items).boxed())
        };

        let mut merged = MergedStream::spawn(
            "watch_log",
            targets(&["flaky", "steady"]),
            open,
            identity,
            8,
            CancellationToken::new(),
        );

        let mut count = 0;
        while merged.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
        assert_eq!(merged.failures().len(), 1);
        assert_eq!(merged.failures()[0].instance.name, "flaky");
    }

    #[tokio::test]
    async fn test_map_can_drop_items() {
        let keep_even = |_: &InstanceKey, item: String| {
            item.ends_with('0').then_some(item)
        };
        let merged = MergedStream::spawn(
            "watch_data",
            targets(&["a", "b"]),
            finite_source,
            keep_even,
            8,
            CancellationToken::new(),
        );
        let items: Vec<_> = merged.collect().await;
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_backpressure_does_not_lose_items() {
        let open = |endpoint: String| async move {
            let items: Vec<Result<String>> = (0..100).map(|i| Ok(format!("{endpoint}-{i}"))).collect();
            Ok(stream::iter(items).boxed())
        };

        let mut merged = MergedStream::spawn(
            "list",
            targets(&["a", "b", "c"]),
            open,
            identity,
            2,
            CancellationToken::new(),
        );

        let mut count = 0;
        while merged.next().await.is_some() {
            count += 1;
            if count % 25 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        assert_eq!(count, 300);
    }

    #[tokio::test]
    async fn test_cancel_stops_endless_sources() {
        let open = |_endpoint: String| async move {
            Ok(stream::repeat_with(|| Ok::<_, Error>("tick".to_string())).boxed())
        };

        let parent = CancellationToken::new();
        let mut merged = MergedStream::spawn(
            "watch_log",
            targets(&["a", "b"]),
            open,
            identity,
            8,
            parent.child_token(),
        );

        assert_eq!(merged.next().await.as_deref(), Some("tick"));
        assert!(matches!(
            merged.state(),
            MergeState::Merging | MergeState::Dispatching
        ));

        parent.cancel();
        assert_eq!(merged.state(), MergeState::Cancelled);

        let end = tokio::time::timeout(Duration::from_secs(1), merged.next())
            .await
            .expect("cancelled stream must end");
        assert!(end.is_none());
        assert_eq!(merged.state(), MergeState::Closed);
    }

    #[tokio::test]
    async fn test_drop_tears_down_relays() {
        let (dropped_tx, mut dropped_rx) = mpsc::channel::<()>(2);

        struct DropGuard(mpsc::Sender<()>);
        impl Drop for DropGuard {
            fn drop(&mut self) {
                let _ = self.0.try_send(());
            }
        }

        let open = move |_endpoint: String| {
            let guard = DropGuard(dropped_tx.clone());
            async move {
                let endless = stream::unfold(guard, |guard| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some((Ok::<_, Error>("tick".to_string()), guard))
                });
                Ok(endless.boxed())
            }
        };

        let merged = MergedStream::spawn(
            "watch_data",
            targets(&["a", "b"]),
            open,
            identity,
            8,
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(merged);

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), dropped_rx.recv())
                .await
                .expect("remote stream should be dropped with the merged stream");
        }
    }
}
