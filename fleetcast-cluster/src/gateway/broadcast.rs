//! Broadcast dispatch across every matching instance
//!
//! Unary broadcasts fan a call out to all targets in parallel and join on every
//! one of them. Streaming broadcasts open one remote stream per target and merge
//! them through [`MergedStream`]. In both cases a failing instance is recorded and
//! never stops the others.

use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::caller::RemoteStream;
use super::fan_in::MergedStream;
use super::targets::TargetSource;
use crate::discovery::InstanceKey;
use crate::error::{Error, Result};

/// Capacity of the queue shared by the relays of one merged stream.
pub const DEFAULT_STREAM_BUFFER: usize = 8;

/// Broadcast tuning
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Deadline for one instance to answer a unary call or open a stream.
    pub per_instance_timeout: Duration,
    /// Capacity of the merged-stream queue; relays block when it is full.
    pub stream_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            per_instance_timeout: Duration::from_secs(5),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

/// Failure category of a single instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoEndpoint,
    Transport,
    Timeout,
    Other,
}

/// Why one instance did not contribute to a broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceFailure {
    pub instance: InstanceKey,
    pub endpoint: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

impl InstanceFailure {
    #[must_use]
    pub fn new(instance: InstanceKey, endpoint: Option<String>, error: &Error) -> Self {
        let kind = match error {
            Error::NoEndpoint(_) => FailureKind::NoEndpoint,
            Error::Rpc(_) => FailureKind::Transport,
            Error::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Other,
        };

        Self {
            instance,
            endpoint,
            kind,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for InstanceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(endpoint) => write!(f, "{} ({}): {}", self.instance, endpoint, self.message),
            None => write!(f, "{}: {}", self.instance, self.message),
        }
    }
}

/// Aggregate of every per-instance failure of one broadcast.
#[derive(Debug, Clone)]
pub struct AggregateError {
    pub failures: Vec<InstanceFailure>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} instance(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Successful response of one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceResponse<T> {
    pub instance: InstanceKey,
    pub endpoint: String,
    pub response: T,
}

/// Outcome of a unary broadcast: partial successes and failures side by side.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastResult<T> {
    /// Responses in completion-independent order; no ordering across instances is implied.
    pub responses: Vec<InstanceResponse<T>>,
    pub failures: Vec<InstanceFailure>,
}

impl<T> BroadcastResult<T> {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            responses: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Whether every targeted instance answered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether instances were targeted and none of them answered.
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.responses.is_empty() && !self.failures.is_empty()
    }

    #[must_use]
    pub fn total_instances(&self) -> usize {
        self.responses.len() + self.failures.len()
    }

    /// Aggregate error, absent when no instance failed.
    #[must_use]
    pub fn error(&self) -> Option<AggregateError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(AggregateError {
                failures: self.failures.clone(),
            })
        }
    }

    /// Split into the bare responses and the aggregate error.
    #[must_use]
    pub fn into_parts(self) -> (Vec<T>, Option<AggregateError>) {
        let error = if self.failures.is_empty() {
            None
        } else {
            Some(AggregateError {
                failures: self.failures,
            })
        };
        let responses = self.responses.into_iter().map(|r| r.response).collect();
        (responses, error)
    }
}

/// Dispatches operations to every instance of a [`TargetSource`].
#[derive(Debug, Clone)]
pub struct BroadcastGateway {
    targets: TargetSource,
    config: BroadcastConfig,
}

impl BroadcastGateway {
    #[must_use]
    pub const fn new(targets: TargetSource, config: BroadcastConfig) -> Self {
        Self { targets, config }
    }

    #[must_use]
    pub const fn targets(&self) -> &TargetSource {
        &self.targets
    }

    #[must_use]
    pub const fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Invoke `call` against every target in parallel and join on all of them.
    ///
    /// Each call is bounded by the per-instance timeout. Dropping the returned
    /// future aborts every call still outstanding.
    pub async fn broadcast<T, F, Fut>(&self, operation: &'static str, call: F) -> BroadcastResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let targets = self.targets.resolve();
        if targets.is_empty() {
            debug!(operation, "Broadcast has no targets");
            return BroadcastResult::empty();
        }

        let per_instance_timeout = self.config.per_instance_timeout;
        let call = &call;

        let calls: Vec<_> = targets
            .into_iter()
            .map(|target| async move {
                let endpoint = match target.endpoint {
                    Ok(endpoint) => endpoint,
                    Err(e) => return (target.instance, Err((None, e))),
                };

                let result = tokio::time::timeout(per_instance_timeout, call(endpoint.clone()))
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::Timeout(format!("{operation} timed out for {endpoint}")))
                    });
                let outcome = match result {
                    Ok(response) => Ok((endpoint, response)),
                    Err(e) => Err((Some(endpoint), e)),
                };
                (target.instance, outcome)
            })
            .collect();

        let outcomes = join_all(calls).await;

        let mut result = BroadcastResult::empty();
        for (instance, outcome) in outcomes {
            match outcome {
                Ok((endpoint, response)) => result.responses.push(InstanceResponse {
                    instance,
                    endpoint,
                    response,
                }),
                Err((endpoint, e)) => {
                    warn!(
                        operation,
                        instance = %instance,
                        endpoint = endpoint.as_deref().unwrap_or(""),
                        error = %e,
                        "Broadcast failed for instance"
                    );
                    result.failures.push(InstanceFailure::new(instance, endpoint, &e));
                }
            }
        }

        debug!(
            operation,
            succeeded = result.responses.len(),
            failed = result.failures.len(),
            "Broadcast complete"
        );

        result
    }

    /// Open `open` against every target and merge the resulting streams.
    ///
    /// Items pass through `map` inside the relay; returning `None` drops the item.
    /// Cancelling `parent` (or dropping / cancelling the merged stream) tears down
    /// every relay and remote stream.
    pub fn broadcast_stream<T, U, F, Fut, M>(
        &self,
        operation: &'static str,
        open: F,
        map: M,
        parent: &CancellationToken,
    ) -> MergedStream<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RemoteStream<T>>> + Send + 'static,
        M: Fn(&InstanceKey, T) -> Option<U> + Send + Sync + 'static,
    {
        let targets = self.targets.resolve();
        debug!(operation, targets = targets.len(), "Opening streaming broadcast");

        let per_instance_timeout = self.config.per_instance_timeout;
        let open = move |endpoint: String| {
            let opened = open(endpoint.clone());
            async move {
                tokio::time::timeout(per_instance_timeout, opened)
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::Timeout(format!("{operation} stream open timed out for {endpoint}")))
                    })
            }
        };

        MergedStream::spawn(
            operation,
            targets,
            open,
            map,
            self.config.stream_buffer,
            parent.child_token(),
        )
    }
}
