//! gRPC implementation of [`ModuleCaller`]
//!
//! Talks to the `hyperion.v1alpha1.HyperionAPIService` of each module instance.
//!
//! Features:
//! - Per-endpoint channel caching (reuses `tonic::Channel`)
//! - Connect timeout and a deadline on unary calls
//! - Cached channels are dropped after any failed call, including a stream
//!   that breaks partway through

use async_trait::async_trait;
use fleetcast_proto::hyperion_api_service_client::HyperionApiServiceClient;
use fleetcast_proto::{
    ApplyRequest, ApplyResponse, DeleteRequest, DeleteResponse, GetRequest, GetResponse,
    ListRequest, WatchDataRequest, WatchDataResponse, WatchLogRequest, WatchLogResponse,
};
use futures::{Stream, StreamExt};
use moka::sync::Cache;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::gateway::{ModuleCaller, RemoteStream};

/// TTL for idle cached channels (5 minutes).
/// Channels to instances that left the fleet are evicted after this long unused.
const CHANNEL_CACHE_TTL_SECS: u64 = 300;

/// Maximum number of cached channels.
const CHANNEL_CACHE_MAX_CAPACITY: u64 = 256;

/// Configuration for the gRPC module caller
#[derive(Debug, Clone)]
pub struct GrpcCallerConfig {
    /// Timeout for establishing a new connection to an instance
    pub connect_timeout: Duration,
    /// Deadline for unary calls. Streams are not bounded.
    pub call_timeout: Duration,
}

impl Default for GrpcCallerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Module caller over tonic channels
pub struct GrpcModuleCaller {
    config: GrpcCallerConfig,
    /// Cached channels keyed by instance endpoint (`host:port`).
    channels: Cache<String, Channel>,
}

impl GrpcModuleCaller {
    #[must_use]
    pub fn new(config: GrpcCallerConfig) -> Self {
        let channels = Cache::builder()
            .max_capacity(CHANNEL_CACHE_MAX_CAPACITY)
            .time_to_idle(Duration::from_secs(CHANNEL_CACHE_TTL_SECS))
            .build();

        Self { config, channels }
    }

    /// Get or create a cached channel for an endpoint.
    async fn get_channel(&self, endpoint: &str) -> Result<Channel> {
        if let Some(channel) = self.channels.get(endpoint) {
            return Ok(channel);
        }

        let uri = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        };

        let channel = Endpoint::from_shared(uri)
            .map_err(|e| Error::Rpc(format!("Invalid endpoint URI for {endpoint}: {e}")))?
            .connect_timeout(self.config.connect_timeout)
            .connect()
            .await
            .map_err(|e| Error::Rpc(format!("Failed to connect to {endpoint}: {e}")))?;

        debug!(endpoint = %endpoint, "Connected to module instance");
        self.channels.insert(endpoint.to_string(), channel.clone());
        Ok(channel)
    }

    async fn client(&self, endpoint: &str) -> Result<HyperionApiServiceClient<Channel>> {
        Ok(HyperionApiServiceClient::new(self.get_channel(endpoint).await?))
    }

    fn unary_request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(self.config.call_timeout);
        request
    }

    fn on_failure(&self, endpoint: &str, operation: &str, error: Error) -> Error {
        invalidate_after_failure(&self.channels, endpoint, operation, error)
    }

    /// Wrap a server stream so a read error also drops the cached channel.
    fn remote_stream<T, S>(&self, endpoint: &str, operation: &'static str, stream: S) -> RemoteStream<T>
    where
        T: Send + 'static,
        S: Stream<Item = std::result::Result<T, tonic::Status>> + Send + 'static,
    {
        let channels = self.channels.clone();
        let endpoint = endpoint.to_string();
        stream
            .map(move |item| {
                item.map_err(|status| {
                    invalidate_after_failure(&channels, &endpoint, operation, Error::from(status))
                })
            })
            .boxed()
    }

    /// Number of cached channels.
    #[must_use]
    pub fn cached_channels(&self) -> u64 {
        self.channels.run_pending_tasks();
        self.channels.entry_count()
    }
}

impl Default for GrpcModuleCaller {
    fn default() -> Self {
        Self::new(GrpcCallerConfig::default())
    }
}

/// Drop the cached channel after a failure and pass the error on.
fn invalidate_after_failure(
    channels: &Cache<String, Channel>,
    endpoint: &str,
    operation: &str,
    error: Error,
) -> Error {
    warn!(endpoint = %endpoint, operation, error = %error, "Module call failed");
    channels.invalidate(endpoint);
    error
}

#[async_trait]
impl ModuleCaller for GrpcModuleCaller {
    async fn apply(&self, endpoint: &str, request: ApplyRequest) -> Result<ApplyResponse> {
        let result: Result<ApplyResponse> = async {
            let mut client = self.client(endpoint).await?;
            Ok(client.apply(self.unary_request(request)).await?.into_inner())
        }
        .await;
        result.map_err(|e| self.on_failure(endpoint, "apply", e))
    }

    async fn delete(&self, endpoint: &str, request: DeleteRequest) -> Result<DeleteResponse> {
        let result: Result<DeleteResponse> = async {
            let mut client = self.client(endpoint).await?;
            Ok(client.delete(self.unary_request(request)).await?.into_inner())
        }
        .await;
        result.map_err(|e| self.on_failure(endpoint, "delete", e))
    }

    async fn get(&self, endpoint: &str, request: GetRequest) -> Result<GetResponse> {
        let result: Result<GetResponse> = async {
            let mut client = self.client(endpoint).await?;
            Ok(client.get(self.unary_request(request)).await?.into_inner())
        }
        .await;
        result.map_err(|e| self.on_failure(endpoint, "get", e))
    }

    async fn list(&self, endpoint: &str, request: ListRequest) -> Result<RemoteStream<GetResponse>> {
        let result: Result<RemoteStream<GetResponse>> = async {
            let mut client = self.client(endpoint).await?;
            Ok(self.remote_stream(endpoint, "list", client.list(request).await?.into_inner()))
        }
        .await;
        result.map_err(|e| self.on_failure(endpoint, "list", e))
    }

    async fn watch_data(
        &self,
        endpoint: &str,
        request: WatchDataRequest,
    ) -> Result<RemoteStream<WatchDataResponse>> {
        let result: Result<RemoteStream<WatchDataResponse>> = async {
            let mut client = self.client(endpoint).await?;
            Ok(self.remote_stream(endpoint, "watch_data", client.watch_data(request).await?.into_inner()))
        }
        .await;
        result.map_err(|e| self.on_failure(endpoint, "watch_data", e))
    }

    async fn watch_log(
        &self,
        endpoint: &str,
        request: WatchLogRequest,
    ) -> Result<RemoteStream<WatchLogResponse>> {
        let result: Result<RemoteStream<WatchLogResponse>> = async {
            let mut client = self.client(endpoint).await?;
            Ok(self.remote_stream(endpoint, "watch_log", client.watch_log(request).await?.into_inner()))
        }
        .await;
        result.map_err(|e| self.on_failure(endpoint, "watch_log", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_rpc_error() {
        let caller = GrpcModuleCaller::default();
        let err = caller
            .get("not a uri", GetRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rpc(_)));
        assert_eq!(caller.cached_channels(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_not_cached() {
        let caller = GrpcModuleCaller::new(GrpcCallerConfig {
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        });
        let endpoint = format!("127.0.0.1:{}", unused_port());

        let result = caller.watch_log(&endpoint, WatchLogRequest::default()).await;
        assert!(matches!(result, Err(Error::Rpc(_))));
        assert_eq!(caller.cached_channels(), 0);
    }

    #[tokio::test]
    async fn test_stream_read_error_drops_cached_channel() {
        let caller = GrpcModuleCaller::default();
        let endpoint = "10.9.0.1:50051";
        let channel = Endpoint::from_static("http://10.9.0.1:50051").connect_lazy();
        caller.channels.insert(endpoint.to_string(), channel);
        assert_eq!(caller.cached_channels(), 1);

        let items = futures::stream::iter(vec![
            Ok(WatchLogResponse { data: b"line".to_vec() }),
            Err(tonic::Status::unavailable("connection reset")),
        ]);
        let results: Vec<_> = caller.remote_stream(endpoint, "watch_log", items).collect().await;

        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(caller.cached_channels(), 0);
    }
}
