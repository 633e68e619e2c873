//! Remote caller capability
//!
//! The gateway never speaks a wire protocol itself. Every per-instance call goes
//! through a [`ModuleCaller`], addressed by the instance endpoint (`host:port`).

use async_trait::async_trait;
use fleetcast_proto::{
    ApplyRequest, ApplyResponse, DeleteRequest, DeleteResponse, GetRequest, GetResponse,
    ListRequest, WatchDataRequest, WatchDataResponse, WatchLogRequest, WatchLogResponse,
};
use futures::stream::BoxStream;

use crate::error::Result;

/// Stream of items produced by one remote instance.
pub type RemoteStream<T> = BoxStream<'static, Result<T>>;

/// Operations every module instance exposes.
#[async_trait]
pub trait ModuleCaller: Send + Sync + 'static {
    async fn apply(&self, endpoint: &str, request: ApplyRequest) -> Result<ApplyResponse>;

    async fn delete(&self, endpoint: &str, request: DeleteRequest) -> Result<DeleteResponse>;

    async fn get(&self, endpoint: &str, request: GetRequest) -> Result<GetResponse>;

    async fn list(&self, endpoint: &str, request: ListRequest) -> Result<RemoteStream<GetResponse>>;

    async fn watch_data(
        &self,
        endpoint: &str,
        request: WatchDataRequest,
    ) -> Result<RemoteStream<WatchDataResponse>>;

    async fn watch_log(
        &self,
        endpoint: &str,
        request: WatchLogRequest,
    ) -> Result<RemoteStream<WatchLogResponse>>;
}
