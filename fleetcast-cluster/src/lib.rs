pub mod discovery;
pub mod error;
pub mod gateway;
pub mod grpc;

pub use discovery::{
    ChannelFeed, InstanceKey, InstanceRecord, InstanceRegistry, LifecycleEvent, LifecycleFeed,
    Synchronizer,
};
#[cfg(feature = "kube")]
pub use discovery::{KubePodFeed, KubePodFeedConfig};
pub use error::{Error, Result};
pub use gateway::{
    BroadcastConfig, BroadcastGateway, BroadcastResult, InstanceFailure, MergedStream,
    ModuleCaller, ModuleGateway, TargetSource, WatchDataEvent,
};
pub use grpc::{GrpcCallerConfig, GrpcModuleCaller};
