//! Fleet-wide broadcast of module operations

pub mod broadcast;
pub mod caller;
pub mod correlation;
pub mod fan_in;
pub mod module;
pub mod targets;

pub use broadcast::{
    AggregateError, BroadcastConfig, BroadcastGateway, BroadcastResult, FailureKind,
    InstanceFailure, InstanceResponse, DEFAULT_STREAM_BUFFER,
};
pub use caller::{ModuleCaller, RemoteStream};
pub use correlation::{logical_name, Correlator, TEMPLATE_HASH_LABEL};
pub use fan_in::{MergeState, MergedStream};
pub use module::{ModuleGateway, WatchDataEvent};
pub use targets::{default_selector, Target, TargetSource, CONTROL_ROLE_LABEL};
