//! Module instance discovery and registry synchronization

pub mod events;
pub mod instance_registry;
#[cfg(feature = "kube")]
pub mod kube_pods;
pub mod synchronizer;

pub use events::{ChannelFeed, LifecycleEvent, LifecycleFeed};
pub use instance_registry::{InstanceKey, InstanceRecord, InstanceRegistry};
#[cfg(feature = "kube")]
pub use kube_pods::{KubePodFeed, KubePodFeedConfig};
pub use synchronizer::{SyncStats, Synchronizer};
