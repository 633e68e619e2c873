//! Broadcast target resolution

use std::collections::HashMap;
use std::sync::Arc;

use crate::discovery::{InstanceKey, InstanceRegistry};
use crate::error::Result;

/// Label carried by the control replica of a module.
pub const CONTROL_ROLE_LABEL: &str = "core.hyperion.io/master";

/// Namespace reported for the instance behind a static endpoint.
pub const STATIC_NAMESPACE: &str = "static";

/// Default selection predicate: every control replica.
#[must_use]
pub fn default_selector() -> HashMap<String, String> {
    HashMap::from([(CONTROL_ROLE_LABEL.to_string(), "true".to_string())])
}

/// One instance a broadcast is sent to.
#[derive(Debug)]
pub struct Target {
    pub instance: InstanceKey,
    /// Resolved `host:port`, or why the instance cannot be reached.
    pub endpoint: Result<String>,
}

/// Where broadcast targets come from.
#[derive(Debug, Clone)]
pub enum TargetSource {
    /// Every registry record matching `selector`.
    Registry {
        registry: Arc<InstanceRegistry>,
        selector: HashMap<String, String>,
    },
    /// A single fixed endpoint, for deployments without fleet discovery.
    Static { endpoint: String },
}

impl TargetSource {
    #[must_use]
    pub fn registry(registry: Arc<InstanceRegistry>, selector: HashMap<String, String>) -> Self {
        Self::Registry { registry, selector }
    }

    #[must_use]
    pub fn fixed(host: &str, port: u16) -> Self {
        Self::Static {
            endpoint: format!("{host}:{port}"),
        }
    }

    /// Snapshot the current target set. The registry lock is released before returning.
    #[must_use]
    pub fn resolve(&self) -> Vec<Target> {
        match self {
            Self::Registry { registry, selector } => registry
                .get_by_labels(selector)
                .into_iter()
                .map(|record| Target {
                    endpoint: InstanceRegistry::resolve(&record),
                    instance: record.key,
                })
                .collect(),
            Self::Static { endpoint } => vec![Target {
                instance: InstanceKey::new(STATIC_NAMESPACE, endpoint.clone()),
                endpoint: Ok(endpoint.clone()),
            }],
        }
    }

    /// Registry backing this source, if discovery is dynamic.
    #[must_use]
    pub const fn registry_handle(&self) -> Option<&Arc<InstanceRegistry>> {
        match self {
            Self::Registry { registry, .. } => Some(registry),
            Self::Static { .. } => None,
        }
    }
}
