//! Telemetry identity correlation
//!
//! Telemetry items name the container that produced them, not the module
//! instance. The correlator maps the container id back to the owning instance
//! and stamps the item with the instance's logical (workload) name.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::discovery::{InstanceRecord, InstanceRegistry};
use crate::error::{Error, Result};

/// Label whose value is appended to replica names by the workload controller.
pub const TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Telemetry field carrying the runtime id of the producing container.
pub const CONTAINER_ID_FIELD: &str = "container_id";

/// Telemetry field set to the logical name of the owning instance.
pub const NAME_FIELD: &str = "name";

/// Logical name of an instance: its name without the `-<hash>` suffix when the
/// record carries `hash_label`.
#[must_use]
pub fn logical_name(record: &InstanceRecord, hash_label: &str) -> String {
    let name = record.key.name.as_str();
    record
        .labels
        .get(hash_label)
        .filter(|hash| !hash.is_empty())
        .and_then(|hash| name.strip_suffix(hash.as_str()))
        .and_then(|prefix| prefix.strip_suffix('-'))
        .unwrap_or(name)
        .to_string()
}

/// Annotates telemetry items with the name of the instance that produced them.
#[derive(Debug, Clone)]
pub struct Correlator {
    registry: Arc<InstanceRegistry>,
    hash_label: String,
}

impl Correlator {
    #[must_use]
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self::with_hash_label(registry, TEMPLATE_HASH_LABEL)
    }

    #[must_use]
    pub fn with_hash_label(registry: Arc<InstanceRegistry>, hash_label: impl Into<String>) -> Self {
        Self {
            registry,
            hash_label: hash_label.into(),
        }
    }

    /// Set `name` on the item from the instance owning its `container_id`.
    ///
    /// Returns [`Error::CorrelationMiss`] when the field is missing or no
    /// registered instance owns the id.
    pub fn correlate(&self, mut item: Map<String, Value>) -> Result<Map<String, Value>> {
        let container_id = item
            .get(CONTAINER_ID_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::CorrelationMiss(format!("item has no {CONTAINER_ID_FIELD}")))?;

        let record = self
            .registry
            .get_by_runtime_id(container_id)
            .ok_or_else(|| Error::CorrelationMiss(container_id.to_string()))?;

        item.insert(
            NAME_FIELD.to_string(),
            Value::String(logical_name(&record, &self.hash_label)),
        );
        Ok(item)
    }
}
