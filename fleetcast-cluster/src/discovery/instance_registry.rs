//! Instance registry for module fleet discovery
//!
//! Keeps the last known state of every module instance, keyed by
//! `(namespace, name)`. Writers are the lifecycle synchronizer; readers are the
//! broadcast gateway (endpoint resolution) and the telemetry correlator.
//!
//! Label and runtime-id lookups scan every record. That is fine for the tens to
//! low hundreds of instances a module fleet runs; it is the scalability bound of
//! this registry.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::{Error, Result};

/// Separator between the scheme and the id in a runtime identifier (`docker://abc`).
const RUNTIME_ID_SEPARATOR: &str = "://";

/// Unique identity of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub namespace: String,
    pub name: String,
}

impl InstanceKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One running workload instance of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub key: InstanceKey,
    /// Host or IP; empty until the scheduler assigns one.
    pub address: String,
    /// Declared ports in container declaration order.
    pub ports: Vec<u16>,
    pub labels: HashMap<String, String>,
    /// Runtime identifiers in `<scheme>://<id>` form.
    pub runtime_ids: BTreeSet<String>,
}

impl InstanceRecord {
    #[must_use]
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            address: String::new(),
            ports: Vec::new(),
            labels: HashMap::new(),
            runtime_ids: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    #[must_use]
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_runtime_id(mut self, id: impl Into<String>) -> Self {
        self.runtime_ids.insert(id.into());
        self
    }

    /// Endpoint of the instance: its address joined with the first declared port.
    pub fn endpoint(&self) -> Result<String> {
        let Some(port) = self.ports.first() else {
            return Err(Error::NoEndpoint(self.key.clone()));
        };

        if self.address.is_empty() {
            return Err(Error::NoEndpoint(self.key.clone()));
        }

        Ok(format!("{}:{}", self.address, port))
    }

    /// Whether every entry of `selector` is present in this record's labels with an equal value.
    #[must_use]
    pub fn matches_labels(&self, selector: &HashMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|own| own == v))
    }

    /// Whether one of the runtime ids, with its scheme stripped, equals `id`.
    #[must_use]
    pub fn owns_runtime_id(&self, id: &str) -> bool {
        self.runtime_ids
            .iter()
            .filter_map(|rid| strip_runtime_scheme(rid))
            .any(|bare| bare == id)
    }
}

/// Strip the `<scheme>://` prefix of a runtime id.
///
/// Only ids of exactly the form `<scheme>://<id>` are accepted; ids without a
/// scheme or with more than one separator are rejected.
fn strip_runtime_scheme(id: &str) -> Option<&str> {
    let mut parts = id.split(RUNTIME_ID_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(bare), None) => Some(bare),
        _ => None,
    }
}

/// Concurrent-safe store of instance records.
///
/// Reads take a shared lock and never block each other; mutations take the
/// exclusive lock. The lock is never held across an await point, so callers
/// always work on cloned records.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    records: RwLock<HashMap<InstanceKey, InstanceRecord>>,
}

impl InstanceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the record, or replace the one stored under the same key wholesale.
    pub fn upsert(&self, record: InstanceRecord) {
        tracing::debug!(
            instance = %record.key,
            address = %record.address,
            ports = ?record.ports,
            runtime_ids = ?record.runtime_ids,
            "Instance upserted"
        );

        let mut records = self.records.write();
        records.insert(record.key.clone(), record);
    }

    /// Remove the record at `key`; absent keys are a no-op.
    pub fn delete(&self, key: &InstanceKey) {
        let removed = self.records.write().remove(key);
        if removed.is_some() {
            tracing::debug!(instance = %key, "Instance removed");
        }
    }

    #[must_use]
    pub fn get(&self, key: &InstanceKey) -> Option<InstanceRecord> {
        self.records.read().get(key).cloned()
    }

    /// Every record whose labels are a superset of `selector`. An empty selector matches all.
    #[must_use]
    pub fn get_by_labels(&self, selector: &HashMap<String, String>) -> Vec<InstanceRecord> {
        self.records
            .read()
            .values()
            .filter(|record| record.matches_labels(selector))
            .cloned()
            .collect()
    }

    /// The first record owning runtime id `id` (given without its scheme).
    #[must_use]
    pub fn get_by_runtime_id(&self, id: &str) -> Option<InstanceRecord> {
        self.records
            .read()
            .values()
            .find(|record| record.owns_runtime_id(id))
            .cloned()
    }

    /// Resolve a record to its `address:port` endpoint.
    ///
    /// Fails with `NoEndpoint` when the record has no ports or no address yet.
    pub fn resolve(record: &InstanceRecord) -> Result<String> {
        record.endpoint()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
