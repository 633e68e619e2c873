//! Module operations over the instance fleet
//!
//! Binds each module-service operation to its merge policy: `apply`, `delete`
//! and `get` are unary broadcasts; `list`, `watch_data` and `watch_log` are
//! streaming broadcasts. `watch_data` items additionally go through the
//! [`Correlator`] when the gateway is backed by a registry.

use base64::Engine as _;
use fleetcast_proto::{
    list_request, ApplyRequest, ApplyResponse, DeleteRequest, DeleteResponse, GetRequest,
    GetResponse, LabelSelector, ListRequest, Module, ModuleCore, WatchDataRequest,
    WatchDataResponse, WatchLogRequest, WatchLogResponse,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broadcast::{BroadcastGateway, BroadcastResult};
use super::caller::ModuleCaller;
use super::correlation::Correlator;
use super::fan_in::MergedStream;
use crate::discovery::InstanceKey;
use crate::error::{Error, Result};

/// One telemetry record, annotated with its owning instance name when correlated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchDataEvent {
    pub data: Map<String, Value>,
}

/// Fleet-wide module operations.
pub struct ModuleGateway {
    broadcast: BroadcastGateway,
    caller: Arc<dyn ModuleCaller>,
    correlator: Option<Correlator>,
    shutdown: CancellationToken,
}

impl ModuleGateway {
    /// Create a gateway. Telemetry is correlated against the broadcast registry
    /// if there is one; a static target source forwards telemetry as received.
    #[must_use]
    pub fn new(broadcast: BroadcastGateway, caller: Arc<dyn ModuleCaller>) -> Self {
        let correlator = broadcast
            .targets()
            .registry_handle()
            .map(|registry| Correlator::new(registry.clone()));

        Self {
            broadcast,
            caller,
            correlator,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the correlator (e.g. to use a different template-hash label).
    #[must_use]
    pub fn with_correlator(mut self, correlator: Correlator) -> Self {
        self.correlator = Some(correlator);
        self
    }

    #[must_use]
    pub const fn broadcast(&self) -> &BroadcastGateway {
        &self.broadcast
    }

    /// Apply `module` under `name` on every instance.
    ///
    /// An empty `core.name` in the module is filled with `name`; a different
    /// non-empty one is rejected.
    pub async fn apply(&self, name: &str, mut module: Module) -> Result<BroadcastResult<ApplyResponse>> {
        let name = require_name(name)?;
        let core = module.core.get_or_insert_with(ModuleCore::default);
        if core.name.is_empty() {
            core.name = name.to_string();
        } else if core.name != name {
            return Err(Error::MalformedRequest(format!(
                "module name {:?} does not match path name {name:?}",
                core.name
            )));
        }

        info!(module = %name, "Applying module");
        let request = ApplyRequest { data: Some(module) };
        let caller = self.caller.as_ref();
        Ok(self
            .broadcast
            .broadcast("apply", |endpoint| {
                let request = request.clone();
                async move { caller.apply(&endpoint, request).await }
            })
            .await)
    }

    pub async fn delete(&self, name: &str) -> Result<BroadcastResult<DeleteResponse>> {
        let name = require_name(name)?;
        info!(module = %name, "Deleting module");
        let request = DeleteRequest {
            core: Some(core_named(name)),
        };
        let caller = self.caller.as_ref();
        Ok(self
            .broadcast
            .broadcast("delete", |endpoint| {
                let request = request.clone();
                async move { caller.delete(&endpoint, request).await }
            })
            .await)
    }

    pub async fn get(&self, name: &str) -> Result<BroadcastResult<GetResponse>> {
        let name = require_name(name)?;
        let request = GetRequest {
            core: Some(core_named(name)),
        };
        let caller = self.caller.as_ref();
        Ok(self
            .broadcast
            .broadcast("get", |endpoint| {
                let request = request.clone();
                async move { caller.get(&endpoint, request).await }
            })
            .await)
    }

    /// Stream the modules matching `selector` from every instance.
    pub fn list(&self, selector: HashMap<String, String>) -> Result<MergedStream<GetResponse>> {
        if selector.is_empty() {
            return Err(Error::MalformedRequest(
                "at least one label selector is required".to_string(),
            ));
        }

        let request = ListRequest {
            filter: Some(list_request::Filter::Label(LabelSelector { selector })),
        };
        let caller = self.caller.clone();
        Ok(self.broadcast.broadcast_stream(
            "list",
            move |endpoint| {
                let caller = caller.clone();
                let request = request.clone();
                async move { caller.list(&endpoint, request).await }
            },
            |_, item| Some(item),
            &self.shutdown,
        ))
    }

    /// Stream telemetry of module `name` from every instance.
    pub fn watch_data(&self, name: &str) -> Result<MergedStream<WatchDataEvent>> {
        let name = require_name(name)?;
        let request = WatchDataRequest {
            filter: Some(core_named(name)),
        };
        let caller = self.caller.clone();
        let correlator = self.correlator.clone();

        Ok(self.broadcast.broadcast_stream(
            "watch_data",
            move |endpoint| {
                let caller = caller.clone();
                let request = request.clone();
                async move { caller.watch_data(&endpoint, request).await }
            },
            move |instance, item| telemetry_event(correlator.as_ref(), instance, &item),
            &self.shutdown,
        ))
    }

    /// Stream log lines of module `name` from every instance.
    pub fn watch_log(&self, name: &str) -> Result<MergedStream<String>> {
        let name = require_name(name)?;
        let request = WatchLogRequest {
            filter: Some(core_named(name)),
        };
        let caller = self.caller.clone();

        Ok(self.broadcast.broadcast_stream(
            "watch_log",
            move |endpoint| {
                let caller = caller.clone();
                let request = request.clone();
                async move { caller.watch_log(&endpoint, request).await }
            },
            |instance, item| Some(decode_log_line(instance, &item)),
            &self.shutdown,
        ))
    }

    /// End every open merged stream.
    pub fn shutdown(&self) {
        debug!("Cancelling open module streams");
        self.shutdown.cancel();
    }
}

fn require_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::MalformedRequest("module name is required".to_string()));
    }
    Ok(name)
}

fn core_named(name: &str) -> ModuleCore {
    ModuleCore {
        name: name.to_string(),
        ..Default::default()
    }
}

fn telemetry_event(
    correlator: Option<&Correlator>,
    instance: &InstanceKey,
    item: &WatchDataResponse,
) -> Option<WatchDataEvent> {
    let data = match serde_json::from_slice::<Map<String, Value>>(&item.data) {
        Ok(data) => data,
        Err(e) => {
            warn!(instance = %instance, error = %e, "Dropping telemetry item that is not a JSON object");
            return None;
        }
    };

    let Some(correlator) = correlator else {
        return Some(WatchDataEvent { data });
    };

    match correlator.correlate(data) {
        Ok(data) => Some(WatchDataEvent { data }),
        Err(e) => {
            warn!(instance = %instance, error = %e, "Dropping uncorrelated telemetry item");
            None
        }
    }
}

fn decode_log_line(instance: &InstanceKey, item: &WatchLogResponse) -> String {
    match base64::engine::general_purpose::STANDARD.decode(&item.data) {
        Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
        Err(e) => {
            warn!(instance = %instance, error = %e, "Failed to decode log line");
            String::from_utf8_lossy(&item.data).into_owned()
        }
    }
}
