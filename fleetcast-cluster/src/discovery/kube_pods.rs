//! Kubernetes Pod watch as a lifecycle feed
//!
//! Watches Pods (optionally in one namespace and filtered by a label selector)
//! and turns watcher events into [`LifecycleEvent`]s. Pods that cannot be keyed
//! (missing name or namespace) are ignored. Watch errors are logged and the
//! watch keeps going with the default backoff.

use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client,
};

use super::events::{LifecycleEvent, LifecycleFeed};
use super::instance_registry::{InstanceKey, InstanceRecord};
use crate::error::{Error, Result};

/// Pod watch configuration
#[derive(Debug, Clone, Default)]
pub struct KubePodFeedConfig {
    /// Namespace to watch; `None` watches all namespaces.
    pub namespace: Option<String>,
    /// Kubernetes label selector (e.g. `app=hyperion`); empty watches every Pod.
    pub label_selector: String,
}

/// Lifecycle feed over a Kubernetes Pod watch.
pub struct KubePodFeed {
    api: Api<Pod>,
    config: KubePodFeedConfig,
}

impl KubePodFeed {
    /// Build a feed using the ambient kubeconfig or in-cluster service account.
    pub async fn try_default(config: KubePodFeedConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Kubernetes(format!("Failed to create k8s client: {e}")))?;
        Ok(Self::new(client, config))
    }

    #[must_use]
    pub fn new(client: Client, config: KubePodFeedConfig) -> Self {
        let api = match &config.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self { api, config }
    }
}

impl LifecycleFeed for KubePodFeed {
    fn subscribe(self) -> BoxStream<'static, LifecycleEvent> {
        let mut watch_config = watcher::Config::default();
        if !self.config.label_selector.is_empty() {
            watch_config = watch_config.labels(&self.config.label_selector);
        }

        tracing::info!(
            namespace = self.config.namespace.as_deref().unwrap_or("<all>"),
            labels = %self.config.label_selector,
            "Starting Pod watch"
        );

        watcher(self.api, watch_config)
            .default_backoff()
            .flat_map(|result| {
                let events = match result {
                    Ok(event) => pod_event_to_lifecycle(event),
                    Err(e) => {
                        tracing::warn!(error = %e, "Pod watch error, continuing");
                        Vec::new()
                    }
                };
                stream::iter(events)
            })
            .boxed()
    }
}

fn pod_event_to_lifecycle(event: watcher::Event<Pod>) -> Vec<LifecycleEvent> {
    match event {
        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
            record_from_pod(&pod).map(LifecycleEvent::Added).into_iter().collect()
        }
        watcher::Event::Delete(pod) => key_from_pod(&pod)
            .map(LifecycleEvent::Removed)
            .into_iter()
            .collect(),
        watcher::Event::Init | watcher::Event::InitDone => Vec::new(),
    }
}

fn key_from_pod(pod: &Pod) -> Option<InstanceKey> {
    let name = pod.metadata.name.as_ref()?;
    let namespace = pod.metadata.namespace.as_ref()?;
    Some(InstanceKey::new(namespace.clone(), name.clone()))
}

/// Convert a Pod into an instance record; `None` when the Pod cannot be keyed.
pub fn record_from_pod(pod: &Pod) -> Option<InstanceRecord> {
    let key = key_from_pod(pod)?;
    let mut record = InstanceRecord::new(key);

    if let Some(labels) = &pod.metadata.labels {
        record.labels = labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }

    if let Some(spec) = &pod.spec {
        record.ports = spec
            .containers
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .filter_map(|p| u16::try_from(p.container_port).ok())
            .collect();
    }

    if let Some(status) = &pod.status {
        record.address = status.pod_ip.clone().unwrap_or_default();
        record.runtime_ids = status
            .container_statuses
            .iter()
            .flatten()
            .filter_map(|cs| cs.container_id.clone())
            .collect();
    }

    Some(record)
}
