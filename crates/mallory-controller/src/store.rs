//! Writes to the `EventResource` itself: finalizers and status

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use mallory_crd::{EventResource, EventStatus};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Persistence for the controller's own mutations
///
/// Both writes return the stored object so later writes in the same pass
/// carry a current `resourceVersion`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Replace the finalizer list, conditional on the observed `resourceVersion`
    async fn set_finalizers(
        &self,
        event: &EventResource,
        finalizers: Vec<String>,
    ) -> Result<EventResource>;

    /// Write the status subresource
    async fn set_status(
        &self,
        event: &EventResource,
        status: &EventStatus,
    ) -> Result<EventResource>;
}

/// `EventStore` over the cluster API
#[derive(Clone)]
pub struct KubeEventStore {
    client: Client,
}

impl KubeEventStore {
    /// Create store
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, event: &EventResource) -> Api<EventResource> {
        match event.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl EventStore for KubeEventStore {
    async fn set_finalizers(
        &self,
        event: &EventResource,
        finalizers: Vec<String>,
    ) -> Result<EventResource> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": event.resource_version(),
            }
        });
        self.api(event)
            .patch(&event.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::Persistence)
    }

    async fn set_status(
        &self,
        event: &EventResource,
        status: &EventStatus,
    ) -> Result<EventResource> {
        let patch = json!({ "status": status });
        self.api(event)
            .patch_status(&event.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::Persistence)
    }
}
