//! Kubernetes API writes and live reads used by the reconciler
//!
//! Reads of watched kinds go through the caches; everything that must hit the
//! API server goes through [`ClusterClient`] so it can be mocked in tests.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::habitat::{Habitat, HabitatStatus};

/// Cluster operations performed by the controller
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_stateful_set(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> Result<StatefulSet, ClientError>;

    /// Live read, bypassing the cache
    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, ClientError>;

    /// Replace; `sts` must carry the observed resourceVersion
    async fn replace_stateful_set(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> Result<StatefulSet, ClientError>;

    /// Delete with background propagation
    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    /// Delete every pod matching `selector`
    async fn delete_pods(&self, namespace: &str, selector: &str) -> Result<(), ClientError>;

    async fn create_config_map(
        &self,
        namespace: &str,
        cm: &ConfigMap,
    ) -> Result<ConfigMap, ClientError>;

    /// Live read, bypassing the cache
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClientError>;

    async fn replace_config_map(
        &self,
        namespace: &str,
        cm: &ConfigMap,
    ) -> Result<ConfigMap, ClientError>;

    /// Pods in phase Running matching `selector`
    async fn list_running_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Pod>, ClientError>;

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, ClientError>;

    async fn patch_habitat_status(
        &self,
        namespace: &str,
        name: &str,
        status: &HabitatStatus,
    ) -> Result<(), ClientError>;

    async fn create_event(&self, namespace: &str, event: &Event) -> Result<(), ClientError>;
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                ClientError::AlreadyExists(resp.message.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => ClientError::Conflict(resp.message.clone()),
            _ => ClientError::Kube(err),
        }
    }
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn stateful_sets(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    #[instrument(skip(self, sts))]
    async fn create_stateful_set(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> Result<StatefulSet, ClientError> {
        Ok(self
            .stateful_sets(namespace)
            .create(&PostParams::default(), sts)
            .await?)
    }

    #[instrument(skip(self))]
    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, ClientError> {
        Ok(self.stateful_sets(namespace).get_opt(name).await?)
    }

    #[instrument(skip(self, sts))]
    async fn replace_stateful_set(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> Result<StatefulSet, ClientError> {
        let name = sts.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .stateful_sets(namespace)
            .replace(name, &PostParams::default(), sts)
            .await?)
    }

    #[instrument(skip(self))]
    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.stateful_sets(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_pods(&self, namespace: &str, selector: &str) -> Result<(), ClientError> {
        self.pods(namespace)
            .delete_collection(&DeleteParams::default(), &ListParams::default().labels(selector))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, cm))]
    async fn create_config_map(
        &self,
        namespace: &str,
        cm: &ConfigMap,
    ) -> Result<ConfigMap, ClientError> {
        Ok(self
            .config_maps(namespace)
            .create(&PostParams::default(), cm)
            .await?)
    }

    #[instrument(skip(self))]
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClientError> {
        Ok(self.config_maps(namespace).get_opt(name).await?)
    }

    #[instrument(skip(self, cm))]
    async fn replace_config_map(
        &self,
        namespace: &str,
        cm: &ConfigMap,
    ) -> Result<ConfigMap, ClientError> {
        let name = cm.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .config_maps(namespace)
            .replace(name, &PostParams::default(), cm)
            .await?)
    }

    #[instrument(skip(self))]
    async fn list_running_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Pod>, ClientError> {
        let params = ListParams::default()
            .labels(selector)
            .fields("status.phase=Running");
        let pods = self.pods(namespace).list(&params).await?;
        debug!(count = pods.items.len(), "Listed running pods");
        Ok(pods.items)
    }

    #[instrument(skip(self))]
    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, ClientError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?.is_some())
    }

    #[instrument(skip(self, status))]
    async fn patch_habitat_status(
        &self,
        namespace: &str,
        name: &str,
        status: &HabitatStatus,
    ) -> Result<(), ClientError> {
        let api: Api<Habitat> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, event))]
    async fn create_event(&self, namespace: &str, event: &Event) -> Result<(), ClientError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_classify_not_found() {
        let err = ClientError::from(api_error(404, "NotFound"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_already_exists_vs_conflict() {
        assert!(ClientError::from(api_error(409, "AlreadyExists")).is_already_exists());
        assert!(ClientError::from(api_error(409, "Conflict")).is_conflict());
    }

    #[test]
    fn test_classify_other_errors() {
        let err = ClientError::from(api_error(500, "InternalError"));
        assert!(matches!(err, ClientError::Kube(_)));
        assert!(!err.is_not_found());
    }
}
