//! Direct access to a cluster's API server.
//!
//! Controllers only read through [ClusterClient] for things the watches
//! don't cover: Namespace metadata and cache-bypassing list queries.

use std::{collections::BTreeMap, future::Future};

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Namespace, Service},
};
use kube::{api::ListParams, Api};

/// A set of `key=value` label requirements. Every pair must match.
pub type Selector = BTreeMap<String, String>;

/// An error talking to a cluster.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("failed to build cluster client: {0}")]
    Client(#[source] kube::Error),

    #[error("cluster request failed: {0}")]
    Request(#[from] kube::Error),
}

/// The cluster lookups a controller needs.
pub trait ClusterClient: Send + Sync + 'static {
    /// Fetch a Namespace. Returns `Ok(None)` if it doesn't exist.
    fn get_namespace(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Namespace>, ClusterError>> + Send;

    /// List every Deployment in a namespace.
    fn list_deployments(
        &self,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<Deployment>, ClusterError>> + Send;

    /// List every Service in a namespace.
    fn list_services(
        &self,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<Service>, ClusterError>> + Send;
}

/// Returns true if every requirement in `selector` is met by `labels`.
///
/// An empty selector matches nothing.
pub fn selector_matches(selector: &Selector, labels: Option<&BTreeMap<String, String>>) -> bool {
    let Some(labels) = labels else {
        return false;
    };

    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// A [ClusterClient] backed by a kube API client.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
}

impl KubeClusterClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Build a client from the local kubeconfig or the in-cluster service
    /// account.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = kube::Client::try_default()
            .await
            .map_err(ClusterError::Client)?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }
}

impl ClusterClient for KubeClusterClient {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }
}
