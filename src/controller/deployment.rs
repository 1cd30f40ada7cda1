use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::{
    cluster::{selector_matches, ClusterClient, Selector},
    controller::{namespace_ignored, DeploymentCache, Event, Handler},
    k8s::EventHandler,
    labels::LabelSet,
};

const KIND: &str = "Deployment";

/// Keeps a [DeploymentCache] in sync with the Deployments in one cluster.
pub struct DeploymentController<C, H> {
    cluster: String,
    client: C,
    handler: H,
    labels: Arc<LabelSet>,
    cache: Arc<DeploymentCache>,
}

impl<C: ClusterClient, H: Handler<Deployment>> DeploymentController<C, H> {
    pub fn new(cluster: impl Into<String>, client: C, handler: H, labels: Arc<LabelSet>) -> Self {
        let cache = Arc::new(DeploymentCache::new(labels.clone()));
        Self {
            cluster: cluster.into(),
            client,
            handler,
            labels,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<DeploymentCache> {
        &self.cache
    }

    pub async fn added(&self, deployment: Arc<Deployment>) {
        self.add_or_update(deployment, Event::Added).await
    }

    /// Handle an update. Ignore status is worked out from scratch, exactly as
    /// for [added](Self::added).
    pub async fn updated(&self, deployment: Arc<Deployment>) {
        self.add_or_update(deployment, Event::Updated).await
    }

    /// Handle an update where the previous version is known. If the update
    /// moved the Deployment to another identity or env, the entry under the
    /// old key is removed before `new` is handled.
    pub async fn updated_from(&self, old: Arc<Deployment>, new: Arc<Deployment>) {
        let moved = self.labels.deployment_identity(&old) != self.labels.deployment_identity(&new)
            || self.labels.deployment_env(&old) != self.labels.deployment_env(&new);

        if moved && self.cache.delete(&old) {
            debug!(
                cluster = %self.cluster,
                namespace = ?old.namespace(),
                name = %old.name_any(),
                from = %self.cache.get_key(&old),
                to = %self.cache.get_key(&new),
                "deployment moved, removed stale entry",
            );
            self.record_cache_size();
        }
        self.updated(new).await
    }

    /// Remove a Deployment from the cache and tell the handler, whether or not
    /// it was cached.
    pub async fn deleted(&self, deployment: Arc<Deployment>) {
        let _timer = crate::metrics::scoped_timer!(
            "controller_event_time",
            "kind" => KIND,
            "event" => Event::Deleted.as_str()
        );

        if self.labels.deployment_identity(&deployment).is_some() {
            self.cache.delete(&deployment);
            self.record_cache_size();
        }
        self.notify(Event::Deleted, &deployment);
    }

    async fn add_or_update(&self, deployment: Arc<Deployment>, event: Event) {
        let _timer = crate::metrics::scoped_timer!(
            "controller_event_time",
            "kind" => KIND,
            "event" => event.as_str()
        );

        let Some(identity) = self.labels.deployment_identity(&deployment) else {
            debug!(
                cluster = %self.cluster,
                namespace = ?deployment.namespace(),
                name = %deployment.name_any(),
                "skipping deployment without an identity",
            );
            return;
        };

        // resolve this before touching the cache, the cache lock is never held
        // across a cluster request.
        let namespace_ignored = namespace_ignored(
            &self.client,
            &self.labels,
            &self.cluster,
            deployment.metadata.namespace.as_deref(),
        )
        .await;

        if let Some(reason) = self
            .labels
            .deployment_ignore_reason(&deployment, namespace_ignored)
        {
            debug!(
                cluster = %self.cluster,
                namespace = ?deployment.namespace(),
                name = %deployment.name_any(),
                %identity,
                %reason,
                "ignoring deployment",
            );
            metrics::counter!("controller_ignored", "kind" => KIND, "reason" => reason.as_str())
                .increment(1);
            self.cache.delete(&deployment);
            self.record_cache_size();
            return;
        }

        // a newer Deployment already holds this identity and env
        if !self.cache.put(deployment.clone()) {
            debug!(
                cluster = %self.cluster,
                namespace = ?deployment.namespace(),
                name = %deployment.name_any(),
                %identity,
                "deployment not cached, a newer one holds its key",
            );
            return;
        }
        self.record_cache_size();

        self.notify(event, &deployment);
    }

    fn notify(&self, event: Event, deployment: &Deployment) {
        match event {
            Event::Added => self.handler.added(deployment),
            Event::Updated => self.handler.updated(deployment),
            Event::Deleted => self.handler.deleted(deployment),
        }
    }

    /// List the Deployments in `namespace` whose selector matches every label
    /// in `selector`, straight from the cluster.
    ///
    /// Lookup failures are logged and return an empty list.
    pub async fn get_deployment_by_selector_in_namespace(
        &self,
        selector: &Selector,
        namespace: &str,
    ) -> Vec<Deployment> {
        let deployments = match self.client.list_deployments(namespace).await {
            Ok(deployments) => deployments,
            Err(e) => {
                warn!(cluster = %self.cluster, %namespace, err = %e, "failed to list deployments");
                return Vec::new();
            }
        };

        deployments
            .into_iter()
            .filter(|d| {
                let match_labels = d.spec.as_ref().and_then(|s| s.selector.match_labels.as_ref());
                selector_matches(selector, match_labels)
            })
            .collect()
    }

    fn record_cache_size(&self) {
        metrics::gauge!("cache_identities", "kind" => KIND).set(self.cache.len() as f64);
    }
}

impl<C: ClusterClient, H: Handler<Deployment>> EventHandler<Deployment>
    for DeploymentController<C, H>
{
    async fn on_added(&self, obj: Arc<Deployment>) {
        self.added(obj).await
    }

    async fn on_updated(&self, old: Arc<Deployment>, new: Arc<Deployment>) {
        self.updated_from(old, new).await
    }

    async fn on_deleted(&self, obj: Arc<Deployment>) {
        self.deleted(obj).await
    }
}
