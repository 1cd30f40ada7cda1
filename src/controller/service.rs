use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::{
    cluster::{selector_matches, ClusterClient},
    controller::{namespace_ignored, Event, Handler, ServiceCache},
    k8s::EventHandler,
    labels::LabelSet,
};

const KIND: &str = "Service";

/// Keeps a [ServiceCache] in sync with the Services in one cluster.
pub struct ServiceController<C, H> {
    cluster: String,
    client: C,
    handler: H,
    labels: Arc<LabelSet>,
    cache: Arc<ServiceCache>,
}

impl<C: ClusterClient, H: Handler<Service>> ServiceController<C, H> {
    pub fn new(cluster: impl Into<String>, client: C, handler: H, labels: Arc<LabelSet>) -> Self {
        let cache = Arc::new(ServiceCache::new(labels.clone()));
        Self {
            cluster: cluster.into(),
            client,
            handler,
            labels,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<ServiceCache> {
        &self.cache
    }

    pub async fn added(&self, service: Arc<Service>) {
        self.add_or_update(service, Event::Added).await
    }

    pub async fn updated(&self, service: Arc<Service>) {
        self.add_or_update(service, Event::Updated).await
    }

    pub async fn deleted(&self, service: Arc<Service>) {
        let _timer = crate::metrics::scoped_timer!(
            "controller_event_time",
            "kind" => KIND,
            "event" => Event::Deleted.as_str()
        );

        self.cache.delete(&service);
        self.record_cache_size();
        self.notify(Event::Deleted, &service);
    }

    async fn add_or_update(&self, service: Arc<Service>, event: Event) {
        let _timer = crate::metrics::scoped_timer!(
            "controller_event_time",
            "kind" => KIND,
            "event" => event.as_str()
        );

        let Some(namespace) = service.metadata.namespace.as_deref() else {
            debug!(
                cluster = %self.cluster,
                name = %service.name_any(),
                "skipping service without a namespace",
            );
            return;
        };

        let namespace_ignored =
            namespace_ignored(&self.client, &self.labels, &self.cluster, Some(namespace)).await;

        if let Some(reason) = self.labels.service_ignore_reason(&service, namespace_ignored) {
            debug!(
                cluster = %self.cluster,
                %namespace,
                name = %service.name_any(),
                %reason,
                "ignoring service",
            );
            metrics::counter!("controller_ignored", "kind" => KIND, "reason" => reason.as_str())
                .increment(1);
            self.cache.delete(&service);
            self.record_cache_size();
            return;
        }

        if !self.cache.put(service.clone()) {
            return;
        }
        self.record_cache_size();

        self.notify(event, &service);
    }

    fn notify(&self, event: Event, service: &Service) {
        match event {
            Event::Added => self.handler.added(service),
            Event::Updated => self.handler.updated(service),
            Event::Deleted => self.handler.deleted(service),
        }
    }

    /// Resolve the address and port for the app `key` in `namespace`. See
    /// [ServiceCache::get_load_balancer].
    pub fn get_load_balancer(&self, key: &str, namespace: &str) -> (String, u16) {
        self.cache.get_load_balancer(key, namespace)
    }

    /// List the Services in `namespace` whose selector picks out pods with
    /// `pod_labels`, straight from the cluster.
    ///
    /// Lookup failures are logged and return an empty list.
    pub async fn get_services_for_labels_in_namespace(
        &self,
        pod_labels: &BTreeMap<String, String>,
        namespace: &str,
    ) -> Vec<Service> {
        let services = match self.client.list_services(namespace).await {
            Ok(services) => services,
            Err(e) => {
                warn!(cluster = %self.cluster, %namespace, err = %e, "failed to list services");
                return Vec::new();
            }
        };

        services
            .into_iter()
            .filter(|s| {
                s.spec
                    .as_ref()
                    .and_then(|spec| spec.selector.as_ref())
                    .is_some_and(|selector| selector_matches(selector, Some(pod_labels)))
            })
            .collect()
    }

    fn record_cache_size(&self) {
        metrics::gauge!("cache_identities", "kind" => KIND).set(self.cache.len() as f64);
    }
}

impl<C: ClusterClient, H: Handler<Service>> EventHandler<Service> for ServiceController<C, H> {
    async fn on_added(&self, obj: Arc<Service>) {
        self.added(obj).await
    }

    async fn on_updated(&self, _old: Arc<Service>, new: Arc<Service>) {
        self.updated(new).await
    }

    async fn on_deleted(&self, obj: Arc<Service>) {
        self.deleted(obj).await
    }
}
