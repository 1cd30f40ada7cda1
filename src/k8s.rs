//! Kubernetes watches.
//!
//! A watch keeps a reflector store of everything it has seen so it can tell
//! an add from an update, and hands each change to an [EventHandler] one at a
//! time, in the order the API server delivered them.

use std::{collections::HashSet, fmt::Debug, future::Future, sync::Arc};

use futures::TryStreamExt;
use k8s_openapi::{
    api::{apps::v1::Deployment, core::v1::Service},
    serde::Deserialize,
};
use kube::{
    runtime::{
        self,
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Resource, ResourceExt as _,
};
use tracing::{debug, trace, warn};

pub trait KubeResource:
    Clone + Debug + for<'de> Deserialize<'de> + Resource<DynamicType = ()> + Send + Sync + 'static
{
    fn static_kind() -> &'static str;

    fn modify(&mut self);

    fn has_changed(&self, other: &Self) -> bool;
}

macro_rules! check_changed {
    ($old:expr, $new:expr) => {
        if $old != $new {
            return true;
        }
    };
}

const LAST_APPLIED_CONFIG: &str = "kubectl.kubernetes.io/last-applied-configuration";

impl KubeResource for Deployment {
    fn static_kind() -> &'static str {
        <Deployment as k8s_openapi::Resource>::KIND
    }

    fn modify(&mut self) {
        self.annotations_mut().remove(LAST_APPLIED_CONFIG);
        self.managed_fields_mut().clear();
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.metadata.labels, other.metadata.labels);
        check_changed!(self.metadata.annotations, other.metadata.annotations);
        check_changed!(self.spec, other.spec);

        false
    }
}

impl KubeResource for Service {
    fn static_kind() -> &'static str {
        <Service as k8s_openapi::Resource>::KIND
    }

    fn modify(&mut self) {
        self.annotations_mut().remove(LAST_APPLIED_CONFIG);
        self.managed_fields_mut().clear();
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.metadata.labels, other.metadata.labels);
        check_changed!(self.metadata.annotations, other.metadata.annotations);
        check_changed!(self.spec, other.spec);
        // load balancer addresses live in status
        check_changed!(self.status, other.status);

        false
    }
}

/// Something that reacts to changes in a watched resource.
pub trait EventHandler<K>: Send + Sync + 'static {
    fn on_added(&self, obj: Arc<K>) -> impl Future<Output = ()> + Send;

    fn on_updated(&self, old: Arc<K>, new: Arc<K>) -> impl Future<Output = ()> + Send;

    fn on_deleted(&self, obj: Arc<K>) -> impl Future<Output = ()> + Send;
}

/// Watch `api` forever, passing every change to `handler`.
///
/// Watch errors are logged and retried with backoff.
pub async fn run_watch<K, H>(api: kube::Api<K>, handler: Arc<H>)
where
    K: KubeResource,
    H: EventHandler<K>,
{
    let (store, mut writer) = reflector::store();
    let stream = runtime::watcher(api, runtime::watcher::Config::default().any_semantic())
        .default_backoff()
        .modify(K::modify);
    let mut stream = std::pin::pin!(stream);

    debug!(kind = K::static_kind(), "watch starting");
    let mut relisted = Vec::new();
    loop {
        let event = match stream.try_next().await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                warn!(kind = K::static_kind(), err = %e, "watch failed, retrying");
                continue;
            }
        };

        handle_watch_event(&event, &store, &mut relisted, handler.as_ref()).await;
        writer.apply_watcher_event(&event);
    }

    debug!(kind = K::static_kind(), "watch exiting");
}

// the store must not have had `event` applied yet.
async fn handle_watch_event<K: KubeResource, H: EventHandler<K>>(
    event: &watcher::Event<K>,
    store: &Store<K>,
    relisted: &mut Vec<K>,
    handler: &H,
) {
    match event {
        watcher::Event::Apply(obj) => apply(obj, store, handler).await,
        watcher::Event::Delete(obj) => handler.on_deleted(Arc::new(obj.clone())).await,
        watcher::Event::Init => {
            trace!(kind = K::static_kind(), "watch restarted");
            relisted.clear();
        }
        watcher::Event::InitApply(obj) => relisted.push(obj.clone()),
        // on init, treat everything listed as applied and delete anything
        // the store still has that didn't come back.
        watcher::Event::InitDone => {
            let mut seen = HashSet::with_capacity(relisted.len());
            for obj in relisted.drain(..) {
                seen.insert(ObjectRef::from_obj(&obj));
                apply(&obj, store, handler).await;
            }

            for obj in store.state() {
                if !seen.contains(&ObjectRef::from_obj(obj.as_ref())) {
                    handler.on_deleted(obj).await;
                }
            }
        }
    }
}

// compare with the currently cached version of the object and only pass it
// on if there's a meaningful change.
async fn apply<K: KubeResource, H: EventHandler<K>>(obj: &K, store: &Store<K>, handler: &H) {
    let new = Arc::new(obj.clone());
    match store.get(&ObjectRef::from_obj(obj)) {
        Some(old) if !old.has_changed(obj) => {
            trace!(kind = K::static_kind(), name = %obj.name_any(), "skipping unchanged object");
        }
        Some(old) => handler.on_updated(old, new).await,
        None => handler.on_added(new).await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::testing::{mk_deployment, mk_service};
    use k8s_openapi::api::{
        apps::v1::DeploymentStatus,
        core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus},
    };
    use kube::ResourceExt;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn record(&self, event: &str, name: String) {
            self.events.lock().push(format!("{event}:{name}"));
        }
    }

    impl<K: Resource + Send + Sync + 'static> EventHandler<K> for Recorder {
        async fn on_added(&self, obj: Arc<K>) {
            self.record("added", obj.name_any());
        }

        async fn on_updated(&self, _old: Arc<K>, new: Arc<K>) {
            self.record("updated", new.name_any());
        }

        async fn on_deleted(&self, obj: Arc<K>) {
            self.record("deleted", obj.name_any());
        }
    }

    fn store_with<K: KubeResource>(objs: &[K]) -> Store<K> {
        let (store, mut writer) = reflector::store();
        for obj in objs {
            writer.apply_watcher_event(&watcher::Event::Apply(obj.clone()));
        }
        store
    }

    async fn handle_all<K: KubeResource>(
        store: &Store<K>,
        events: Vec<watcher::Event<K>>,
    ) -> Vec<String> {
        let recorder = Recorder::default();
        let mut relisted = Vec::new();
        for event in &events {
            handle_watch_event(event, store, &mut relisted, &recorder).await;
        }
        recorder.events()
    }

    fn with_hostname(mut svc: Service, hostname: &str) -> Service {
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    hostname: Some(hostname.to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        svc
    }

    #[tokio::test]
    async fn test_apply_unchanged() {
        let svc = mk_service("ns", "a", Some("a"));
        let store = store_with(&[svc.clone()]);

        let events = handle_all(&store, vec![watcher::Event::Apply(svc)]).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_apply_added() {
        let store = store_with(&[mk_service("ns", "a", Some("a"))]);

        let events = handle_all(
            &store,
            vec![watcher::Event::Apply(mk_service("ns", "b", Some("b")))],
        )
        .await;
        assert_eq!(events, vec!["added:b"]);
    }

    #[tokio::test]
    async fn test_apply_service_status_change() {
        let svc = mk_service("ns", "a", Some("a"));
        let store = store_with(&[svc.clone()]);

        let events = handle_all(
            &store,
            vec![watcher::Event::Apply(with_hostname(svc, "lb.example.com"))],
        )
        .await;
        assert_eq!(events, vec!["updated:a"]);
    }

    #[tokio::test]
    async fn test_apply_deployment_status_change() {
        let d = mk_deployment("ns", "a", "id", None);
        let store = store_with(&[d.clone()]);

        let mut with_status = d;
        with_status.status = Some(DeploymentStatus {
            ready_replicas: Some(3),
            ..Default::default()
        });

        let events = handle_all(&store, vec![watcher::Event::Apply(with_status)]).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let svc = mk_service("ns", "a", Some("a"));
        let store = store_with(&[svc.clone()]);

        let events = handle_all(&store, vec![watcher::Event::Delete(svc)]).await;
        assert_eq!(events, vec!["deleted:a"]);
    }

    #[tokio::test]
    async fn test_relist_deletes_missing() {
        let a = mk_service("ns", "a", Some("a"));
        let b = mk_service("ns", "b", Some("b"));
        let store = store_with(&[a.clone(), b]);

        let events = handle_all(
            &store,
            vec![
                watcher::Event::Init,
                watcher::Event::InitApply(a),
                watcher::Event::InitApply(mk_service("ns", "c", Some("c"))),
                watcher::Event::InitDone,
            ],
        )
        .await;
        assert_eq!(events, vec!["added:c", "deleted:b"]);
    }

    #[tokio::test]
    async fn test_relist_restarted() {
        let store = store_with(&[mk_service("ns", "a", Some("a"))]);

        // objects listed before a restart are forgotten
        let events = handle_all(
            &store,
            vec![
                watcher::Event::Init,
                watcher::Event::InitApply(mk_service("ns", "b", Some("b"))),
                watcher::Event::Init,
                watcher::Event::InitDone,
            ],
        )
        .await;
        assert_eq!(events, vec!["deleted:a"]);
    }
}
