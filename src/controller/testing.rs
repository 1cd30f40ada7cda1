//! Fixtures for controller tests.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Namespace, PodTemplateSpec, Service},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{core::ErrorResponse, ResourceExt};
use parking_lot::Mutex;

use crate::{
    cluster::{ClusterClient, ClusterError},
    controller::Handler,
};

/// A Deployment with an identity label, an optional env label, and sidecar
/// injection turned on.
pub(crate) fn mk_deployment(
    namespace: &str,
    name: &str,
    identity: &str,
    env: Option<&str>,
) -> Deployment {
    let mut labels = BTreeMap::from([("identity".to_string(), identity.to_string())]);
    if let Some(env) = env {
        labels.insert("env".to_string(), env.to_string());
    }
    let annotations =
        BTreeMap::from([("sidecar.istio.io/inject".to_string(), "true".to_string())]);

    Deployment {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A Service, optionally labelled with an `app`.
pub(crate) fn mk_service(namespace: &str, name: &str, app: Option<&str>) -> Service {
    let labels = app.map(|app| BTreeMap::from([("app".to_string(), app.to_string())]));

    Service {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            labels,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn mk_namespace(name: &str, ignored: bool) -> Namespace {
    let annotations = ignored
        .then(|| BTreeMap::from([("admiral.io/ignore".to_string(), "true".to_string())]));

    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// An in-memory [ClusterClient]. Setting `unavailable` makes every request
/// fail.
#[derive(Default)]
pub(crate) struct FakeClusterClient {
    pub namespaces: Vec<Namespace>,
    pub deployments: Vec<Deployment>,
    pub services: Vec<Service>,
    pub unavailable: bool,
}

impl FakeClusterClient {
    fn check_available(&self) -> Result<(), ClusterError> {
        if !self.unavailable {
            return Ok(());
        }

        Err(ClusterError::Request(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the server is currently unable to handle the request".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        })))
    }
}

fn in_namespace<K: kube::Resource + Clone>(objs: &[K], namespace: &str) -> Vec<K> {
    objs.iter()
        .filter(|o| o.namespace().as_deref() == Some(namespace))
        .cloned()
        .collect()
}

impl ClusterClient for FakeClusterClient {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        self.check_available()?;
        Ok(self
            .namespaces
            .iter()
            .find(|ns| ns.name_any() == name)
            .cloned())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, ClusterError> {
        self.check_available()?;
        Ok(in_namespace(&self.deployments, namespace))
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        self.check_available()?;
        Ok(in_namespace(&self.services, namespace))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandlerEvent {
    Added(String),
    Updated(String),
    Deleted(String),
}

/// A [Handler] that remembers the name of everything it was called with.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    events: Mutex<Vec<HandlerEvent>>,
}

impl RecordingHandler {
    pub(crate) fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().clone()
    }
}

impl<K: kube::Resource> Handler<K> for RecordingHandler {
    fn added(&self, obj: &K) {
        self.events.lock().push(HandlerEvent::Added(obj.name_any()));
    }

    fn updated(&self, obj: &K) {
        self.events.lock().push(HandlerEvent::Updated(obj.name_any()));
    }

    fn deleted(&self, obj: &K) {
        self.events.lock().push(HandlerEvent::Deleted(obj.name_any()));
    }
}
