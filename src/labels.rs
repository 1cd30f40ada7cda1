//! Label and annotation policy.
//!
//! [LabelSet] is the only tunable surface of the controllers. It names the
//! labels and annotations used to derive a workload identity and environment
//! from a resource, and decides whether a resource should be ignored.

use std::collections::BTreeMap;

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Namespace, core::v1::Service};
use kube::ResourceExt;

/// The environment used when a Deployment doesn't name one.
pub const DEFAULT_ENV: &str = "default";

/// The port used for mesh-internal traffic when nothing more specific is
/// declared.
pub const DEFAULT_MTLS_PORT: u16 = 15443;

/// The names of every label and annotation the controllers read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSet {
    /// Pod template label holding the workload identity.
    pub identity_key: String,

    /// Pod template label (or annotation) holding the environment name.
    pub env_key: String,

    /// Pod template label that excludes a workload when set to `"true"`.
    pub ignore_label: String,

    /// Annotation that excludes a resource or a whole namespace when set to
    /// `"true"`.
    pub ignore_annotation: String,

    /// Pod template annotation that must be `"true"` for a Deployment to be
    /// cached. `None` turns the check off.
    pub sidecar_inject_annotation: Option<String>,

    /// Service label matched against the key passed to the address resolver.
    pub app_key: String,

    pub default_mtls_port: u16,
}

impl Default for LabelSet {
    fn default() -> Self {
        Self {
            identity_key: "identity".to_string(),
            env_key: "env".to_string(),
            ignore_label: "admiral-ignore".to_string(),
            ignore_annotation: "admiral.io/ignore".to_string(),
            sidecar_inject_annotation: Some("sidecar.istio.io/inject".to_string()),
            app_key: "app".to_string(),
            default_mtls_port: DEFAULT_MTLS_PORT,
        }
    }
}

/// Why a resource was left out of the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The resource's namespace carries the ignore annotation.
    Namespace,
    /// The resource (or its pod template) carries the ignore annotation.
    Annotation,
    /// The resource (or its pod template) carries the ignore label.
    Label,
    /// The pod template doesn't opt in to sidecar injection.
    NotInjected,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::Namespace => "namespace",
            IgnoreReason::Annotation => "annotation",
            IgnoreReason::Label => "label",
            IgnoreReason::NotInjected => "not-injected",
        }
    }
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Look up a boolean flag.
///
/// Returns `None` if the key is absent, `Some(true)` only for the exact value
/// `"true"`, and `Some(false)` for anything else.
pub fn flag(values: Option<&BTreeMap<String, String>>, key: &str) -> Option<bool> {
    values.and_then(|m| m.get(key)).map(|v| v == "true")
}

fn is_set(values: Option<&BTreeMap<String, String>>, key: &str) -> bool {
    flag(values, key).unwrap_or(false)
}

fn template_labels(deployment: &Deployment) -> Option<&BTreeMap<String, String>> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.as_ref())
}

fn template_annotations(deployment: &Deployment) -> Option<&BTreeMap<String, String>> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
}

impl LabelSet {
    /// The workload identity of a Deployment, read from its pod template.
    ///
    /// Empty values count as absent.
    pub fn deployment_identity(&self, deployment: &Deployment) -> Option<String> {
        template_labels(deployment)
            .and_then(|l| l.get(&self.identity_key))
            .filter(|id| !id.is_empty())
            .cloned()
    }

    /// The environment a Deployment belongs to.
    ///
    /// Tries the pod template label, then the pod template annotation, then
    /// the last segment of a dotted namespace name, and finally falls back to
    /// [DEFAULT_ENV].
    pub fn deployment_env(&self, deployment: &Deployment) -> String {
        let from_meta = |m: Option<&BTreeMap<String, String>>| {
            m.and_then(|m| m.get(&self.env_key))
                .filter(|e| !e.is_empty())
                .cloned()
        };

        from_meta(template_labels(deployment))
            .or_else(|| from_meta(template_annotations(deployment)))
            .or_else(|| {
                let namespace = deployment.metadata.namespace.as_deref()?;
                match namespace.rsplit_once('.') {
                    Some((_, env)) if !env.is_empty() => Some(env.to_string()),
                    _ => None,
                }
            })
            .unwrap_or_else(|| DEFAULT_ENV.to_string())
    }

    /// Returns true if a Namespace carries the ignore annotation.
    pub fn namespace_ignored(&self, namespace: &Namespace) -> bool {
        is_set(
            namespace.metadata.annotations.as_ref(),
            &self.ignore_annotation,
        )
    }

    /// Decide whether a Deployment should be kept out of the cache.
    ///
    /// `namespace_ignored` must already be resolved by the caller. Sources are
    /// checked in order and the first match wins.
    pub fn deployment_ignore_reason(
        &self,
        deployment: &Deployment,
        namespace_ignored: bool,
    ) -> Option<IgnoreReason> {
        if namespace_ignored {
            return Some(IgnoreReason::Namespace);
        }

        if is_set(
            deployment.metadata.annotations.as_ref(),
            &self.ignore_annotation,
        ) || is_set(template_annotations(deployment), &self.ignore_annotation)
        {
            return Some(IgnoreReason::Annotation);
        }

        if is_set(template_labels(deployment), &self.ignore_label) {
            return Some(IgnoreReason::Label);
        }

        if let Some(inject) = &self.sidecar_inject_annotation {
            if !is_set(template_annotations(deployment), inject) {
                return Some(IgnoreReason::NotInjected);
            }
        }

        None
    }

    pub fn should_ignore_deployment(
        &self,
        deployment: &Deployment,
        namespace_ignored: bool,
    ) -> bool {
        self.deployment_ignore_reason(deployment, namespace_ignored).is_some()
    }

    /// Decide whether a Service should be kept out of the cache.
    ///
    /// Services have no pod template, so only object-level metadata is read.
    /// The ignore annotation key is honored as a label too.
    pub fn service_ignore_reason(
        &self,
        service: &Service,
        namespace_ignored: bool,
    ) -> Option<IgnoreReason> {
        if namespace_ignored {
            return Some(IgnoreReason::Namespace);
        }

        if is_set(service.metadata.annotations.as_ref(), &self.ignore_annotation) {
            return Some(IgnoreReason::Annotation);
        }

        let labels = service.metadata.labels.as_ref();
        if is_set(labels, &self.ignore_annotation) || is_set(labels, &self.ignore_label) {
            return Some(IgnoreReason::Label);
        }

        None
    }

    pub fn should_ignore_service(&self, service: &Service, namespace_ignored: bool) -> bool {
        self.service_ignore_reason(service, namespace_ignored).is_some()
    }

    /// Returns true if `service` is labelled as the app named `key`.
    pub(crate) fn service_matches_app(&self, service: &Service, key: &str) -> bool {
        service.labels().get(&self.app_key).map(String::as_str) == Some(key)
    }
}
