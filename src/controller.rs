//! Per-kind controllers and the caches they own.
//!
//! A controller turns watch events into cache updates, applying the ignore
//! policy from [LabelSet](crate::labels::LabelSet) on every add and update,
//! and then tells a downstream [Handler] what happened.

mod cache;
mod deployment;
mod resolve;
mod select;
mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{
    ClusterEntry, DeploymentCache, DeploymentClusterEntry, ServiceCache, ServiceClusterEntry,
};
pub use deployment::DeploymentController;
pub use resolve::DEFAULT_LOAD_BALANCER;
pub use select::{by_creation_desc, ordered_by_creation};
pub use service::ServiceController;

use kube::ResourceExt;
use tracing::{debug, warn};

use crate::{cluster::ClusterClient, labels::LabelSet};

/// Reacts to changes in a controller's cache.
///
/// Handlers are called synchronously, after the cache has been updated. A
/// handler that fails has to deal with it itself, the cache is never rolled
/// back.
pub trait Handler<K>: Send + Sync + 'static {
    fn added(&self, obj: &K);

    fn updated(&self, obj: &K);

    fn deleted(&self, obj: &K);
}

/// A [Handler] that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogHandler;

impl<K: kube::Resource> Handler<K> for LogHandler {
    fn added(&self, obj: &K) {
        debug!(namespace = ?obj.namespace(), name = %obj.name_any(), "added");
    }

    fn updated(&self, obj: &K) {
        debug!(namespace = ?obj.namespace(), name = %obj.name_any(), "updated");
    }

    fn deleted(&self, obj: &K) {
        debug!(namespace = ?obj.namespace(), name = %obj.name_any(), "deleted");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Event {
    Added,
    Updated,
    Deleted,
}

impl Event {
    fn as_str(&self) -> &'static str {
        match self {
            Event::Added => "added",
            Event::Updated => "updated",
            Event::Deleted => "deleted",
        }
    }
}

/// Look up whether a namespace is ignored.
///
/// Lookup failures and missing namespaces count as not ignored, so a broken
/// API server can't drop an event.
async fn namespace_ignored<C: ClusterClient>(
    client: &C,
    labels: &LabelSet,
    cluster: &str,
    namespace: Option<&str>,
) -> bool {
    let Some(namespace) = namespace else {
        return false;
    };

    match client.get_namespace(namespace).await {
        Ok(Some(ns)) => labels.namespace_ignored(&ns),
        Ok(None) => false,
        Err(e) => {
            warn!(
                %cluster,
                %namespace,
                err = %e,
                "failed to get namespace, assuming it is not ignored",
            );
            false
        }
    }
}
