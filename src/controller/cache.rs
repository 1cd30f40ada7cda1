use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::ResourceExt;
use parking_lot::Mutex;

use crate::{
    controller::select::{keep_existing, ordered_by_creation},
    labels::LabelSet,
};

/// Everything a cache knows about one identity.
///
/// `resources` is keyed by the secondary key of the cache: the environment for
/// Deployments and the namespace for Services. There is never more than one
/// value per secondary key.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterEntry<T> {
    pub identity: String,
    pub resources: HashMap<String, T>,
}

impl<T> ClusterEntry<T> {
    fn new(identity: String) -> Self {
        Self {
            identity,
            resources: HashMap::new(),
        }
    }
}

pub type DeploymentClusterEntry = ClusterEntry<Arc<Deployment>>;

/// Services grouped by name, so that several Services can share a namespace.
pub type ServiceClusterEntry = ClusterEntry<BTreeMap<String, Arc<Service>>>;

fn same_object<K: kube::Resource>(a: &K, b: &K) -> bool {
    a.namespace() == b.namespace() && a.name_any() == b.name_any()
}

/// A cache of Deployments, keyed by identity and then by environment.
///
/// Every method holds the cache lock for its full duration and never calls
/// another locking method while holding it. Stored Deployments are never
/// modified in place, a new value always replaces the old [Arc].
pub struct DeploymentCache {
    labels: Arc<LabelSet>,
    entries: Mutex<HashMap<String, DeploymentClusterEntry>>,
}

impl DeploymentCache {
    pub fn new(labels: Arc<LabelSet>) -> Self {
        Self {
            labels,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The secondary key a Deployment is stored under.
    pub fn get_key(&self, deployment: &Deployment) -> String {
        self.labels.deployment_env(deployment)
    }

    /// Add or replace a Deployment.
    ///
    /// Deployments without an identity or ignored by their own labels and
    /// annotations are not stored. This never removes an existing value,
    /// callers that need to evict should [delete](Self::delete).
    ///
    /// Returns true if `deployment` is now the stored value for its key.
    pub fn put(&self, deployment: Arc<Deployment>) -> bool {
        let Some(identity) = self.labels.deployment_identity(&deployment) else {
            return false;
        };
        if self.labels.should_ignore_deployment(&deployment, false) {
            return false;
        }
        let env = self.get_key(&deployment);

        let mut entries = self.entries.lock();
        let entry = entries
            .entry(identity.clone())
            .or_insert_with(|| ClusterEntry::new(identity));

        if let Some(existing) = entry.resources.get(&env) {
            if keep_existing(existing.as_ref(), deployment.as_ref()) {
                return false;
            }
        }
        entry.resources.insert(env, deployment);
        true
    }

    /// A snapshot of everything cached for an identity.
    pub fn get(&self, identity: &str) -> Option<DeploymentClusterEntry> {
        self.entries.lock().get(identity).cloned()
    }

    /// The Deployment cached for an identity in a single environment.
    pub fn get_by_env(&self, identity: &str, env: &str) -> Option<Arc<Deployment>> {
        self.entries
            .lock()
            .get(identity)
            .and_then(|e| e.resources.get(env))
            .cloned()
    }

    /// Remove a Deployment.
    ///
    /// Only removes the stored value if it is the same object as
    /// `deployment`. Removing the last environment for an identity removes
    /// the identity. Deleting something that isn't cached does nothing.
    ///
    /// Returns true if anything was removed.
    pub fn delete(&self, deployment: &Deployment) -> bool {
        let Some(identity) = self.labels.deployment_identity(deployment) else {
            return false;
        };
        let env = self.get_key(deployment);

        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&identity) else {
            return false;
        };

        let removed = entry
            .resources
            .get(&env)
            .is_some_and(|existing| same_object(existing.as_ref(), deployment));
        if removed {
            entry.resources.remove(&env);
        }

        if entry.resources.is_empty() {
            entries.remove(&identity);
        }
        removed
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.lock().contains_key(identity)
    }

    /// A snapshot of every entry in the cache.
    pub fn all(&self) -> Vec<DeploymentClusterEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// The number of identities in the cache.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A cache of Services keyed by namespace.
///
/// Shares the locking rules of [DeploymentCache].
pub struct ServiceCache {
    labels: Arc<LabelSet>,
    entries: Mutex<HashMap<String, ServiceClusterEntry>>,
}

impl ServiceCache {
    pub fn new(labels: Arc<LabelSet>) -> Self {
        Self {
            labels,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// The key a Service is stored under.
    pub fn get_key(&self, service: &Service) -> String {
        service.namespace().unwrap_or_default()
    }

    /// Add or replace a Service.
    ///
    /// A Service ignored by its own labels or annotations is not stored, and
    /// evicts any previously stored Service with the same name, so a Service
    /// can move in and out of the cache as its metadata changes.
    ///
    /// Returns true if `service` was stored. Services without a namespace
    /// have no key and are never stored.
    pub fn put(&self, service: Arc<Service>) -> bool {
        let Some(key) = service.namespace() else {
            return false;
        };
        let name = service.name_any();

        let mut entries = self.entries.lock();
        if self.labels.should_ignore_service(&service, false) {
            remove_service(&mut entries, &key, &name);
            return false;
        }

        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| ClusterEntry::new(key.clone()));
        entry
            .resources
            .entry(key)
            .or_default()
            .insert(name, service);
        true
    }

    /// All Services stored under a namespace, newest first.
    ///
    /// Returns `None` rather than an empty list when nothing is stored.
    pub fn get(&self, key: &str) -> Option<Vec<Arc<Service>>> {
        let entries = self.entries.lock();
        let services = entries.get(key).and_then(|e| e.resources.get(key));

        let ordered = ordered_by_creation(services);
        (!ordered.is_empty()).then_some(ordered)
    }

    /// Remove a Service. Deleting something that isn't cached does nothing.
    ///
    /// Returns true if anything was removed.
    pub fn delete(&self, service: &Service) -> bool {
        let key = self.get_key(service);
        let mut entries = self.entries.lock();
        remove_service(&mut entries, &key, &service.name_any())
    }

    /// A snapshot of every entry in the cache.
    pub fn all(&self) -> Vec<ServiceClusterEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// The number of namespaces in the cache.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// must be called with the cache lock held.
fn remove_service(
    entries: &mut HashMap<String, ServiceClusterEntry>,
    key: &str,
    name: &str,
) -> bool {
    let Some(entry) = entries.get_mut(key) else {
        return false;
    };

    let mut removed = false;
    if let Some(services) = entry.resources.get_mut(key) {
        removed = services.remove(name).is_some();
        if services.is_empty() {
            entry.resources.remove(key);
        }
    }

    if entry.resources.is_empty() {
        entries.remove(key);
    }
    removed
}
