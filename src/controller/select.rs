use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};

use kube::ResourceExt;

/// Compare two resources so that the most recently created one sorts first.
///
/// Resources without a creation timestamp sort after every resource that has
/// one.
pub fn by_creation_desc<K: kube::Resource>(a: &K, b: &K) -> Ordering {
    let a = a.creation_timestamp().map(|t| t.0);
    let b = b.creation_timestamp().map(|t| t.0);
    b.cmp(&a)
}

/// Order a set of candidates for the same identity newest-first.
///
/// Candidates created at the same instant keep the key order of the map, so
/// the same input always produces the same output. A missing or empty map
/// yields an empty list.
pub fn ordered_by_creation<K: kube::Resource>(
    candidates: Option<&BTreeMap<String, Arc<K>>>,
) -> Vec<Arc<K>> {
    let Some(candidates) = candidates else {
        return Vec::new();
    };

    let mut ordered: Vec<_> = candidates.values().cloned().collect();
    // sort_by is stable, so ties stay in key order
    ordered.sort_by(|a, b| by_creation_desc(a.as_ref(), b.as_ref()));
    ordered
}

/// Returns true if `existing` should stay authoritative over `incoming`.
///
/// The same object (by namespace and name) is always replaced. A different
/// object is only kept if it was created strictly later.
pub(crate) fn keep_existing<K: kube::Resource>(existing: &K, incoming: &K) -> bool {
    let same_object = existing.namespace() == incoming.namespace()
        && existing.name_any() == incoming.name_any();

    !same_object && by_creation_desc(existing, incoming) == Ordering::Less
}
