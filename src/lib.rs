//! Keeps in-memory caches of the Deployments and Services in a cluster, keyed
//! by workload identity, for building multi-cluster mesh configuration.

pub mod cluster;
pub mod controller;
pub mod k8s;
pub mod labels;
pub mod metrics;
