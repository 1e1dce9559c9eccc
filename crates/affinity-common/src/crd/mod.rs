//! Custom Resource Definitions for the affinity group controller

mod cluster;
mod types;

pub use cluster::{
    ClusterModule, InfraCluster, InfraClusterSpec, InfraClusterStatus, INFRA_CLUSTER_API_VERSION,
};
pub use types::{
    find_condition, remove_condition, set_condition, Condition, ConditionSeverity,
    ConditionStatus,
};
