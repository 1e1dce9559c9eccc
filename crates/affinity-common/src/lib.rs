//! Common types for the affinity group controller: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label that Cluster API stamps on every object belonging to a Cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// API group of core Cluster API resources (Cluster, MachineDeployment)
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// API version of core Cluster API resources
pub const CAPI_CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// API version of Cluster API control plane resources
pub const CAPI_CONTROLPLANE_API_VERSION: &str = "controlplane.cluster.x-k8s.io/v1beta1";

/// Kind of the Cluster API cluster object
pub const CLUSTER_KIND: &str = "Cluster";

/// Kind of the control-plane owner object
pub const CONTROL_PLANE_KIND: &str = "KubeadmControlPlane";

/// Kind of the worker-group owner object
pub const WORKER_GROUP_KIND: &str = "MachineDeployment";

/// Field manager used for every patch issued by the controller
pub const FIELD_MANAGER: &str = "affinity-controller";
