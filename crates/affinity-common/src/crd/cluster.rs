//! InfraCluster Custom Resource Definition
//!
//! The InfraCluster is the infrastructure-side counterpart of a Cluster API
//! `Cluster`. It records the affinity groups (cluster modules) created on the
//! virtualization platform for the cluster's control plane and machine
//! deployments, and reports their health through status conditions.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// apiVersion of the InfraCluster CRD
pub const INFRA_CLUSTER_API_VERSION: &str = "infrastructure.affinity.dev/v1alpha1";

/// Specification for an InfraCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.affinity.dev",
    version = "v1alpha1",
    kind = "InfraCluster",
    plural = "infraclusters",
    shortname = "ic",
    status = "InfraClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Platform","type":"string","jsonPath":".status.platformVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InfraClusterSpec {
    /// Affinity groups currently bound to the cluster's machine owners
    ///
    /// Owned by the controller. The whole list is replaced on every
    /// reconciliation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_modules: Vec<ClusterModule>,
}

/// A recorded binding between a machine owner and a platform affinity group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterModule {
    /// True when the owner is the cluster's control plane
    #[serde(default)]
    pub control_plane: bool,

    /// Name of the owner object (KubeadmControlPlane or MachineDeployment)
    pub target_object_name: String,

    /// Opaque platform identifier of the affinity group
    #[serde(rename = "moduleUUID")]
    pub module_uuid: String,
}

impl ClusterModule {
    /// Create a binding
    pub fn new(
        control_plane: bool,
        target_object_name: impl Into<String>,
        module_uuid: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            target_object_name: target_object_name.into(),
            module_uuid: module_uuid.into(),
        }
    }
}

/// Status for an InfraCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfraClusterStatus {
    /// Version of the virtualization platform backing the cluster
    ///
    /// Written by the infrastructure provider. Affinity groups are only
    /// managed when the version is known and supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_version: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl InfraCluster {
    /// Bindings recorded by the previous reconciliation
    pub fn cluster_modules(&self) -> &[ClusterModule] {
        &self.spec.cluster_modules
    }

    /// Platform version reported in status, if any
    pub fn platform_version(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.platform_version.as_deref())
    }

    /// Current status conditions
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn bindings_use_persisted_field_names() {
        let module = ClusterModule::new(true, "kcp-name", "H1");
        let json = serde_json::to_value(&module).unwrap();
        assert_eq!(json["controlPlane"], true);
        assert_eq!(json["targetObjectName"], "kcp-name");
        assert_eq!(json["moduleUUID"], "H1");
    }

    #[test]
    fn spec_round_trips_from_yaml_shaped_json() {
        let spec: InfraClusterSpec = serde_json::from_value(serde_json::json!({
            "clusterModules": [
                {"controlPlane": true, "targetObjectName": "cp", "moduleUUID": "a"},
                {"targetObjectName": "md-0", "moduleUUID": "b"}
            ]
        }))
        .unwrap();
        assert_eq!(spec.cluster_modules.len(), 2);
        assert!(!spec.cluster_modules[1].control_plane);
    }

    #[test]
    fn accessors_handle_missing_status() {
        let cluster = InfraCluster::new("edge", InfraClusterSpec::default());
        assert!(cluster.platform_version().is_none());
        assert!(cluster.conditions().is_empty());
        assert!(cluster.cluster_modules().is_empty());
    }

    #[test]
    fn crd_is_namespaced_with_status() {
        let crd = InfraCluster::crd();
        assert_eq!(crd.spec.group, "infrastructure.affinity.dev");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(
            INFRA_CLUSTER_API_VERSION,
            format!("{}/{}", crd.spec.group, crd.spec.versions[0].name)
        );
    }
}
