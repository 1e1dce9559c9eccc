//! Machine owners that receive affinity groups, and the directory listing them
//!
//! A cluster has at most one control-plane owner (`KubeadmControlPlane`) and
//! any number of worker-group owners (`MachineDeployment`). Owners are read
//! fresh on every pass; only the bindings to their affinity groups persist.

use std::fmt;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use affinity_common::crd::{ClusterModule, InfraCluster};
use affinity_common::kube_utils::{build_api_resource, nested_str};
use affinity_common::{
    Error, CAPI_CLUSTER_API_VERSION, CAPI_CONTROLPLANE_API_VERSION, CLUSTER_NAME_LABEL,
    CONTROL_PLANE_KIND, WORKER_GROUP_KIND,
};

/// Prefix of the string form of control-plane binding keys
///
/// `:` cannot appear in object names, so the rendered key spaces never overlap.
pub const CONTROL_PLANE_KEY_PREFIX: &str = "kcp:";

/// Identity of the infrastructure cluster being reconciled
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterRef {
    /// Namespace shared by the cluster and all of its owners
    pub namespace: String,
    /// Name of the InfraCluster object
    pub name: String,
    /// Name of the Cluster API `Cluster`, taken from the cluster-name label
    pub capi_cluster: Option<String>,
}

impl ClusterRef {
    /// Reference a cluster without a Cluster API cluster name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            capi_cluster: None,
        }
    }

    /// Set the Cluster API cluster name
    pub fn with_capi_cluster(mut self, capi_cluster: impl Into<String>) -> Self {
        self.capi_cluster = Some(capi_cluster.into());
        self
    }

    /// Build a reference from an InfraCluster object
    pub fn from_infra_cluster(cluster: &InfraCluster) -> Result<Self, Error> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().ok_or_else(|| {
            Error::validation_for_field(&name, "metadata.namespace", "InfraCluster must be namespaced")
        })?;
        Ok(Self {
            namespace,
            name,
            capi_cluster: cluster.labels().get(CLUSTER_NAME_LABEL).cloned(),
        })
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference to the infrastructure machine template of an owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateRef {
    /// apiVersion of the template
    pub api_version: String,
    /// Kind of the template (e.g. a platform machine template)
    pub kind: String,
    /// Name of the template
    pub name: String,
}

/// Identity and shape of an owner object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerMeta {
    /// Namespace of the owner
    pub namespace: String,
    /// Name of the owner
    pub name: String,
    /// Infrastructure machine template the owner stamps machines from
    pub infrastructure_ref: Option<TemplateRef>,
}

/// An object whose machines are spread by one affinity group
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    /// The cluster's control plane
    ControlPlane(OwnerMeta),
    /// A group of worker machines
    WorkerGroup(OwnerMeta),
}

impl Owner {
    /// Control-plane owner without a template reference
    pub fn control_plane(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ControlPlane(OwnerMeta {
            namespace: namespace.into(),
            name: name.into(),
            infrastructure_ref: None,
        })
    }

    /// Worker-group owner without a template reference
    pub fn worker_group(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::WorkerGroup(OwnerMeta {
            namespace: namespace.into(),
            name: name.into(),
            infrastructure_ref: None,
        })
    }

    /// Identity and shape of the owner
    pub fn meta(&self) -> &OwnerMeta {
        match self {
            Owner::ControlPlane(meta) | Owner::WorkerGroup(meta) => meta,
        }
    }

    /// Name of the owner object
    pub fn name(&self) -> &str {
        &self.meta().name
    }

    /// Namespace of the owner object
    pub fn namespace(&self) -> &str {
        &self.meta().namespace
    }

    /// True for the control-plane owner
    pub fn is_control_plane(&self) -> bool {
        matches!(self, Owner::ControlPlane(_))
    }

    /// Kubernetes kind of the owner object
    pub fn kind(&self) -> &'static str {
        match self {
            Owner::ControlPlane(_) => CONTROL_PLANE_KIND,
            Owner::WorkerGroup(_) => WORKER_GROUP_KIND,
        }
    }

    /// Key under which the owner's binding is recorded
    pub fn key(&self) -> BindingKey {
        match self {
            Owner::ControlPlane(meta) => BindingKey::ControlPlane(meta.name.clone()),
            Owner::WorkerGroup(meta) => BindingKey::WorkerGroup(meta.name.clone()),
        }
    }

    /// Binding of this owner to the given affinity group handle
    pub fn binding(&self, handle: impl Into<String>) -> ClusterModule {
        ClusterModule::new(self.is_control_plane(), self.name(), handle)
    }
}

/// Key matching a recorded binding to a current owner
///
/// Control-plane and worker-group owners live in disjoint key spaces, so a
/// KubeadmControlPlane and a MachineDeployment with the same name never share
/// a binding. Ordering puts the control plane first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BindingKey {
    /// Key of a control-plane owner
    ControlPlane(String),
    /// Key of a worker-group owner
    WorkerGroup(String),
}

impl BindingKey {
    /// Key of a recorded binding
    pub fn of(binding: &ClusterModule) -> Self {
        if binding.control_plane {
            BindingKey::ControlPlane(binding.target_object_name.clone())
        } else {
            BindingKey::WorkerGroup(binding.target_object_name.clone())
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKey::ControlPlane(name) => write!(f, "{}{}", CONTROL_PLANE_KEY_PREFIX, name),
            BindingKey::WorkerGroup(name) => f.write_str(name),
        }
    }
}

/// Source of the current, module-eligible owners of a cluster
///
/// Implementations exclude owners that are being deleted and must fail the
/// whole listing rather than return a partial set.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    /// List the control-plane and worker-group owners of a cluster
    async fn list_owners(&self, cluster: &ClusterRef) -> Result<Vec<Owner>, Error>;
}

/// Owner directory reading Cluster API objects from the kube API
pub struct KubeOwnerDirectory {
    client: Client,
    control_planes: ApiResource,
    worker_groups: ApiResource,
}

impl KubeOwnerDirectory {
    /// Create a directory using the default Cluster API versions
    pub fn new(client: Client) -> Self {
        Self {
            client,
            control_planes: build_api_resource(CAPI_CONTROLPLANE_API_VERSION, CONTROL_PLANE_KIND),
            worker_groups: build_api_resource(CAPI_CLUSTER_API_VERSION, WORKER_GROUP_KIND),
        }
    }

    async fn list_kind(
        &self,
        cluster: &ClusterRef,
        ar: &ApiResource,
        params: &ListParams,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &cluster.namespace, ar);
        let list = api.list(params).await.map_err(|e| {
            Error::owner_listing(
                cluster.to_string(),
                format!("failed to list {} objects: {}", ar.kind, e),
            )
        })?;
        Ok(list.items)
    }
}

#[async_trait]
impl OwnerDirectory for KubeOwnerDirectory {
    async fn list_owners(&self, cluster: &ClusterRef) -> Result<Vec<Owner>, Error> {
        let capi_cluster = cluster.capi_cluster.as_deref().ok_or_else(|| {
            Error::owner_listing(
                cluster.to_string(),
                format!("missing {} label", CLUSTER_NAME_LABEL),
            )
        })?;

        let params = ListParams::default().labels(&format!("{}={}", CLUSTER_NAME_LABEL, capi_cluster));
        let control_planes = self.list_kind(cluster, &self.control_planes, &params).await?;
        let worker_groups = self.list_kind(cluster, &self.worker_groups, &params).await?;

        let owners = collect_owners(cluster, &control_planes, &worker_groups)?;
        debug!(cluster = %cluster, owners = owners.len(), "listed machine owners");
        Ok(owners)
    }
}

/// Convert listed Cluster API objects into owners
///
/// More than one control plane is a configuration error even when the extra
/// one is being deleted.
pub fn collect_owners(
    cluster: &ClusterRef,
    control_planes: &[DynamicObject],
    worker_groups: &[DynamicObject],
) -> Result<Vec<Owner>, Error> {
    if control_planes.len() > 1 {
        return Err(Error::configuration(
            cluster.to_string(),
            format!(
                "multiple {} objects found, expected 1, found {}",
                CONTROL_PLANE_KIND,
                control_planes.len()
            ),
        ));
    }

    let control_plane = control_planes.iter().filter_map(|obj| {
        owner_meta(obj, &["spec", "machineTemplate", "infrastructureRef"]).map(Owner::ControlPlane)
    });
    let workers = worker_groups.iter().filter_map(|obj| {
        owner_meta(obj, &["spec", "template", "spec", "infrastructureRef"]).map(Owner::WorkerGroup)
    });

    Ok(control_plane.chain(workers).collect())
}

/// Read owner identity, skipping objects marked for deletion
fn owner_meta(obj: &DynamicObject, template_path: &[&str]) -> Option<OwnerMeta> {
    if obj.metadata.deletion_timestamp.is_some() {
        return None;
    }
    let name = obj.metadata.name.clone()?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();

    let template = template_path
        .iter()
        .try_fold(&obj.data, |current, segment| current.get(segment));
    let infrastructure_ref = template.and_then(|t| {
        Some(TemplateRef {
            api_version: nested_str(t, &["apiVersion"]).unwrap_or_default().to_string(),
            kind: nested_str(t, &["kind"])?.to_string(),
            name: nested_str(t, &["name"])?.to_string(),
        })
    });

    Some(OwnerMeta {
        namespace,
        name,
        infrastructure_ref,
    })
}
