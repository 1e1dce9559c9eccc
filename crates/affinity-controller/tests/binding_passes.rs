//! Multi-pass behaviour of the binding reconciler against an in-memory platform

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use affinity_common::crd::ClusterModule;
use affinity_controller::{
    AffinityService, BindingKey, ClusterRef, Error, ModuleReconciler, OutcomeLevel, Owner,
    OwnerDirectory, OwnerMeta, PassResult, ReconcileOutcome, ReconcilerConfig, ServiceError,
    TemplateRef,
};

#[derive(Default)]
struct FakeDirectory {
    owners: Mutex<Vec<Owner>>,
}

impl FakeDirectory {
    fn set(&self, owners: Vec<Owner>) {
        *self.owners.lock().unwrap() = owners;
    }
}

#[async_trait]
impl OwnerDirectory for FakeDirectory {
    async fn list_owners(&self, _cluster: &ClusterRef) -> Result<Vec<Owner>, Error> {
        Ok(self.owners.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct PlatformState {
    groups: BTreeMap<String, BindingKey>,
    next: u32,
    calls: Vec<String>,
    failing: BTreeSet<String>,
}

/// Template kind the fake platform can place machines from
const PLATFORM_TEMPLATE_KIND: &str = "PlatformMachineTemplate";

/// Platform that keeps groups in memory and records every call
#[derive(Default)]
struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("exists"))
            .collect()
    }

    fn fail_owner(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    fn heal_owner(&self, name: &str) {
        self.state.lock().unwrap().failing.remove(name);
    }

    fn group_count(&self) -> usize {
        self.state.lock().unwrap().groups.len()
    }
}

#[async_trait]
impl AffinityService for FakePlatform {
    async fn create(
        &self,
        _cluster: &ClusterRef,
        owner: &Owner,
    ) -> Result<Option<String>, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create {}", owner.key()));

        if let Some(template) = &owner.meta().infrastructure_ref {
            if template.kind != PLATFORM_TEMPLATE_KIND {
                return Err(ServiceError::incompatible_owner(
                    owner.name(),
                    format!("{} is not a platform machine template", template.kind),
                ));
            }
        }
        if state.failing.contains(owner.name()) {
            return Err(ServiceError::platform("datacenter unreachable"));
        }

        let key = owner.key();
        if let Some((handle, _)) = state.groups.iter().find(|(_, k)| **k == key) {
            return Ok(Some(handle.clone()));
        }
        state.next += 1;
        let handle = format!("group-{}", state.next);
        state.groups.insert(handle.clone(), key);
        Ok(Some(handle))
    }

    async fn exists(
        &self,
        _cluster: &ClusterRef,
        owner: &Owner,
        handle: &str,
    ) -> Result<bool, ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("exists {} {}", owner.key(), handle));
        if state.failing.contains(owner.name()) {
            return Err(ServiceError::platform("datacenter unreachable"));
        }
        Ok(state.groups.contains_key(handle))
    }

    async fn remove(&self, _cluster: &ClusterRef, handle: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove {}", handle));
        state.groups.remove(handle);
        Ok(())
    }
}

struct Harness {
    directory: Arc<FakeDirectory>,
    platform: Arc<FakePlatform>,
    reconciler: ModuleReconciler,
    bindings: Vec<ClusterModule>,
}

impl Harness {
    fn new(owners: Vec<Owner>) -> Self {
        let directory = Arc::new(FakeDirectory::default());
        directory.set(owners);
        let platform = Arc::new(FakePlatform::default());
        let reconciler = ModuleReconciler::new(
            directory.clone(),
            platform.clone(),
            ReconcilerConfig::default(),
        );
        Self {
            directory,
            platform,
            reconciler,
            bindings: Vec::new(),
        }
    }

    /// Run one pass and persist its bindings, as the controller does
    async fn pass(&mut self) -> Result<ReconcileOutcome, Error> {
        let cluster = ClusterRef::new("default", "edge").with_capi_cluster("edge");
        let result = self
            .reconciler
            .reconcile(
                &cluster,
                Some("8.0.2"),
                &self.bindings,
                &CancellationToken::new(),
            )
            .await?;
        match result {
            PassResult::Completed(outcome) => {
                self.bindings = outcome.bindings.clone();
                Ok(outcome)
            }
            PassResult::Unsupported { .. } => panic!("platform should be supported"),
        }
    }
}

fn cp(name: &str) -> Owner {
    Owner::control_plane("default", name)
}

fn md(name: &str) -> Owner {
    Owner::worker_group("default", name)
}

/// Worker group stamping machines from a non-platform template
fn docker_md(name: &str) -> Owner {
    Owner::WorkerGroup(OwnerMeta {
        namespace: "default".to_string(),
        name: name.to_string(),
        infrastructure_ref: Some(TemplateRef {
            api_version: "infrastructure.cluster.x-k8s.io/v1beta1".to_string(),
            kind: "DockerMachineTemplate".to_string(),
            name: format!("{}-template", name),
        }),
    })
}

/// Story: a second pass with no changes makes no mutating calls
#[tokio::test]
async fn story_second_pass_is_idempotent() {
    let mut harness = Harness::new(vec![cp("edge-cp"), md("edge-md-0"), md("edge-md-1")]);

    let first = harness.pass().await.unwrap();
    assert_eq!(first.bindings.len(), 3);
    assert_eq!(first.level(), OutcomeLevel::Ready);
    assert!(first.bindings[0].control_plane);

    harness.platform.clear_calls();
    let second = harness.pass().await.unwrap();

    assert_eq!(second.bindings, first.bindings);
    assert!(harness.platform.mutating_calls().is_empty());
    assert_eq!(harness.platform.calls().len(), 3);
}

/// Story: deleting a MachineDeployment removes exactly its group, once
#[tokio::test]
async fn story_deleted_owner_group_is_removed_once() {
    let mut harness = Harness::new(vec![cp("edge-cp"), md("edge-md-0"), md("edge-md-1")]);
    harness.pass().await.unwrap();
    let orphan = harness
        .bindings
        .iter()
        .find(|b| b.target_object_name == "edge-md-1")
        .map(|b| b.module_uuid.clone())
        .unwrap();

    harness.directory.set(vec![cp("edge-cp"), md("edge-md-0")]);
    harness.platform.clear_calls();
    let outcome = harness.pass().await.unwrap();

    assert_eq!(outcome.bindings.len(), 2);
    assert!(outcome
        .bindings
        .iter()
        .all(|b| b.target_object_name != "edge-md-1"));
    assert_eq!(
        harness.platform.mutating_calls(),
        vec![format!("remove {}", orphan)]
    );
    assert_eq!(harness.platform.group_count(), 2);

    harness.platform.clear_calls();
    harness.pass().await.unwrap();
    assert!(harness.platform.mutating_calls().is_empty());
}

/// Story: one failing owner does not block the others, and heals later
#[tokio::test]
async fn story_partial_failure_then_recovery() {
    let mut harness = Harness::new(vec![cp("edge-cp"), md("edge-md-0"), md("edge-md-1")]);
    harness.platform.fail_owner("edge-md-1");

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.level(), OutcomeLevel::Failed);
    assert_eq!(outcome.bindings.len(), 2);
    let summary = outcome.failure_summary().unwrap();
    assert!(summary.contains("edge-md-1"));
    assert!(!summary.contains("edge-md-0"));

    harness.platform.heal_owner("edge-md-1");
    let healed = harness.pass().await.unwrap();
    assert_eq!(healed.level(), OutcomeLevel::Ready);
    assert_eq!(healed.bindings.len(), 3);
}

/// Story: a verification outage keeps the recorded group instead of duplicating it
#[tokio::test]
async fn story_verification_outage_keeps_binding() {
    let mut harness = Harness::new(vec![md("edge-md-0")]);
    harness.pass().await.unwrap();
    let recorded = harness.bindings.clone();

    harness.platform.fail_owner("edge-md-0");
    harness.platform.clear_calls();
    let outcome = harness.pass().await.unwrap();

    assert_eq!(outcome.bindings, recorded);
    assert_eq!(outcome.level(), OutcomeLevel::Failed);
    assert!(harness.platform.mutating_calls().is_empty());
    assert_eq!(harness.platform.group_count(), 1);
}

#[tokio::test]
async fn all_incompatible_owners_converge_with_warning() {
    let mut harness = Harness::new(vec![docker_md("docker-md-0"), docker_md("docker-md-1")]);

    let outcome = harness.pass().await.unwrap();

    assert_eq!(outcome.level(), OutcomeLevel::Warning);
    assert!(outcome.bindings.is_empty());
    assert!(outcome.to_error(&ClusterRef::new("default", "edge")).is_none());
}

#[tokio::test]
async fn incompatible_mixed_with_outage_is_a_hard_failure() {
    let mut harness = Harness::new(vec![docker_md("docker-md"), md("edge-md")]);
    harness.platform.fail_owner("edge-md");

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.level(), OutcomeLevel::Failed);
    assert!(outcome.to_error(&ClusterRef::new("default", "edge")).is_some());
}

/// Story: identically named control plane and deployment get separate groups
#[tokio::test]
async fn story_identical_names_get_separate_groups() {
    let mut harness = Harness::new(vec![cp("edge"), md("edge")]);

    let outcome = harness.pass().await.unwrap();

    assert_eq!(outcome.bindings.len(), 2);
    assert_ne!(outcome.bindings[0].module_uuid, outcome.bindings[1].module_uuid);
    assert_eq!(harness.platform.group_count(), 2);

    harness.directory.set(vec![md("edge")]);
    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.bindings.len(), 1);
    assert!(!outcome.bindings[0].control_plane);
    assert_eq!(harness.platform.group_count(), 1);
}

#[tokio::test]
async fn two_control_planes_leave_bindings_untouched() {
    let mut harness = Harness::new(vec![cp("edge-cp"), md("edge-md-0")]);
    harness.pass().await.unwrap();
    let recorded = harness.bindings.clone();

    harness
        .directory
        .set(vec![cp("edge-cp"), cp("edge-cp-2"), md("edge-md-0")]);
    harness.platform.clear_calls();

    let err = harness.pass().await.unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert_eq!(harness.bindings, recorded);
    assert!(harness.platform.calls().is_empty());
}

/// Story: recorded control-plane group that still exists is left alone
#[tokio::test]
async fn story_existing_control_plane_group_is_unchanged() {
    let mut harness = Harness::new(vec![cp("kcp-name")]);
    harness.pass().await.unwrap();
    assert_eq!(
        harness.bindings,
        vec![ClusterModule::new(true, "kcp-name", "group-1")]
    );

    harness.platform.clear_calls();
    let outcome = harness.pass().await.unwrap();

    assert_eq!(outcome.bindings, vec![ClusterModule::new(true, "kcp-name", "group-1")]);
    assert_eq!(outcome.level(), OutcomeLevel::Ready);
    assert_eq!(harness.platform.calls(), vec!["exists kcp:kcp-name group-1"]);
}
