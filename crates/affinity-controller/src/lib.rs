//! Affinity group (cluster module) management for Cluster API clusters
//!
//! This crate provides the Kubernetes controller that keeps one platform
//! affinity group per machine owner of an InfraCluster: the control plane and
//! every MachineDeployment. The platform side is abstracted behind
//! [`AffinityService`]; the embedding binary supplies the implementation.
//!
//! Related crates:
//! - `affinity-common`: CRDs, errors, telemetry and metrics

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod owner;
pub mod reconciler;
pub mod report;
pub mod runner;
pub mod service;
pub mod store;
pub mod trigger;

pub use config::ControllerConfig;
pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use owner::{
    BindingKey, ClusterRef, KubeOwnerDirectory, Owner, OwnerDirectory, OwnerMeta, TemplateRef,
};
pub use reconciler::{
    is_platform_compatible, ModuleReconciler, OutcomeLevel, OwnerFailure, PassResult,
    ReconcileOutcome, ReconcilerConfig,
};
pub use runner::build_controllers;
pub use service::{AffinityService, ServiceError};
pub use store::{ClusterStore, KubeClusterStore};
pub use trigger::{map_owner_change, ClusterIndex, StoreClusterIndex};

// Re-export common error types
pub use affinity_common::{Error, Result};
