//! Mapping of pass results to InfraCluster status conditions

use affinity_common::crd::{
    remove_condition, set_condition, Condition, ConditionSeverity, ConditionStatus,
};

use crate::reconciler::{OutcomeLevel, PassResult};

/// Condition type: affinity groups are in place
pub const MODULES_AVAILABLE_CONDITION: &str = "ClusterModulesAvailable";
/// Condition type: affinity group reconciliation converged
pub const MODULES_READY_CONDITION: &str = "ClusterModulesReady";

/// Reason: at least one owner failed to get a group
pub const SETUP_FAILED_REASON: &str = "ClusterModuleSetupFailed";
/// Reason: the platform version cannot host groups
pub const PLATFORM_INCOMPATIBLE_REASON: &str = "PlatformVersionIncompatible";
/// Reason: every owner has a group
pub const READY_REASON: &str = "ClusterModulesReady";
/// Reason: some owners have no group
pub const NOT_READY_REASON: &str = "ClusterModulesNotReady";
/// Reason: the platform version is missing or too old
pub const INVALID_PLATFORM_REASON: &str = "InvalidPlatformVersion";

/// Change to the availability condition
#[derive(Clone, Debug, PartialEq)]
pub enum AvailableUpdate {
    /// Set the condition
    Set(Condition),
    /// Remove the condition
    Clear,
}

/// Conditions derived from one pass
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionReport {
    /// Update to `ClusterModulesAvailable`
    pub available: AvailableUpdate,
    /// New `ClusterModulesReady`
    pub ready: Condition,
}

/// Build the condition report for a pass
pub fn report(result: &PassResult) -> ConditionReport {
    match result {
        PassResult::Unsupported { platform_version } => {
            let message = format!(
                "platform version {} does not support cluster modules",
                platform_version.as_deref().unwrap_or("<unknown>")
            );
            ConditionReport {
                available: AvailableUpdate::Set(
                    Condition::new(
                        MODULES_AVAILABLE_CONDITION,
                        ConditionStatus::False,
                        PLATFORM_INCOMPATIBLE_REASON,
                        message.clone(),
                    )
                    .with_severity(ConditionSeverity::Info),
                ),
                ready: Condition::new(
                    MODULES_READY_CONDITION,
                    ConditionStatus::False,
                    INVALID_PLATFORM_REASON,
                    message,
                ),
            }
        }
        PassResult::Completed(outcome) => match outcome.level() {
            OutcomeLevel::Ready => ConditionReport {
                available: AvailableUpdate::Set(Condition::new(
                    MODULES_AVAILABLE_CONDITION,
                    ConditionStatus::True,
                    "",
                    "",
                )),
                ready: ready_true(),
            },
            OutcomeLevel::Absent => ConditionReport {
                available: AvailableUpdate::Clear,
                ready: ready_true(),
            },
            // Warning and failure report identically; only the returned error differs
            OutcomeLevel::Warning | OutcomeLevel::Failed => {
                let summary = outcome.failure_summary().unwrap_or_default();
                ConditionReport {
                    available: AvailableUpdate::Set(
                        Condition::new(
                            MODULES_AVAILABLE_CONDITION,
                            ConditionStatus::False,
                            SETUP_FAILED_REASON,
                            summary.clone(),
                        )
                        .with_severity(ConditionSeverity::Warning),
                    ),
                    ready: Condition::new(
                        MODULES_READY_CONDITION,
                        ConditionStatus::False,
                        NOT_READY_REASON,
                        summary,
                    ),
                }
            }
        },
    }
}

fn ready_true() -> Condition {
    Condition::new(
        MODULES_READY_CONDITION,
        ConditionStatus::True,
        READY_REASON,
        "",
    )
}

/// Apply a report to existing conditions, leaving unrelated types untouched
pub fn apply_report(current: &[Condition], report: ConditionReport) -> Vec<Condition> {
    let mut conditions = current.to_vec();
    match report.available {
        AvailableUpdate::Set(condition) => set_condition(&mut conditions, condition),
        AvailableUpdate::Clear => remove_condition(&mut conditions, MODULES_AVAILABLE_CONDITION),
    }
    set_condition(&mut conditions, report.ready);
    conditions
}

/// True when two condition lists differ in anything but transition times
pub fn conditions_changed(before: &[Condition], after: &[Condition]) -> bool {
    before.len() != after.len()
        || before
            .iter()
            .zip(after)
            .any(|(a, b)| !a.same_state(b) || a.last_transition_time != b.last_transition_time)
}
