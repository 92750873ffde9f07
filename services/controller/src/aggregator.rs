//! Group and workload status aggregation.
//!
//! Read-only roll-ups over state store snapshots, consumed by whatever
//! reports workload status. Nothing here mutates the store.

use std::sync::Arc;

use ensemble_id::{GroupName, RoleKey, RoleName, WorkloadKey};
use ensemble_reconcile::ConvergenceStatus;
use serde::Serialize;

use crate::state::{InstanceStatus, RoleSnapshot, StateStore};

/// Instance counts of one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSummary {
    pub role: RoleName,
    pub desired: u32,
    /// Instances in `creating`.
    pub created: u32,
    pub running: u32,
    pub deleting: u32,
}

impl RoleSummary {
    fn from_snapshot(snapshot: &RoleSnapshot) -> Self {
        Self {
            role: snapshot.role.role.clone(),
            desired: snapshot.desired,
            created: snapshot.count(InstanceStatus::Creating),
            running: snapshot.count(InstanceStatus::Running),
            deleting: snapshot.count(InstanceStatus::Deleting),
        }
    }

    /// Every desired instance is running.
    pub fn is_available(&self) -> bool {
        self.running >= self.desired
    }
}

/// Instance counts of one group, summed over its roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub group: GroupName,
    /// Instances in `creating`.
    pub created_count: u32,
    pub running_count: u32,
    pub deleting_count: u32,
    pub total_desired: u32,
    pub roles: Vec<RoleSummary>,
}

impl GroupSummary {
    pub fn convergence(&self) -> ConvergenceStatus {
        ConvergenceStatus::from_counts(
            self.total_desired,
            self.running_count,
            self.created_count,
            self.deleting_count,
        )
    }

    /// The group has roles and each of them runs its desired count.
    pub fn is_available(&self) -> bool {
        !self.roles.is_empty() && self.roles.iter().all(RoleSummary::is_available)
    }
}

/// Group counts of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSummary {
    pub workload: WorkloadKey,
    pub groups: u32,
    pub available_groups: u32,
    pub progressing_groups: u32,
    pub group_summaries: Vec<GroupSummary>,
}

/// Computes summaries from the state store.
#[derive(Debug, Clone)]
pub struct GroupAggregator {
    store: Arc<StateStore>,
}

impl GroupAggregator {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Summarize one group. An unknown group yields all zeros.
    pub async fn summarize(&self, workload: &WorkloadKey, group: &GroupName) -> GroupSummary {
        let mut roles = Vec::new();
        for role in self.store.list_roles(workload, group).await {
            let key = RoleKey::new(workload.clone(), group.clone(), role);
            let snapshot = self.store.list_instances(&key).await;
            roles.push(RoleSummary::from_snapshot(&snapshot));
        }

        GroupSummary {
            group: group.clone(),
            created_count: roles.iter().map(|r| r.created).sum(),
            running_count: roles.iter().map(|r| r.running).sum(),
            deleting_count: roles.iter().map(|r| r.deleting).sum(),
            total_desired: roles.iter().map(|r| r.desired).sum(),
            roles,
        }
    }

    /// Summarize every group of a workload.
    ///
    /// A group is progressing while any of its instances is being created or
    /// deleted. Available and progressing are not exclusive.
    pub async fn summarize_workload(&self, workload: &WorkloadKey) -> WorkloadSummary {
        let mut summaries = Vec::new();
        for group in self.store.list_groups(workload).await {
            summaries.push(self.summarize(workload, &group).await);
        }

        WorkloadSummary {
            workload: workload.clone(),
            groups: summaries.len() as u32,
            available_groups: summaries.iter().filter(|g| g.is_available()).count() as u32,
            progressing_groups: summaries
                .iter()
                .filter(|g| g.created_count > 0 || g.deleting_count > 0)
                .count() as u32,
            group_summaries: summaries,
        }
    }
}
