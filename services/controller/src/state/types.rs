//! Value types exposed by the state store.

use ensemble_id::{InstanceId, Revision, RoleKey};
use serde::{Deserialize, Serialize};

/// Instance lifecycle status.
///
/// ```text
/// (none) -> creating <-> running
///              |            |
///              +-> deleting <+ -> (removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Backing resources requested, not all ready.
    Creating,
    /// All required resources ready.
    Running,
    /// Teardown requested. Terminal.
    Deleting,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Deleting => "deleting",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "running" => Some(Self::Running),
            "deleting" => Some(Self::Deleting),
            _ => None,
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// Self-loops are not edges; callers treat them as no-ops.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        match (self, next) {
            (Self::Creating, Self::Running) => true,
            (Self::Running, Self::Creating) => true,
            (Self::Creating, Self::Deleting) => true,
            (Self::Running, Self::Deleting) => true,
            (Self::Creating, Self::Creating) => false,
            (Self::Running, Self::Running) => false,
            (Self::Deleting, _) => false,
        }
    }

    /// Counts toward the role's live replica count.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Deleting)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of one instance entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: InstanceId,
    pub revision: Revision,
    pub status: InstanceStatus,
    pub ready_resources: u32,
    pub required_resources: u32,
    pub teardown_requested: bool,
    /// Store-wide creation ordinal. Larger is newer.
    pub sequence: u64,
}

/// Value copy of a role's instances, ordered oldest first.
///
/// Iterating does not touch the store, so it can be repeated and is not
/// affected by concurrent mutation.
#[derive(Debug, Clone, Serialize)]
pub struct RoleSnapshot {
    pub role: RoleKey,
    pub desired: u32,
    pub instances: Vec<InstanceSnapshot>,
}

impl RoleSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, InstanceSnapshot> {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Number of instances currently in `status`.
    pub fn count(&self, status: InstanceStatus) -> u32 {
        self.iter().filter(|i| i.status == status).count() as u32
    }

    /// Number of instances that are not being deleted.
    pub fn active_count(&self) -> u32 {
        self.iter().filter(|i| i.status.is_active()).count() as u32
    }

    pub fn get(&self, instance_id: &InstanceId) -> Option<&InstanceSnapshot> {
        self.iter().find(|i| &i.instance_id == instance_id)
    }
}

impl IntoIterator for RoleSnapshot {
    type Item = InstanceSnapshot;
    type IntoIter = std::vec::IntoIter<InstanceSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.instances.into_iter()
    }
}

impl<'a> IntoIterator for &'a RoleSnapshot {
    type Item = &'a InstanceSnapshot;
    type IntoIter = std::slice::Iter<'a, InstanceSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.instances.iter()
    }
}

/// Ready-counter state after a readiness event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyProgress {
    pub status: InstanceStatus,
    pub revision: Revision,
    pub ready: u32,
    pub required: u32,
}

impl ReadyProgress {
    pub fn is_complete(&self) -> bool {
        self.ready >= self.required
    }
}

/// How to reset resource bookkeeping when a running instance is demoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceReset {
    /// One backing resource failed; only it is replaced.
    FailedUnit,
    /// Every backing resource is replaced under the next revision.
    All,
}
