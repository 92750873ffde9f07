//! In-memory hierarchical state store.
//!
//! Holds workload → group → role → instance entries. Each level is a map
//! behind its own `RwLock`; each instance is a separate `Mutex` cell, so
//! updates to different instances only contend on map read locks while
//! updates to the same instance are serialized.
//!
//! Entries are never persisted. After a restart the hierarchy is rebuilt from
//! observed resources.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use ensemble_id::{GroupName, InstanceId, InstanceKey, Revision, RoleKey, RoleName, WorkloadKey};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::types::{InstanceSnapshot, InstanceStatus, ReadyProgress, ResourceReset, RoleSnapshot};

/// Errors from state store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("instance already exists: {0}")]
    AlreadyExists(InstanceKey),

    #[error("instance not found: {0}")]
    NotFound(InstanceKey),

    #[error("stale revision for {key}: event {event}, current {current}")]
    StaleRevision {
        key: InstanceKey,
        event: Revision,
        current: Revision,
    },

    #[error("invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: InstanceKey,
        from: InstanceStatus,
        to: InstanceStatus,
    },
}

/// Result type alias for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug)]
struct InstanceRecord {
    revision: Revision,
    status: InstanceStatus,
    ready: u32,
    required: u32,
    teardown_requested: bool,
    sequence: u64,
    /// Set under the cell lock when the entry leaves the role map, so a
    /// caller still holding the cell cannot mutate a removed instance.
    removed: bool,
}

impl InstanceRecord {
    fn snapshot(&self, instance_id: &InstanceId) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: instance_id.clone(),
            revision: self.revision,
            status: self.status,
            ready_resources: self.ready,
            required_resources: self.required,
            teardown_requested: self.teardown_requested,
            sequence: self.sequence,
        }
    }
}

type InstanceCell = Arc<Mutex<InstanceRecord>>;

#[derive(Debug, Default)]
struct RoleInstances {
    live: HashMap<InstanceId, InstanceCell>,
    /// IDs that were removed. Kept so an ID is never registered twice.
    retired: HashSet<InstanceId>,
}

#[derive(Debug, Default)]
struct RoleEntry {
    instances: RwLock<RoleInstances>,
    desired: AtomicU32,
}

#[derive(Debug, Default)]
struct GroupEntry {
    roles: RwLock<BTreeMap<RoleName, Arc<RoleEntry>>>,
}

#[derive(Debug, Default)]
struct WorkloadEntry {
    groups: RwLock<BTreeMap<GroupName, Arc<GroupEntry>>>,
}

// =============================================================================
// State Store
// =============================================================================

/// Concurrency-safe registry of role instances.
#[derive(Debug, Default)]
pub struct StateStore {
    workloads: RwLock<HashMap<WorkloadKey, Arc<WorkloadEntry>>>,
    sequence: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    async fn role(&self, key: &RoleKey) -> Option<Arc<RoleEntry>> {
        let workload = self.workloads.read().await.get(&key.workload).cloned()?;
        let group = workload.groups.read().await.get(&key.group).cloned()?;
        let role = group.roles.read().await.get(&key.role).cloned();
        role
    }

    async fn role_or_insert(&self, key: &RoleKey) -> Arc<RoleEntry> {
        if let Some(role) = self.role(key).await {
            return role;
        }

        let workload = {
            let mut workloads = self.workloads.write().await;
            workloads.entry(key.workload.clone()).or_default().clone()
        };
        let group = {
            let mut groups = workload.groups.write().await;
            groups.entry(key.group.clone()).or_default().clone()
        };
        let mut roles = group.roles.write().await;
        roles.entry(key.role.clone()).or_default().clone()
    }

    async fn cell(&self, key: &InstanceKey) -> Option<InstanceCell> {
        let role = self.role(&key.role).await?;
        let instances = role.instances.read().await;
        instances.live.get(&key.instance_id).cloned()
    }

    // -------------------------------------------------------------------------
    // Instance Operations
    // -------------------------------------------------------------------------

    /// Register a new instance in `Creating`.
    ///
    /// Fails with `AlreadyExists` if the ID is registered or was registered
    /// before and has since been removed.
    pub async fn add_instance(
        &self,
        key: &InstanceKey,
        revision: Revision,
        required_resources: u32,
    ) -> StoreResult<()> {
        let role = self.role_or_insert(&key.role).await;
        let mut instances = role.instances.write().await;

        debug_assert!(
            !(instances.live.contains_key(&key.instance_id)
                && instances.retired.contains(&key.instance_id)),
            "instance {key} is both live and retired"
        );

        if instances.live.contains_key(&key.instance_id)
            || instances.retired.contains(&key.instance_id)
        {
            return Err(StoreError::AlreadyExists(key.clone()));
        }

        let record = InstanceRecord {
            revision,
            status: InstanceStatus::Creating,
            ready: 0,
            required: required_resources.max(1),
            teardown_requested: false,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            removed: false,
        };
        instances
            .live
            .insert(key.instance_id.clone(), Arc::new(Mutex::new(record)));

        debug!(instance = %key, %revision, required_resources, "Instance registered");
        Ok(())
    }

    /// Current status and revision, or `None` if the instance is unknown.
    pub async fn get_status(&self, key: &InstanceKey) -> Option<(InstanceStatus, Revision)> {
        let cell = self.cell(key).await?;
        let record = cell.lock().await;
        if record.removed {
            return None;
        }
        Some((record.status, record.revision))
    }

    /// Full copy of one instance entry.
    pub async fn get_instance(&self, key: &InstanceKey) -> Option<InstanceSnapshot> {
        let cell = self.cell(key).await?;
        let record = cell.lock().await;
        if record.removed {
            return None;
        }
        Some(record.snapshot(&key.instance_id))
    }

    /// Move an instance to `new_status`.
    ///
    /// Returns `Ok(true)` only when the status actually changed. Returns
    /// `Ok(false)` if the status already equals `new_status` or the event
    /// revision is older than the stored one. An edge outside the lifecycle
    /// graph is rejected with `InvalidTransition` and nothing is mutated.
    pub async fn update_status(
        &self,
        key: &InstanceKey,
        new_status: InstanceStatus,
        event_revision: Revision,
    ) -> StoreResult<bool> {
        let cell = self
            .cell(key)
            .await
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let mut record = cell.lock().await;

        if record.removed {
            return Err(StoreError::NotFound(key.clone()));
        }

        if event_revision < record.revision {
            debug!(
                instance = %key,
                event_revision = %event_revision,
                current_revision = %record.revision,
                "Discarding stale status update"
            );
            return Ok(false);
        }

        if record.status == new_status {
            return Ok(false);
        }

        if !record.status.can_transition_to(new_status) {
            return Err(StoreError::InvalidTransition {
                key: key.clone(),
                from: record.status,
                to: new_status,
            });
        }

        let from = record.status;
        record.status = new_status;
        record.revision = record.revision.max(event_revision);

        debug!(instance = %key, %from, to = %new_status, revision = %record.revision, "Status changed");
        Ok(true)
    }

    /// Count one more ready backing resource.
    ///
    /// The counter saturates at the required count. A `Deleting` instance is
    /// reported as-is without counting.
    pub async fn record_resource_ready(
        &self,
        key: &InstanceKey,
        event_revision: Revision,
    ) -> StoreResult<ReadyProgress> {
        let cell = self
            .cell(key)
            .await
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let mut record = cell.lock().await;

        if record.removed {
            return Err(StoreError::NotFound(key.clone()));
        }

        if event_revision < record.revision {
            return Err(StoreError::StaleRevision {
                key: key.clone(),
                event: event_revision,
                current: record.revision,
            });
        }

        if record.status.is_active() {
            record.ready = (record.ready + 1).min(record.required);
        }

        Ok(ReadyProgress {
            status: record.status,
            revision: record.revision,
            ready: record.ready,
            required: record.required,
        })
    }

    /// Demote a running instance back to `Creating`.
    ///
    /// The status flip, the ready counter reset and any revision bump happen
    /// under one cell lock, so readiness for the failed resource cannot
    /// promote the instance again in between. Returns `Ok(None)` when the
    /// event is stale or the instance is already creating. A deleting
    /// instance is rejected with `InvalidTransition`.
    pub async fn demote(
        &self,
        key: &InstanceKey,
        event_revision: Revision,
        reset: ResourceReset,
    ) -> StoreResult<Option<ReadyProgress>> {
        let cell = self
            .cell(key)
            .await
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let mut record = cell.lock().await;

        if record.removed {
            return Err(StoreError::NotFound(key.clone()));
        }

        if event_revision < record.revision {
            debug!(
                instance = %key,
                event_revision = %event_revision,
                current_revision = %record.revision,
                "Discarding stale demotion"
            );
            return Ok(None);
        }

        match record.status {
            InstanceStatus::Running => {}
            InstanceStatus::Creating => return Ok(None),
            InstanceStatus::Deleting => {
                return Err(StoreError::InvalidTransition {
                    key: key.clone(),
                    from: InstanceStatus::Deleting,
                    to: InstanceStatus::Creating,
                });
            }
        }

        record.status = InstanceStatus::Creating;
        record.revision = record.revision.max(event_revision);
        match reset {
            ResourceReset::FailedUnit => {
                record.ready = record.ready.saturating_sub(1);
            }
            ResourceReset::All => {
                record.ready = 0;
                record.revision = record.revision.next();
            }
        }

        debug!(
            instance = %key,
            revision = %record.revision,
            ready = record.ready,
            required = record.required,
            "Instance demoted"
        );
        Ok(Some(ReadyProgress {
            status: record.status,
            revision: record.revision,
            ready: record.ready,
            required: record.required,
        }))
    }

    /// Claim the teardown request for a `Deleting` instance.
    ///
    /// Returns true the first time only; the caller that gets true issues the
    /// teardown.
    pub async fn mark_teardown_requested(&self, key: &InstanceKey) -> StoreResult<bool> {
        let cell = self
            .cell(key)
            .await
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let mut record = cell.lock().await;

        if record.removed {
            return Err(StoreError::NotFound(key.clone()));
        }

        if record.status != InstanceStatus::Deleting {
            return Err(StoreError::InvalidTransition {
                key: key.clone(),
                from: record.status,
                to: InstanceStatus::Deleting,
            });
        }

        if record.teardown_requested {
            return Ok(false);
        }

        record.teardown_requested = true;
        Ok(true)
    }

    /// Release a teardown claim after the request was not accepted.
    pub async fn clear_teardown_requested(&self, key: &InstanceKey) -> StoreResult<()> {
        let cell = self
            .cell(key)
            .await
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let mut record = cell.lock().await;

        if record.removed {
            return Err(StoreError::NotFound(key.clone()));
        }

        record.teardown_requested = false;
        Ok(())
    }

    /// Remove an instance. Absent instances are ignored.
    ///
    /// Returns true if an entry was removed. The ID is retired either way.
    pub async fn remove_instance(&self, key: &InstanceKey) -> bool {
        self.retire(key, "removed").await
    }

    /// Roll back a registration whose backing resources were never accepted.
    pub async fn discard_instance(&self, key: &InstanceKey) -> bool {
        self.retire(key, "discarded").await
    }

    async fn retire(&self, key: &InstanceKey, action: &'static str) -> bool {
        let Some(role) = self.role(&key.role).await else {
            return false;
        };

        let mut instances = role.instances.write().await;
        instances.retired.insert(key.instance_id.clone());

        let Some(cell) = instances.live.remove(&key.instance_id) else {
            return false;
        };
        cell.lock().await.removed = true;

        debug!(instance = %key, action, "Instance retired");
        true
    }

    // -------------------------------------------------------------------------
    // Role Operations
    // -------------------------------------------------------------------------

    /// Snapshot of a role's instances, oldest first.
    pub async fn list_instances(&self, key: &RoleKey) -> RoleSnapshot {
        let Some(role) = self.role(key).await else {
            return RoleSnapshot {
                role: key.clone(),
                desired: 0,
                instances: Vec::new(),
            };
        };

        let cells: Vec<(InstanceId, InstanceCell)> = {
            let instances = role.instances.read().await;
            instances
                .live
                .iter()
                .map(|(id, cell)| (id.clone(), Arc::clone(cell)))
                .collect()
        };

        let mut snapshots = Vec::with_capacity(cells.len());
        for (instance_id, cell) in cells {
            let record = cell.lock().await;
            if !record.removed {
                snapshots.push(record.snapshot(&instance_id));
            }
        }
        snapshots.sort_by_key(|s| s.sequence);

        RoleSnapshot {
            role: key.clone(),
            desired: role.desired.load(Ordering::SeqCst),
            instances: snapshots,
        }
    }

    /// Record the desired replica count of a role.
    pub async fn set_desired(&self, key: &RoleKey, desired: u32) {
        let role = self.role_or_insert(key).await;
        role.desired.store(desired, Ordering::SeqCst);
    }

    /// Desired replica count of a role (0 if unknown).
    pub async fn desired(&self, key: &RoleKey) -> u32 {
        match self.role(key).await {
            Some(role) => role.desired.load(Ordering::SeqCst),
            None => 0,
        }
    }

    /// Workloads with at least one registered role.
    pub async fn list_workloads(&self) -> Vec<WorkloadKey> {
        let mut keys: Vec<WorkloadKey> = self.workloads.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Groups registered under a workload.
    pub async fn list_groups(&self, workload: &WorkloadKey) -> Vec<GroupName> {
        let Some(entry) = self.workloads.read().await.get(workload).cloned() else {
            return Vec::new();
        };
        let groups = entry.groups.read().await;
        groups.keys().cloned().collect()
    }

    /// Roles registered under a group.
    pub async fn list_roles(&self, workload: &WorkloadKey, group: &GroupName) -> Vec<RoleName> {
        let Some(entry) = self.workloads.read().await.get(workload).cloned() else {
            return Vec::new();
        };
        let Some(group) = entry.groups.read().await.get(group).cloned() else {
            return Vec::new();
        };
        let roles = group.roles.read().await;
        roles.keys().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
