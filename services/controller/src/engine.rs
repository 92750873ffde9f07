//! Instance lifecycle engine.
//!
//! Drives role instances through `creating -> running -> deleting` in
//! response to scale requests and compute resource events.
//!
//! ## Ordering
//!
//! Scale and delete operations on one role are serialized by a per-role lock,
//! so two concurrent scale requests never both create instances for the same
//! gap. Resource events are not role-locked; they only touch one instance and
//! rely on the state store's per-instance serialization and revision checks.
//!
//! ## Provisioning failures
//!
//! A new instance is registered before its resources are requested. If the
//! request is rejected the registration is rolled back. Failures reported
//! later for an existing instance are retried with exponential backoff, bounded
//! both per call and by a per-instance budget over a sliding window. Resources
//! accepted for an instance that was deleted meanwhile are torn down again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ensemble_id::{InstanceId, InstanceKey, Revision, RoleKey};
use ensemble_reconcile::{
    select_for_drain, BackoffPolicy, DrainPriority, RetryTracker, RevisionTracker, SpecHash,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::notifier::TransitionNotifier;
use crate::resources::{ComputeResourceManager, ProvisionRequest, TeardownRequest};
use crate::state::{InstanceSnapshot, InstanceStatus, ResourceReset, StateStore, StoreError};

/// Errors from lifecycle operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to provision resources for {key}: {reason}")]
    ResourceProvisioning { key: InstanceKey, reason: String },

    #[error("failed to tear down resources for {key}: {reason}")]
    ResourceTeardown { key: InstanceKey, reason: String },

    #[error("provisioning retries exhausted for {key} after {attempts} failed attempts")]
    RetriesExhausted { key: InstanceKey, attempts: u32 },
}

/// Result type alias for lifecycle operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// What a demoted instance gets re-provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DemotionPolicy {
    /// Replace only the failed resource; other ready resources keep counting.
    #[default]
    ReprovisionFailed,

    /// Replace every resource under a new revision.
    ReplaceAll,
}

impl DemotionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReprovisionFailed => "reprovision-failed",
            Self::ReplaceAll => "replace-all",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "reprovision-failed" => Some(Self::ReprovisionFailed),
            "replace-all" => Some(Self::ReplaceAll),
            _ => None,
        }
    }
}

/// Retry limits for provisioning after a resource failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRetryPolicy {
    /// Provision calls per failure event, including the first.
    pub max_attempts: u32,

    /// Delay between calls.
    pub backoff: BackoffPolicy,

    /// Failed calls tolerated per instance inside `window`.
    pub budget: u32,

    /// Sliding window for `budget`.
    pub window: Duration,
}

impl Default for ProvisionRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            budget: DEFAULT_MAX_RETRIES,
            window: DEFAULT_RETRY_WINDOW,
        }
    }
}

/// Lifecycle engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Backing resources per instance for roles without an applied template.
    pub default_required_resources: u32,

    pub demotion: DemotionPolicy,

    pub retry: ProvisionRetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_required_resources: 1,
            demotion: DemotionPolicy::default(),
            retry: ProvisionRetryPolicy::default(),
        }
    }
}

/// Instance template of a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleTemplate {
    /// Backing resources each instance needs before it is running.
    pub required_resources: u32,

    /// Opaque template body. Any change yields a new revision.
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Copy)]
struct AppliedTemplate {
    revision: Revision,
    required_resources: u32,
}

/// Instance lifecycle engine.
pub struct LifecycleEngine {
    store: Arc<StateStore>,
    resources: Arc<dyn ComputeResourceManager>,
    notifier: Arc<TransitionNotifier>,
    config: EngineConfig,

    /// Serializes scale and delete operations per role.
    role_locks: Mutex<HashMap<RoleKey, Arc<Mutex<()>>>>,

    templates: RwLock<HashMap<RoleKey, AppliedTemplate>>,
    revisions: Mutex<RevisionTracker<RoleKey>>,

    /// Provisioning failures per instance key.
    retries: Mutex<RetryTracker>,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<StateStore>,
        resources: Arc<dyn ComputeResourceManager>,
        notifier: Arc<TransitionNotifier>,
        config: EngineConfig,
    ) -> Self {
        let retries = RetryTracker::new(config.retry.budget, config.retry.window);
        Self {
            store,
            resources,
            notifier,
            config,
            role_locks: Mutex::new(HashMap::new()),
            templates: RwLock::new(HashMap::new()),
            revisions: Mutex::new(RevisionTracker::new()),
            retries: Mutex::new(retries),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Templates
    // -------------------------------------------------------------------------

    /// Apply a role template and return the revision new instances get.
    ///
    /// Re-applying an identical template keeps the current revision.
    pub async fn apply_template(&self, role: &RoleKey, template: &RoleTemplate) -> Revision {
        let required_resources = template.required_resources.max(1);
        let hash = SpecHash::from_json(&serde_json::json!({
            "requiredResources": required_resources,
            "spec": template.spec,
        }));

        let (revision, changed) = self.revisions.lock().await.observe(role.clone(), hash);
        let revision = Revision::new(revision);

        self.templates.write().await.insert(
            role.clone(),
            AppliedTemplate {
                revision,
                required_resources,
            },
        );

        if changed {
            info!(role = %role, %revision, required_resources, "Role template applied");
        }
        revision
    }

    /// Revision and resource count for new instances of `role`.
    pub async fn template_for(&self, role: &RoleKey) -> (Revision, u32) {
        match self.templates.read().await.get(role) {
            Some(applied) => (applied.revision, applied.required_resources),
            None => (Revision::FIRST, self.config.default_required_resources.max(1)),
        }
    }

    // -------------------------------------------------------------------------
    // Scaling
    // -------------------------------------------------------------------------

    /// Bring a role to `desired` live instances in either direction.
    ///
    /// Also re-issues teardown for deleting instances whose earlier teardown
    /// request was not accepted.
    pub async fn scale(&self, role: &RoleKey, desired: u32) -> EngineResult<()> {
        let active = self.store.list_instances(role).await.active_count();

        let scaled = if desired > active {
            self.scale_up(role, desired).await.map(|_| ())
        } else if desired < active {
            self.scale_down(role, desired).await.map(|_| ())
        } else {
            self.store.set_desired(role, desired).await;
            Ok(())
        };

        // A failed scale step must not hold back teardowns of the role.
        let redriven = self.redrive_teardowns(role).await;
        scaled.and(redriven)
    }

    /// Create instances until the role has `desired` live instances.
    ///
    /// Returns the keys of the created instances. Never deletes.
    pub async fn scale_up(&self, role: &RoleKey, desired: u32) -> EngineResult<Vec<InstanceKey>> {
        let _guard = self.lock_role(role).await;
        self.store.set_desired(role, desired).await;

        let active = self.store.list_instances(role).await.active_count();
        if desired <= active {
            debug!(role = %role, desired, active, "Scale up not needed");
            return Ok(Vec::new());
        }

        let (revision, required) = self.template_for(role).await;
        let mut created = Vec::with_capacity((desired - active) as usize);

        for _ in active..desired {
            let key = role.instance(InstanceId::generate(&role.role));
            self.store.add_instance(&key, revision, required).await?;

            let request = ProvisionRequest {
                key: key.clone(),
                revision,
                units: required,
            };
            if let Err(e) = self.resources.provision(&request).await {
                self.store.discard_instance(&key).await;
                warn!(
                    instance = %key,
                    error = %e,
                    created = created.len(),
                    "Provision request rejected, instance rolled back"
                );
                return Err(EngineError::ResourceProvisioning {
                    key,
                    reason: format!("{e:#}"),
                });
            }

            self.notifier.notify(&key, InstanceStatus::Creating).await;
            created.push(key);
        }

        info!(role = %role, desired, created = created.len(), %revision, "Scaled up");
        Ok(created)
    }

    /// Delete instances until the role has at most `target` live instances.
    ///
    /// Creating instances go before running ones; inside each class the
    /// newest goes first. Returns the keys moved to deleting.
    pub async fn scale_down(&self, role: &RoleKey, target: u32) -> EngineResult<Vec<InstanceKey>> {
        let _guard = self.lock_role(role).await;
        self.store.set_desired(role, target).await;

        let mut candidates: Vec<InstanceSnapshot> = self
            .store
            .list_instances(role)
            .await
            .into_iter()
            .filter(|i| i.status.is_active())
            .collect();

        let active = candidates.len() as u32;
        if active <= target {
            debug!(role = %role, target, active, "Scale down not needed");
            return Ok(Vec::new());
        }

        candidates.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        let victims = select_for_drain(candidates, |i| match i.status {
            InstanceStatus::Running => DrainPriority::Ready,
            InstanceStatus::Creating | InstanceStatus::Deleting => DrainPriority::NotReady,
        });

        let mut deleted = Vec::new();
        for victim in victims.into_iter().take((active - target) as usize) {
            let key = role.instance(victim.instance_id);
            self.delete_locked(&key).await?;
            deleted.push(key);
        }

        info!(role = %role, target, deleted = deleted.len(), "Scaled down");
        Ok(deleted)
    }

    // -------------------------------------------------------------------------
    // Deletion
    // -------------------------------------------------------------------------

    /// Move an instance to deleting and request teardown once.
    ///
    /// Unknown instances are ignored. Calling again for an instance whose
    /// teardown was already accepted does nothing.
    pub async fn delete_instance(&self, key: &InstanceKey) -> EngineResult<()> {
        let _guard = self.lock_role(&key.role).await;
        self.delete_locked(key).await
    }

    async fn delete_locked(&self, key: &InstanceKey) -> EngineResult<()> {
        let Some((_, revision)) = self.store.get_status(key).await else {
            debug!(instance = %key, "Delete for unknown instance ignored");
            return Ok(());
        };

        self.transition(key, InstanceStatus::Deleting, revision).await?;
        self.request_teardown(key).await
    }

    async fn request_teardown(&self, key: &InstanceKey) -> EngineResult<()> {
        match self.store.mark_teardown_requested(key).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(instance = %key, "Teardown already requested");
                return Ok(());
            }
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let request = TeardownRequest { key: key.clone() };
        if let Err(e) = self.resources.teardown(&request).await {
            if let Err(clear) = self.store.clear_teardown_requested(key).await {
                debug!(instance = %key, error = %clear, "Teardown claim already gone");
            }
            warn!(instance = %key, error = %e, "Teardown request rejected");
            return Err(EngineError::ResourceTeardown {
                key: key.clone(),
                reason: format!("{e:#}"),
            });
        }

        debug!(instance = %key, "Teardown requested");
        Ok(())
    }

    /// Re-issue teardown for deleting instances without an accepted request.
    pub async fn redrive_teardowns(&self, role: &RoleKey) -> EngineResult<()> {
        let _guard = self.lock_role(role).await;

        let pending: Vec<InstanceKey> = self
            .store
            .list_instances(role)
            .await
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Deleting && !i.teardown_requested)
            .map(|i| role.instance(i.instance_id))
            .collect();

        for key in pending {
            info!(instance = %key, "Re-issuing teardown");
            self.request_teardown(&key).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Resource Events
    // -------------------------------------------------------------------------

    /// Count one ready resource; promote to running once all are ready.
    ///
    /// Returns true if the instance was promoted. Events for unknown
    /// instances or older revisions are dropped.
    pub async fn handle_resource_ready(
        &self,
        key: &InstanceKey,
        revision: Revision,
    ) -> EngineResult<bool> {
        let progress = match self.store.record_resource_ready(key, revision).await {
            Ok(progress) => progress,
            Err(StoreError::NotFound(_)) => {
                debug!(instance = %key, "Readiness for unknown instance ignored");
                return Ok(false);
            }
            Err(StoreError::StaleRevision { event, current, .. }) => {
                debug!(instance = %key, %event, %current, "Stale readiness event ignored");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            instance = %key,
            ready = progress.ready,
            required = progress.required,
            status = %progress.status,
            "Resource ready"
        );

        if progress.status != InstanceStatus::Creating || !progress.is_complete() {
            return Ok(false);
        }

        let promoted = self
            .transition(key, InstanceStatus::Running, revision)
            .await?;
        if promoted {
            self.retries.lock().await.clear(&key.to_string());
        }
        Ok(promoted)
    }

    /// React to a backing resource failure.
    ///
    /// A running instance is demoted to creating and re-provisioned according
    /// to the demotion policy. A creating instance has the failed resource
    /// re-provisioned. Deleting or unknown instances are left alone.
    pub async fn handle_resource_error(
        &self,
        key: &InstanceKey,
        revision: Revision,
    ) -> EngineResult<()> {
        let Some((status, current)) = self.store.get_status(key).await else {
            debug!(instance = %key, "Resource error for unknown instance ignored");
            return Ok(());
        };

        if revision < current {
            debug!(instance = %key, event = %revision, %current, "Stale resource error ignored");
            return Ok(());
        }

        match status {
            InstanceStatus::Running => {
                let reset = match self.config.demotion {
                    DemotionPolicy::ReprovisionFailed => ResourceReset::FailedUnit,
                    DemotionPolicy::ReplaceAll => ResourceReset::All,
                };
                let progress = match self.store.demote(key, revision, reset).await {
                    Ok(Some(progress)) => progress,
                    Ok(None) => {
                        debug!(instance = %key, "Instance already demoted");
                        return Ok(());
                    }
                    Err(StoreError::NotFound(_) | StoreError::InvalidTransition { .. }) => {
                        debug!(instance = %key, "Instance left running before demotion");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                self.notifier.notify(key, InstanceStatus::Creating).await;
                warn!(instance = %key, policy = self.config.demotion.as_str(), "Instance demoted");

                let units = match reset {
                    ResourceReset::FailedUnit => 1,
                    ResourceReset::All => progress.required,
                };
                self.provision_with_retry(key, progress.revision, units).await
            }
            InstanceStatus::Creating => self.provision_with_retry(key, current, 1).await,
            InstanceStatus::Deleting => {
                debug!(instance = %key, "Resource error for deleting instance ignored");
                Ok(())
            }
        }
    }

    /// Remove a deleting instance whose resources are gone.
    ///
    /// Returns true if the instance was removed.
    pub async fn handle_teardown_complete(&self, key: &InstanceKey) -> EngineResult<bool> {
        match self.store.get_status(key).await {
            None => {
                debug!(instance = %key, "Teardown completion for unknown instance ignored");
                Ok(false)
            }
            Some((InstanceStatus::Deleting, _)) => {
                let removed = self.store.remove_instance(key).await;
                self.retries.lock().await.clear(&key.to_string());
                if removed {
                    info!(instance = %key, "Instance removed");
                }
                Ok(removed)
            }
            Some((status, _)) => {
                warn!(instance = %key, %status, "Teardown completion for instance not being deleted");
                Ok(false)
            }
        }
    }

    /// Drop retry bookkeeping older than the retry window.
    pub async fn prune_retries(&self) -> usize {
        let mut retries = self.retries.lock().await;
        retries.prune();
        retries.tracked()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn lock_role(&self, role: &RoleKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.role_locks.lock().await;
            Arc::clone(locks.entry(role.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Commit a status change and notify if it took effect.
    ///
    /// Losing a race against deletion or removal is not an error.
    async fn transition(
        &self,
        key: &InstanceKey,
        status: InstanceStatus,
        revision: Revision,
    ) -> EngineResult<bool> {
        match self.store.update_status(key, status, revision).await {
            Ok(true) => {
                self.notifier.notify(key, status).await;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(StoreError::NotFound(_)) => {
                debug!(instance = %key, to = %status, "Instance gone before transition");
                Ok(false)
            }
            Err(StoreError::InvalidTransition {
                from: InstanceStatus::Deleting,
                ..
            }) => {
                debug!(instance = %key, to = %status, "Instance already deleting");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn provision_with_retry(
        &self,
        key: &InstanceKey,
        revision: Revision,
        units: u32,
    ) -> EngineResult<()> {
        let policy = &self.config.retry;
        let retry_key = key.to_string();

        if self.retries.lock().await.is_exhausted(&retry_key) {
            warn!(instance = %key, "Provisioning retry budget exhausted");
            return Err(EngineError::RetriesExhausted {
                key: key.clone(),
                attempts: policy.budget,
            });
        }

        let request = ProvisionRequest {
            key: key.clone(),
            revision,
            units,
        };
        let mut attempt = 0u32;

        loop {
            // The first request only needs the instance to be live at this
            // revision; retries also need it to still be creating.
            let proceed = match self.store.get_status(key).await {
                Some((InstanceStatus::Deleting, _)) | None => false,
                Some((status, current)) => {
                    current == revision && (attempt == 0 || status == InstanceStatus::Creating)
                }
            };
            if !proceed {
                debug!(instance = %key, attempt, "Instance moved on, abandoning provisioning");
                return Ok(());
            }

            let err = match self.resources.provision(&request).await {
                Ok(()) => {
                    debug!(instance = %key, %revision, units, attempt, "Re-provision requested");
                    self.reclaim_if_deleted(key).await;
                    return Ok(());
                }
                Err(e) => e,
            };

            attempt += 1;
            let exhausted = self.retries.lock().await.record_failure(&retry_key);
            warn!(instance = %key, attempt, error = %err, "Provision request rejected");

            if exhausted {
                return Err(EngineError::RetriesExhausted {
                    key: key.clone(),
                    attempts: policy.budget,
                });
            }
            if attempt >= policy.max_attempts.max(1) {
                return Err(EngineError::ResourceProvisioning {
                    key: key.clone(),
                    reason: format!("{err:#}"),
                });
            }

            tokio::time::sleep(policy.backoff.delay(attempt - 1)).await;
        }
    }

    /// Tear down resources accepted for an instance that was deleted while
    /// the request was in flight.
    async fn reclaim_if_deleted(&self, key: &InstanceKey) {
        match self.store.get_status(key).await {
            Some((InstanceStatus::Deleting, _)) | None => {}
            Some(_) => return,
        }

        info!(instance = %key, "Instance deleted during provisioning, reclaiming resources");
        let request = TeardownRequest { key: key.clone() };
        if let Err(e) = self.resources.teardown(&request).await {
            warn!(instance = %key, error = %e, "Reclaim teardown rejected");
        }
    }
}

impl std::fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{MemorySink, DEFAULT_SEND_TIMEOUT};
    use crate::resources::MockResourceManager;
    use ensemble_id::{GroupName, RoleName};

    struct Harness {
        engine: LifecycleEngine,
        store: Arc<StateStore>,
        resources: Arc<MockResourceManager>,
        sink: Arc<MemorySink>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let store = Arc::new(StateStore::new());
        let resources = Arc::new(MockResourceManager::new());
        let sink = Arc::new(MemorySink::new());
        let notifier = Arc::new(TransitionNotifier::new(sink.clone(), DEFAULT_SEND_TIMEOUT));
        let engine = LifecycleEngine::new(store.clone(), resources.clone(), notifier, config);
        Harness {
            engine,
            store,
            resources,
            sink,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry: ProvisionRetryPolicy {
                backoff: BackoffPolicy {
                    base: Duration::from_millis(1),
                    max: Duration::from_millis(5),
                    jitter: 0.0,
                },
                ..ProvisionRetryPolicy::default()
            },
            ..EngineConfig::default()
        }
    }

    fn role_key(role: &str) -> RoleKey {
        RoleKey::new(
            "inference/llama".parse().unwrap(),
            GroupName::parse("llama-0").unwrap(),
            RoleName::parse(role).unwrap(),
        )
    }

    async fn status(store: &StateStore, key: &InstanceKey) -> Option<InstanceStatus> {
        store.get_status(key).await.map(|(s, _)| s)
    }

    #[tokio::test]
    async fn test_apply_template_revision() {
        let h = harness(EngineConfig::default());
        let role = role_key("prefill");
        let template = RoleTemplate {
            required_resources: 2,
            spec: serde_json::json!({"image": "llama:1"}),
        };

        assert_eq!(h.engine.apply_template(&role, &template).await, Revision::new(1));
        assert_eq!(h.engine.apply_template(&role, &template).await, Revision::new(1));

        let changed = RoleTemplate {
            spec: serde_json::json!({"image": "llama:2"}),
            ..template
        };
        assert_eq!(h.engine.apply_template(&role, &changed).await, Revision::new(2));
        assert_eq!(h.engine.template_for(&role).await, (Revision::new(2), 2));
    }

    #[tokio::test]
    async fn test_scale_up_creates_and_notifies() {
        let h = harness(EngineConfig::default());
        let role = role_key("prefill");

        let created = h.engine.scale_up(&role, 3).await.unwrap();

        assert_eq!(created.len(), 3);
        assert_eq!(h.resources.provision_count(), 3);
        for key in &created {
            assert_eq!(status(&h.store, key).await, Some(InstanceStatus::Creating));
            assert_eq!(h.sink.count(key, InstanceStatus::Creating).await, 1);
        }
        assert_eq!(h.store.desired(&role).await, 3);

        let again = h.engine.scale_up(&role, 3).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(h.resources.provision_count(), 3);
    }

    #[tokio::test]
    async fn test_scale_up_rolls_back_rejected_instance() {
        let h = harness(EngineConfig::default());
        let role = role_key("prefill");
        h.resources.fail_next_provisions(1);

        let err = h.engine.scale_up(&role, 2).await.unwrap_err();

        assert!(matches!(err, EngineError::ResourceProvisioning { .. }));
        assert!(h.store.list_instances(&role).await.is_empty());
        assert!(h.sink.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_ready_promotes_after_all_resources() {
        let h = harness(EngineConfig::default());
        let role = role_key("decode");
        h.engine
            .apply_template(
                &role,
                &RoleTemplate {
                    required_resources: 2,
                    spec: serde_json::Value::Null,
                },
            )
            .await;
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);

        assert!(!h.engine.handle_resource_ready(&key, Revision::FIRST).await.unwrap());
        assert!(h.engine.handle_resource_ready(&key, Revision::FIRST).await.unwrap());
        assert!(!h.engine.handle_resource_ready(&key, Revision::FIRST).await.unwrap());

        assert_eq!(status(&h.store, &key).await, Some(InstanceStatus::Running));
        assert_eq!(h.sink.count(&key, InstanceStatus::Running).await, 1);
    }

    #[tokio::test]
    async fn test_ready_for_unknown_instance_is_ignored() {
        let h = harness(EngineConfig::default());
        let role = role_key("decode");
        let key = role.instance(InstanceId::generate(&role.role));

        assert!(!h.engine.handle_resource_ready(&key, Revision::FIRST).await.unwrap());
    }

    #[tokio::test]
    async fn test_scale_down_prefers_creating_then_newest() {
        let h = harness(EngineConfig::default());
        let role = role_key("prefill");
        let created = h.engine.scale_up(&role, 4).await.unwrap();

        // Oldest two become running.
        for key in &created[..2] {
            h.engine.handle_resource_ready(key, Revision::FIRST).await.unwrap();
        }

        let deleted = h.engine.scale_down(&role, 1).await.unwrap();

        assert_eq!(deleted, vec![created[3].clone(), created[2].clone(), created[1].clone()]);
        assert_eq!(status(&h.store, &created[0]).await, Some(InstanceStatus::Running));
        assert_eq!(h.resources.teardown_count(), 3);
    }

    #[tokio::test]
    async fn test_delete_issues_single_teardown() {
        let h = harness(EngineConfig::default());
        let role = role_key("prefill");
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);

        h.engine.delete_instance(&key).await.unwrap();
        h.engine.delete_instance(&key).await.unwrap();

        assert_eq!(h.resources.teardowns_for(&key).await, 1);
        assert_eq!(h.sink.count(&key, InstanceStatus::Deleting).await, 1);
    }

    #[tokio::test]
    async fn test_rejected_teardown_is_redriven() {
        let h = harness(EngineConfig::default());
        let role = role_key("prefill");
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);
        h.resources.fail_next_teardowns(1);

        let err = h.engine.delete_instance(&key).await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceTeardown { .. }));
        assert_eq!(status(&h.store, &key).await, Some(InstanceStatus::Deleting));

        h.engine.scale(&role, 0).await.unwrap();
        assert_eq!(h.resources.teardowns_for(&key).await, 1);
    }

    #[tokio::test]
    async fn test_failed_scale_up_still_redrives_teardowns() {
        let h = harness(EngineConfig::default());
        let role = role_key("prefill");
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);
        h.resources.fail_next_teardowns(1);
        h.engine.delete_instance(&key).await.unwrap_err();

        h.resources.fail_next_provisions(1);
        let err = h.engine.scale(&role, 1).await.unwrap_err();

        assert!(matches!(err, EngineError::ResourceProvisioning { .. }));
        assert_eq!(h.resources.teardowns_for(&key).await, 1);
        assert_eq!(h.store.list_instances(&role).await.active_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_complete_removes_only_deleting() {
        let h = harness(EngineConfig::default());
        let role = role_key("prefill");
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);

        assert!(!h.engine.handle_teardown_complete(&key).await.unwrap());
        assert_eq!(status(&h.store, &key).await, Some(InstanceStatus::Creating));

        h.engine.delete_instance(&key).await.unwrap();
        assert!(h.engine.handle_teardown_complete(&key).await.unwrap());
        assert_eq!(status(&h.store, &key).await, None);
        assert!(!h.engine.handle_teardown_complete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_error_demotes_running_and_reprovisions_failed_unit() {
        let h = harness(fast_config());
        let role = role_key("decode");
        h.engine
            .apply_template(
                &role,
                &RoleTemplate {
                    required_resources: 2,
                    spec: serde_json::Value::Null,
                },
            )
            .await;
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);
        h.engine.handle_resource_ready(&key, Revision::FIRST).await.unwrap();
        h.engine.handle_resource_ready(&key, Revision::FIRST).await.unwrap();

        h.engine.handle_resource_error(&key, Revision::FIRST).await.unwrap();

        let instance = h.store.get_instance(&key).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Creating);
        assert_eq!(instance.ready_resources, 1);

        let provisions = h.resources.provisions_for(&key).await;
        assert_eq!(provisions.len(), 2);
        assert_eq!(provisions[1].units, 1);

        // One more ready event restores it.
        assert!(h.engine.handle_resource_ready(&key, Revision::FIRST).await.unwrap());
        assert_eq!(
            h.sink.history(&key).await,
            vec![
                InstanceStatus::Creating,
                InstanceStatus::Running,
                InstanceStatus::Creating,
                InstanceStatus::Running
            ]
        );
    }

    #[tokio::test]
    async fn test_error_with_replace_all_bumps_revision() {
        let h = harness(EngineConfig {
            demotion: DemotionPolicy::ReplaceAll,
            ..fast_config()
        });
        let role = role_key("decode");
        h.engine
            .apply_template(
                &role,
                &RoleTemplate {
                    required_resources: 2,
                    spec: serde_json::Value::Null,
                },
            )
            .await;
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);
        h.engine.handle_resource_ready(&key, Revision::FIRST).await.unwrap();
        h.engine.handle_resource_ready(&key, Revision::FIRST).await.unwrap();

        h.engine.handle_resource_error(&key, Revision::FIRST).await.unwrap();

        let instance = h.store.get_instance(&key).await.unwrap();
        assert_eq!(instance.ready_resources, 0);
        assert_eq!(instance.revision, Revision::new(2));

        let provisions = h.resources.provisions_for(&key).await;
        assert_eq!(provisions[1].units, 2);
        assert_eq!(provisions[1].revision, Revision::new(2));

        // Late readiness from the old resources does not count.
        assert!(!h.engine.handle_resource_ready(&key, Revision::FIRST).await.unwrap());
        assert_eq!(h.store.get_instance(&key).await.unwrap().ready_resources, 0);
    }

    #[tokio::test]
    async fn test_error_retries_with_backoff() {
        let h = harness(fast_config());
        let role = role_key("prefill");
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);
        h.resources.fail_next_provisions(2);

        h.engine.handle_resource_error(&key, Revision::FIRST).await.unwrap();

        // One initial call, two rejected retries, one accepted.
        assert_eq!(h.resources.provision_count(), 4);
    }

    #[tokio::test]
    async fn test_error_gives_up_after_max_attempts() {
        let h = harness(fast_config());
        let role = role_key("prefill");
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);
        h.resources.fail_next_provisions(10);

        let err = h
            .engine
            .handle_resource_error(&key, Revision::FIRST)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ResourceProvisioning { .. }));
        assert_eq!(h.resources.provision_count(), 1 + 3);
        assert_eq!(status(&h.store, &key).await, Some(InstanceStatus::Creating));
    }

    #[tokio::test]
    async fn test_error_budget_exhaustion() {
        let mut config = fast_config();
        config.retry.budget = 2;
        let h = harness(config);
        let role = role_key("prefill");
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);
        h.resources.fail_next_provisions(10);

        let err = h
            .engine
            .handle_resource_error(&key, Revision::FIRST)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RetriesExhausted { .. }));

        let calls = h.resources.provision_count();
        let err = h
            .engine
            .handle_resource_error(&key, Revision::FIRST)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RetriesExhausted { .. }));
        assert_eq!(h.resources.provision_count(), calls);
    }

    #[tokio::test]
    async fn test_error_on_deleting_instance_is_ignored() {
        let h = harness(fast_config());
        let role = role_key("prefill");
        let key = h.engine.scale_up(&role, 1).await.unwrap().remove(0);
        h.engine.delete_instance(&key).await.unwrap();

        h.engine.handle_resource_error(&key, Revision::FIRST).await.unwrap();

        assert_eq!(h.resources.provision_count(), 1);
        assert_eq!(status(&h.store, &key).await, Some(InstanceStatus::Deleting));
    }

    #[test]
    fn test_demotion_policy_names() {
        for policy in [DemotionPolicy::ReprovisionFailed, DemotionPolicy::ReplaceAll] {
            assert_eq!(DemotionPolicy::from_str(policy.as_str()), Some(policy));
        }
        assert_eq!(DemotionPolicy::from_str("restart"), None);
    }
}
