//! Compute resource manager interface and mock implementation.
//!
//! The controller never touches pods, VMs or accelerators directly. It asks a
//! [`ComputeResourceManager`] to provision or tear down the backing resources
//! of an instance and later learns the outcome through readiness, failure and
//! teardown-complete events.
//!
//! A mock implementation is provided for testing and development.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ensemble_id::{InstanceKey, Revision};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::actors::ControllerEvent;

/// Request to create backing resources for an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub key: InstanceKey,

    /// Revision the resources are created under. Readiness events echo it.
    pub revision: Revision,

    /// Number of backing resources to create.
    pub units: u32,
}

/// Request to release all backing resources of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownRequest {
    pub key: InstanceKey,
}

/// Compute resource manager interface.
///
/// Both calls only report whether the request was accepted. Completion is
/// asynchronous and arrives as a [`ControllerEvent`].
#[async_trait]
pub trait ComputeResourceManager: Send + Sync {
    /// Request backing resources for an instance.
    async fn provision(&self, request: &ProvisionRequest) -> Result<()>;

    /// Request teardown of an instance's backing resources.
    async fn teardown(&self, request: &TeardownRequest) -> Result<()>;
}

/// Where the mock reports simulated completions.
#[derive(Debug, Clone)]
struct Completion {
    events: mpsc::Sender<ControllerEvent>,
    delay: Duration,
}

/// Mock resource manager for testing and development.
///
/// Records every request. Failures can be scripted per call. When built with
/// [`MockResourceManager::with_completions`] it also feeds readiness and
/// teardown-complete events back into the controller after a delay.
#[derive(Debug, Default)]
pub struct MockResourceManager {
    provision_calls: AtomicU64,
    teardown_calls: AtomicU64,

    /// Number of upcoming provision calls that fail.
    fail_provisions: AtomicU32,

    /// Number of upcoming teardown calls that fail.
    fail_teardowns: AtomicU32,

    /// Fail every provision call.
    always_fail: bool,

    provisions: Mutex<Vec<ProvisionRequest>>,
    teardowns: Mutex<Vec<TeardownRequest>>,

    completion: Option<Completion>,
}

impl MockResourceManager {
    /// Create a new mock manager that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock manager that rejects all provision requests.
    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    /// Create a mock manager that reports completions on `events`.
    pub fn with_completions(events: mpsc::Sender<ControllerEvent>, delay: Duration) -> Self {
        Self {
            completion: Some(Completion { events, delay }),
            ..Self::default()
        }
    }

    /// Make the next `n` provision calls fail.
    pub fn fail_next_provisions(&self, n: u32) {
        self.fail_provisions.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` teardown calls fail.
    pub fn fail_next_teardowns(&self, n: u32) {
        self.fail_teardowns.store(n, Ordering::SeqCst);
    }

    /// Total provision calls, including rejected ones.
    pub fn provision_count(&self) -> u64 {
        self.provision_calls.load(Ordering::SeqCst)
    }

    /// Total teardown calls, including rejected ones.
    pub fn teardown_count(&self) -> u64 {
        self.teardown_calls.load(Ordering::SeqCst)
    }

    /// Accepted provision requests, in call order.
    pub async fn provisions(&self) -> Vec<ProvisionRequest> {
        self.provisions.lock().await.clone()
    }

    /// Accepted teardown requests, in call order.
    pub async fn teardowns(&self) -> Vec<TeardownRequest> {
        self.teardowns.lock().await.clone()
    }

    /// Accepted provision requests for one instance.
    pub async fn provisions_for(&self, key: &InstanceKey) -> Vec<ProvisionRequest> {
        self.provisions
            .lock()
            .await
            .iter()
            .filter(|r| &r.key == key)
            .cloned()
            .collect()
    }

    /// Accepted teardown requests for one instance.
    pub async fn teardowns_for(&self, key: &InstanceKey) -> usize {
        self.teardowns
            .lock()
            .await
            .iter()
            .filter(|r| &r.key == key)
            .count()
    }

    /// Consume one scripted failure, if any are left.
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn report(&self, events: Vec<ControllerEvent>) {
        let Some(completion) = self.completion.clone() else {
            return;
        };

        tokio::spawn(async move {
            tokio::time::sleep(completion.delay).await;
            for event in events {
                if completion.events.send(event).await.is_err() {
                    debug!("[MOCK] Event channel closed, dropping completion");
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl ComputeResourceManager for MockResourceManager {
    async fn provision(&self, request: &ProvisionRequest) -> Result<()> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);

        if self.always_fail || Self::take_failure(&self.fail_provisions) {
            warn!(instance = %request.key, "[MOCK] Rejecting provision request");
            anyhow::bail!("Mock resource manager configured to fail");
        }

        info!(
            instance = %request.key,
            revision = %request.revision,
            units = request.units,
            "[MOCK] Provisioning resources"
        );
        self.provisions.lock().await.push(request.clone());

        let ready = (0..request.units)
            .map(|_| ControllerEvent::ResourceReady {
                instance: request.key.clone(),
                revision: request.revision,
            })
            .collect();
        self.report(ready);

        Ok(())
    }

    async fn teardown(&self, request: &TeardownRequest) -> Result<()> {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);

        if Self::take_failure(&self.fail_teardowns) {
            warn!(instance = %request.key, "[MOCK] Rejecting teardown request");
            anyhow::bail!("Mock resource manager configured to fail teardown");
        }

        info!(instance = %request.key, "[MOCK] Tearing down resources");
        self.teardowns.lock().await.push(request.clone());

        self.report(vec![ControllerEvent::TeardownComplete {
            instance: request.key.clone(),
        }]);

        Ok(())
    }
}
