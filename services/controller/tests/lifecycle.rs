//! Integration tests for instance lifecycle handling.
//!
//! These drive the lifecycle engine against the mock resource manager and an
//! in-memory notification sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ensemble_controller::engine::{EngineConfig, LifecycleEngine, ProvisionRetryPolicy};
use ensemble_controller::notifier::{
    MemorySink, NotificationSink, SinkError, TransitionNotifier, TransitionRecord,
    DEFAULT_SEND_TIMEOUT,
};
use ensemble_controller::resources::{
    ComputeResourceManager, MockResourceManager, ProvisionRequest, TeardownRequest,
};
use ensemble_controller::state::{InstanceStatus, StateStore};
use ensemble_id::{GroupName, InstanceId, InstanceKey, Revision, RoleKey, RoleName};
use ensemble_reconcile::BackoffPolicy;
use tokio::sync::{Barrier, Notify};

struct Fixture {
    engine: Arc<LifecycleEngine>,
    store: Arc<StateStore>,
    resources: Arc<MockResourceManager>,
    sink: Arc<MemorySink>,
}

fn fast_retries() -> EngineConfig {
    EngineConfig {
        retry: ProvisionRetryPolicy {
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(4),
                jitter: 0.0,
            },
            ..ProvisionRetryPolicy::default()
        },
        ..EngineConfig::default()
    }
}

fn fixture() -> Fixture {
    let store = Arc::new(StateStore::new());
    let resources = Arc::new(MockResourceManager::new());
    let sink = Arc::new(MemorySink::new());
    let notifier = Arc::new(TransitionNotifier::new(sink.clone(), DEFAULT_SEND_TIMEOUT));
    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        resources.clone(),
        notifier,
        fast_retries(),
    ));
    Fixture {
        engine,
        store,
        resources,
        sink,
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
async fn scale_up_then_partial_readiness() {
    let f = fixture();
    let role = role_key("prefill");

    let created = f.engine.scale_up(&role, 3).await.unwrap();
    assert_eq!(created.len(), 3);

    let snapshot = f.store.list_instances(&role).await;
    assert_eq!(snapshot.count(InstanceStatus::Creating), 3);
    for key in &created {
        assert_eq!(f.sink.count(key, InstanceStatus::Creating).await, 1);
    }

    f.engine
        .handle_resource_ready(&created[0], Revision::FIRST)
        .await
        .unwrap();
    f.engine
        .handle_resource_ready(&created[1], Revision::FIRST)
        .await
        .unwrap();

    let snapshot = f.store.list_instances(&role).await;
    assert_eq!(snapshot.count(InstanceStatus::Running), 2);
    assert_eq!(snapshot.count(InstanceStatus::Creating), 1);
    assert_eq!(status(&f.store, &created[2]).await, Some(InstanceStatus::Creating));

    let running_records = f
        .sink
        .records()
        .await
        .into_iter()
        .filter(|r| r.status == InstanceStatus::Running)
        .count();
    assert_eq!(running_records, 2);
}

#[tokio::test]
async fn resource_error_demotes_running_instance_once() {
    let f = fixture();
    let role = role_key("decode");
    let key = f.engine.scale_up(&role, 1).await.unwrap().remove(0);
    f.engine
        .handle_resource_ready(&key, Revision::FIRST)
        .await
        .unwrap();
    let provisions_before = f.resources.provisions_for(&key).await.len();

    f.engine
        .handle_resource_error(&key, Revision::FIRST)
        .await
        .unwrap();

    assert_eq!(status(&f.store, &key).await, Some(InstanceStatus::Creating));
    assert_eq!(f.sink.count(&key, InstanceStatus::Creating).await, 2);
    assert_eq!(
        f.resources.provisions_for(&key).await.len(),
        provisions_before + 1
    );
}

#[tokio::test]
async fn duplicate_error_events_demote_once() {
    let f = fixture();
    let role = role_key("decode");
    let key = f.engine.scale_up(&role, 1).await.unwrap().remove(0);
    f.engine
        .handle_resource_ready(&key, Revision::FIRST)
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        f.engine.handle_resource_error(&key, Revision::FIRST),
        f.engine.handle_resource_error(&key, Revision::FIRST),
    );
    a.unwrap();
    b.unwrap();

    // One demotion. The second event sees a creating instance and retries
    // provisioning of its failed resource, which is expected.
    assert_eq!(f.sink.count(&key, InstanceStatus::Creating).await, 2);
    assert!(f.resources.provisions_for(&key).await.len() <= 3);
}

#[tokio::test]
async fn delete_creating_then_teardown_removes() {
    let f = fixture();
    let role = role_key("prefill");
    let key = f.engine.scale_up(&role, 1).await.unwrap().remove(0);

    f.engine.delete_instance(&key).await.unwrap();
    assert_eq!(status(&f.store, &key).await, Some(InstanceStatus::Deleting));
    assert_eq!(f.resources.teardowns_for(&key).await, 1);

    assert!(f.engine.handle_teardown_complete(&key).await.unwrap());
    assert_eq!(f.store.get_status(&key).await, None);
    assert_eq!(
        f.sink.history(&key).await,
        vec![InstanceStatus::Creating, InstanceStatus::Deleting]
    );
}

/// Sink that only returns once two deliveries are in flight together.
struct RendezvousSink {
    barrier: Barrier,
}

#[async_trait]
impl NotificationSink for RendezvousSink {
    async fn deliver(&self, record: TransitionRecord) -> Result<(), SinkError> {
        if record.status == InstanceStatus::Running {
            self.barrier.wait().await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rendezvous"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readiness_for_sibling_instances_runs_concurrently() {
    let store = Arc::new(StateStore::new());
    let sink = Arc::new(RendezvousSink {
        barrier: Barrier::new(2),
    });
    let notifier = Arc::new(TransitionNotifier::new(sink, Duration::from_secs(5)));
    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        Arc::new(MockResourceManager::new()),
        notifier.clone(),
        EngineConfig::default(),
    ));
    let role = role_key("prefill");
    let created = engine.scale_up(&role, 2).await.unwrap();

    // Each promotion blocks in the sink until the other one arrives, so
    // this only finishes in time if neither waits on the other's lock.
    let tasks: Vec<_> = created
        .iter()
        .cloned()
        .map(|key| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.handle_resource_ready(&key, Revision::FIRST).await })
        })
        .collect();

    for task in tasks {
        let promoted = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("readiness handling blocked")
            .unwrap()
            .unwrap();
        assert!(promoted);
    }

    assert_eq!(notifier.dropped(), 0);
    for key in &created {
        assert_eq!(status(&store, key).await, Some(InstanceStatus::Running));
    }
}

#[tokio::test]
async fn scale_requests_are_idempotent() {
    let f = fixture();
    let role = role_key("prefill");

    f.engine.scale(&role, 2).await.unwrap();
    f.engine.scale(&role, 2).await.unwrap();
    assert_eq!(f.store.list_instances(&role).await.active_count(), 2);
    assert_eq!(f.resources.provision_count(), 2);

    f.engine.scale(&role, 0).await.unwrap();
    f.engine.scale(&role, 0).await.unwrap();
    assert_eq!(f.store.list_instances(&role).await.active_count(), 0);
    assert_eq!(f.resources.teardown_count(), 2);
}

#[tokio::test]
async fn concurrent_scale_up_does_not_overshoot() {
    let f = fixture();
    let role = role_key("prefill");

    let (a, b) = tokio::join!(f.engine.scale_up(&role, 3), f.engine.scale_up(&role, 3));
    assert_eq!(a.unwrap().len() + b.unwrap().len(), 3);
    assert_eq!(f.store.list_instances(&role).await.len(), 3);
}

#[tokio::test]
async fn stale_readiness_is_ignored() {
    let f = fixture();
    let role = role_key("decode");
    f.engine
        .apply_template(
            &role,
            &ensemble_controller::engine::RoleTemplate {
                required_resources: 1,
                spec: serde_json::json!({"image": "v1"}),
            },
        )
        .await;
    f.engine
        .apply_template(
            &role,
            &ensemble_controller::engine::RoleTemplate {
                required_resources: 1,
                spec: serde_json::json!({"image": "v2"}),
            },
        )
        .await;
    let key = f.engine.scale_up(&role, 1).await.unwrap().remove(0);
    assert_eq!(f.store.get_status(&key).await.unwrap().1, Revision::new(2));

    assert!(!f
        .engine
        .handle_resource_ready(&key, Revision::FIRST)
        .await
        .unwrap());
    assert_eq!(status(&f.store, &key).await, Some(InstanceStatus::Creating));

    assert!(f
        .engine
        .handle_resource_ready(&key, Revision::new(2))
        .await
        .unwrap());
}

#[tokio::test]
async fn deleting_instance_never_returns() {
    let f = fixture();
    let role = role_key("prefill");
    let key = f.engine.scale_up(&role, 1).await.unwrap().remove(0);
    f.engine.delete_instance(&key).await.unwrap();

    f.engine
        .handle_resource_ready(&key, Revision::FIRST)
        .await
        .unwrap();
    f.engine
        .handle_resource_error(&key, Revision::FIRST)
        .await
        .unwrap();
    f.engine.scale_up(&role, 1).await.unwrap();

    assert_eq!(status(&f.store, &key).await, Some(InstanceStatus::Deleting));
    assert_eq!(f.sink.count(&key, InstanceStatus::Running).await, 0);
    // The replacement is a new instance.
    assert_eq!(f.store.list_instances(&role).await.active_count(), 1);
}

#[tokio::test]
async fn removed_ids_are_not_reused() {
    let f = fixture();
    let role = role_key("prefill");
    let key = f.engine.scale_up(&role, 1).await.unwrap().remove(0);
    f.engine.delete_instance(&key).await.unwrap();
    f.engine.handle_teardown_complete(&key).await.unwrap();

    let err = f
        .store
        .add_instance(&key, Revision::FIRST, 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ensemble_controller::state::StoreError::AlreadyExists(_)
    ));
}

#[tokio::test]
async fn unknown_instance_events_are_noops() {
    let f = fixture();
    let role = role_key("prefill");
    let ghost = role.instance(InstanceId::generate(&role.role));

    f.engine.delete_instance(&ghost).await.unwrap();
    f.engine
        .handle_resource_error(&ghost, Revision::FIRST)
        .await
        .unwrap();
    assert!(!f.engine.handle_teardown_complete(&ghost).await.unwrap());

    assert_eq!(f.resources.provision_count(), 0);
    assert_eq!(f.resources.teardown_count(), 0);
    assert!(f.sink.records().await.is_empty());
}

#[tokio::test]
async fn cumulative_scale_ups_create_unique_instances() {
    let f = fixture();
    let role = role_key("prefill");

    let mut all = Vec::new();
    for desired in 1..=4 {
        all.extend(f.engine.scale_up(&role, desired).await.unwrap());
    }

    assert_eq!(all.len(), 4);
    let mut ids: Vec<_> = all.iter().map(|k| k.instance_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(f.store.list_instances(&role).await.count(InstanceStatus::Creating), 4);
}

/// Sink that, once armed, holds the next `Creating` record until released.
#[derive(Default)]
struct PausingSink {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
    inner: MemorySink,
}

#[async_trait]
impl NotificationSink for PausingSink {
    async fn deliver(&self, record: TransitionRecord) -> Result<(), SinkError> {
        if record.status == InstanceStatus::Creating && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.deliver(record).await
    }

    fn name(&self) -> &'static str {
        "pausing"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readiness_during_demotion_keeps_reprovision() {
    let store = Arc::new(StateStore::new());
    let resources = Arc::new(MockResourceManager::new());
    let sink = Arc::new(PausingSink::default());
    let notifier = Arc::new(TransitionNotifier::new(sink.clone(), Duration::from_secs(5)));
    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        resources.clone(),
        notifier,
        fast_retries(),
    ));
    let role = role_key("decode");
    let key = engine.scale_up(&role, 1).await.unwrap().remove(0);
    assert!(engine
        .handle_resource_ready(&key, Revision::FIRST)
        .await
        .unwrap());

    sink.armed.store(true, Ordering::SeqCst);
    let demotion = {
        let engine = engine.clone();
        let key = key.clone();
        tokio::spawn(async move { engine.handle_resource_error(&key, Revision::FIRST).await })
    };

    // The demotion has committed and is announcing itself. A duplicate
    // readiness event for the failed resource lands now.
    tokio::time::timeout(Duration::from_secs(2), sink.entered.notified())
        .await
        .expect("demotion never notified");
    assert_eq!(status(&store, &key).await, Some(InstanceStatus::Creating));
    engine
        .handle_resource_ready(&key, Revision::FIRST)
        .await
        .unwrap();

    sink.release.notify_one();
    tokio::time::timeout(Duration::from_secs(2), demotion)
        .await
        .expect("demotion blocked")
        .unwrap()
        .unwrap();

    // The failed resource is replaced exactly once.
    assert_eq!(resources.provisions_for(&key).await.len(), 2);
}

/// Resource manager that, once armed, holds the next provision request
/// until released.
#[derive(Default)]
struct PausingResources {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
    inner: MockResourceManager,
}

#[async_trait]
impl ComputeResourceManager for PausingResources {
    async fn provision(&self, request: &ProvisionRequest) -> anyhow::Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.provision(request).await
    }

    async fn teardown(&self, request: &TeardownRequest) -> anyhow::Result<()> {
        self.inner.teardown(request).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deletion_during_reprovision_reclaims_resources() {
    let store = Arc::new(StateStore::new());
    let resources = Arc::new(PausingResources::default());
    let sink = Arc::new(MemorySink::new());
    let notifier = Arc::new(TransitionNotifier::new(sink.clone(), DEFAULT_SEND_TIMEOUT));
    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        resources.clone(),
        notifier,
        fast_retries(),
    ));
    let role = role_key("prefill");
    let key = engine.scale_up(&role, 1).await.unwrap().remove(0);

    resources.armed.store(true, Ordering::SeqCst);
    let retry = {
        let engine = engine.clone();
        let key = key.clone();
        tokio::spawn(async move { engine.handle_resource_error(&key, Revision::FIRST).await })
    };

    tokio::time::timeout(Duration::from_secs(2), resources.entered.notified())
        .await
        .expect("re-provision never requested");
    engine.delete_instance(&key).await.unwrap();
    assert_eq!(resources.inner.teardowns_for(&key).await, 1);

    resources.release.notify_one();
    tokio::time::timeout(Duration::from_secs(2), retry)
        .await
        .expect("re-provision blocked")
        .unwrap()
        .unwrap();

    // The late provision is torn down again and the instance stays deleting.
    assert_eq!(resources.inner.teardowns_for(&key).await, 2);
    assert_eq!(status(&store, &key).await, Some(InstanceStatus::Deleting));
    assert_eq!(
        sink.history(&key).await,
        vec![InstanceStatus::Creating, InstanceStatus::Deleting]
    );
}
