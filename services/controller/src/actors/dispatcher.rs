//! Event dispatcher.
//!
//! Routes controller events to keyed workers. Events with the same dispatch
//! key are handled strictly in order by one worker; events with different
//! keys are handled concurrently.
//!
//! ```text
//! events ──▶ EventDispatcher ──┬──▶ role_worker(llama-0/prefill)
//!                              ├──▶ instance_worker(prefill-01h...)
//!                              └──▶ instance_worker(decode-01h...)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::framework::{ActorError, ActorHandle, Supervisor};
use super::worker::{ControllerEvent, DispatchKey, Envelope, KeyedWorker};
use crate::engine::{EngineResult, LifecycleEngine};

/// Reap finished workers after this many dispatched events.
const REAP_INTERVAL: u64 = 256;

/// Routes events to per-key workers.
pub struct EventDispatcher {
    engine: Arc<LifecycleEngine>,
    supervisor: Supervisor,
    workers: HashMap<DispatchKey, ActorHandle<Envelope>>,
    mailbox_size: usize,
    dispatched: u64,
}

impl EventDispatcher {
    pub fn new(engine: Arc<LifecycleEngine>, mailbox_size: usize) -> Self {
        Self {
            engine,
            supervisor: Supervisor::default(),
            workers: HashMap::new(),
            mailbox_size,
            dispatched: 0,
        }
    }

    /// Queue an event without waiting for it to be handled.
    pub async fn dispatch(&mut self, event: ControllerEvent) -> Result<(), ActorError> {
        self.route(Envelope::new(event)).await
    }

    /// Queue an event and return a receiver for its outcome.
    pub async fn dispatch_with_reply(
        &mut self,
        event: ControllerEvent,
    ) -> Result<oneshot::Receiver<EngineResult<()>>, ActorError> {
        let (envelope, rx) = Envelope::with_reply(event);
        self.route(envelope).await?;
        Ok(rx)
    }

    /// Queue an event and wait until it has been handled.
    pub async fn dispatch_and_wait(
        &mut self,
        event: ControllerEvent,
    ) -> Result<EngineResult<()>, ActorError> {
        let rx = self.dispatch_with_reply(event).await?;
        rx.await.map_err(|_| ActorError::NoReply)
    }

    /// Drop handles of workers that stopped. Returns live worker count.
    pub fn reap(&mut self) -> usize {
        self.workers.retain(|_, handle| !handle.is_closed());
        let reaped = self.supervisor.reap();
        if reaped > 0 {
            debug!(reaped, live = self.workers.len(), "Reaped finished workers");
        }
        self.workers.len()
    }

    /// Live workers, counting only those still accepting events.
    pub fn worker_count(&self) -> usize {
        self.workers.values().filter(|h| !h.is_closed()).count()
    }

    /// Consume events until the channel closes or shutdown is signaled.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ControllerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(mailbox_size = self.mailbox_size, "Event dispatcher started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event dispatcher received shutdown signal");
                        break;
                    }
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("Event channel closed");
                        break;
                    };
                    let kind = event.kind();
                    if let Err(e) = self.dispatch(event).await {
                        warn!(event = kind, error = %e, "Failed to dispatch event");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop all workers.
    pub async fn shutdown(mut self) {
        self.workers.clear();
        self.supervisor.stop_all().await;
        info!(dispatched = self.dispatched, "Event dispatcher stopped");
    }

    async fn route(&mut self, mut envelope: Envelope) -> Result<(), ActorError> {
        let key = envelope.event.dispatch_key();

        // A worker can stop between lookup and send; one retry with a fresh
        // worker covers that.
        for _ in 0..2 {
            let handle = self.worker(&key);
            match handle.send(envelope).await {
                Ok(()) => {
                    self.dispatched += 1;
                    if self.dispatched % REAP_INTERVAL == 0 {
                        self.reap();
                    }
                    return Ok(());
                }
                Err((_, returned)) => {
                    debug!(key = %key, "Worker stopped, respawning");
                    self.workers.remove(&key);
                    envelope = returned;
                }
            }
        }

        Err(ActorError::ActorStopped)
    }

    fn worker(&mut self, key: &DispatchKey) -> ActorHandle<Envelope> {
        if let Some(handle) = self.workers.get(key) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let worker = KeyedWorker::new(key.clone(), Arc::clone(&self.engine));
        let handle = self.supervisor.spawn(worker, self.mailbox_size);
        self.workers.insert(key.clone(), handle.clone());
        handle
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("workers", &self.workers.len())
            .field("mailbox_size", &self.mailbox_size)
            .field("dispatched", &self.dispatched)
            .finish()
    }
}
