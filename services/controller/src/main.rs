//! Ensemble controller binary.
//!
//! Wires the state store, lifecycle engine and event dispatcher together
//! with the mock compute resource manager, which simulates readiness and
//! teardown completion. Roles listed in `ENSEMBLE_SEED` are scaled at startup.

use std::sync::Arc;

use anyhow::Result;
use ensemble_controller::actors::{ControllerEvent, EventDispatcher};
use ensemble_controller::aggregator::GroupAggregator;
use ensemble_controller::config::Config;
use ensemble_controller::engine::LifecycleEngine;
use ensemble_controller::notifier::{TracingSink, TransitionNotifier};
use ensemble_controller::resources::MockResourceManager;
use ensemble_controller::state::StateStore;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ensemble controller");
    info!(
        mailbox_size = config.mailbox_size,
        demotion = config.engine.demotion.as_str(),
        max_attempts = config.engine.retry.max_attempts,
        retry_budget = config.engine.retry.budget,
        seed_roles = config.seed.len(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(config.event_buffer);

    // Compute resources are simulated for now
    let resources = Arc::new(MockResourceManager::with_completions(
        events_tx.clone(),
        config.mock_completion_delay,
    ));

    let store = Arc::new(StateStore::new());
    let notifier = Arc::new(TransitionNotifier::new(
        Arc::new(TracingSink),
        config.notify_timeout,
    ));
    let engine = Arc::new(LifecycleEngine::new(
        Arc::clone(&store),
        resources,
        Arc::clone(&notifier),
        config.engine.clone(),
    ));
    let aggregator = GroupAggregator::new(Arc::clone(&store));

    let dispatcher = EventDispatcher::new(Arc::clone(&engine), config.mailbox_size);
    let mut dispatcher_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { dispatcher.run(events_rx, shutdown_rx).await }
    });

    for (role, desired) in &config.seed {
        let event = ControllerEvent::ScaleRequest {
            role: role.clone(),
            desired: *desired,
        };
        if events_tx.send(event).await.is_err() {
            warn!(role = %role, "Event channel closed before seeding");
        }
    }

    // Periodic status summaries
    let summary_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        let interval = config.summary_interval;
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        for workload in store.list_workloads().await {
                            let summary = aggregator.summarize_workload(&workload).await;
                            info!(
                                workload = %summary.workload,
                                groups = summary.groups,
                                available_groups = summary.available_groups,
                                progressing_groups = summary.progressing_groups,
                                "Workload status"
                            );
                        }
                        let tracked = engine.prune_retries().await;
                        info!(
                            notifications_delivered = notifier.delivered(),
                            notifications_dropped = notifier.dropped(),
                            retry_tracked = tracked,
                            "Controller status"
                        );
                    }
                }
            }
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut dispatcher_handle => {
            if let Err(e) = result {
                error!(error = %e, "Event dispatcher task panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    drop(events_tx);

    info!("Waiting for workers to shut down...");
    if !dispatcher_handle.is_finished() {
        if let Err(e) = dispatcher_handle.await {
            error!(error = %e, "Event dispatcher task panicked");
        }
    }
    let _ = summary_handle.await;

    info!("Ensemble controller shutdown complete");
    Ok(())
}
