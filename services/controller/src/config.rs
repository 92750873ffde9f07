//! Configuration for the ensemble controller.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use ensemble_id::{GroupName, RoleKey, RoleName, WorkloadKey};
use ensemble_reconcile::BackoffPolicy;

use crate::engine::{DemotionPolicy, EngineConfig, ProvisionRetryPolicy};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Mailbox capacity of each keyed worker.
    pub mailbox_size: usize,

    /// Capacity of the controller's inbound event channel.
    pub event_buffer: usize,

    /// Upper bound on one notification delivery.
    pub notify_timeout: Duration,

    /// Interval between workload summary logs.
    pub summary_interval: Duration,

    /// Delay of simulated resource completions in the mock manager.
    pub mock_completion_delay: Duration,

    /// Roles scaled at startup.
    pub seed: Vec<(RoleKey, u32)>,

    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };

        let log_level = lookup("ENSEMBLE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let demotion = match lookup("ENSEMBLE_DEMOTION_POLICY") {
            Some(value) => match DemotionPolicy::from_str(&value) {
                Some(policy) => policy,
                None => bail!(
                    "invalid ENSEMBLE_DEMOTION_POLICY {value:?}: expected reprovision-failed or replace-all"
                ),
            },
            None => DemotionPolicy::default(),
        };

        let jitter = lookup("ENSEMBLE_PROVISION_BACKOFF_JITTER")
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.25)
            .clamp(0.0, 1.0);

        let retry = ProvisionRetryPolicy {
            max_attempts: number("ENSEMBLE_PROVISION_MAX_ATTEMPTS", 3).max(1) as u32,
            backoff: BackoffPolicy {
                base: Duration::from_millis(number("ENSEMBLE_PROVISION_BACKOFF_BASE_MS", 200)),
                max: Duration::from_millis(number("ENSEMBLE_PROVISION_BACKOFF_MAX_MS", 30_000)),
                jitter,
            },
            budget: number("ENSEMBLE_RETRY_BUDGET", 5) as u32,
            window: Duration::from_secs(number("ENSEMBLE_RETRY_WINDOW_SECS", 600)),
        };

        let engine = EngineConfig {
            default_required_resources: number("ENSEMBLE_REQUIRED_RESOURCES", 1).max(1) as u32,
            demotion,
            retry,
        };

        let seed = match lookup("ENSEMBLE_SEED") {
            Some(value) => parse_seed(&value)?,
            None => Vec::new(),
        };

        Ok(Self {
            log_level,
            mailbox_size: number("ENSEMBLE_MAILBOX_SIZE", 64).max(1) as usize,
            event_buffer: number("ENSEMBLE_EVENT_BUFFER", 1024).max(1) as usize,
            notify_timeout: Duration::from_millis(number("ENSEMBLE_NOTIFY_TIMEOUT_MS", 500)),
            summary_interval: Duration::from_secs(number("ENSEMBLE_SUMMARY_INTERVAL_SECS", 30).max(1)),
            mock_completion_delay: Duration::from_millis(number("ENSEMBLE_MOCK_DELAY_MS", 250)),
            seed,
            engine,
        })
    }
}

/// Parse `ns/workload/group/role=replicas` entries separated by commas.
fn parse_seed(value: &str) -> Result<Vec<(RoleKey, u32)>> {
    let mut seed = Vec::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (path, replicas) = entry
            .split_once('=')
            .with_context(|| format!("seed entry {entry:?} is missing '=replicas'"))?;

        let parts: Vec<&str> = path.split('/').collect();
        let [namespace, name, group, role] = parts.as_slice() else {
            bail!("seed entry {entry:?} must look like namespace/workload/group/role=replicas");
        };

        let workload = WorkloadKey::parse(&format!("{namespace}/{name}"))
            .with_context(|| format!("invalid workload in seed entry {entry:?}"))?;
        let group = GroupName::parse(group)
            .with_context(|| format!("invalid group in seed entry {entry:?}"))?;
        let role = RoleName::parse(role)
            .with_context(|| format!("invalid role in seed entry {entry:?}"))?;
        let replicas: u32 = replicas
            .trim()
            .parse()
            .with_context(|| format!("invalid replica count in seed entry {entry:?}"))?;

        seed.push((RoleKey::new(workload, group, role), replicas));
    }

    Ok(seed)
}
