//! Ensemble controller.
//!
//! Manages the lifecycle of role instances that make up an ensemble
//! workload. A workload runs one or more groups; each group runs a fixed set
//! of roles; each role runs a desired number of instances, and each instance
//! is backed by one or more compute resources.
//!
//! ## Architecture
//!
//! - **State Store**: concurrency-safe registry of instances, by role
//! - **Lifecycle Engine**: applies scale requests and resource events
//! - **Transition Notifier**: emits one record per committed status change
//! - **Group Aggregator**: rolls instance counts up to groups and workloads
//! - **Event Dispatcher**: serializes events per role and per instance
//! - **Compute Resource Manager**: external seam for provisioning and
//!   teardown (mock in dev)

pub mod actors;
pub mod aggregator;
pub mod config;
pub mod engine;
pub mod notifier;
pub mod resources;
pub mod state;

pub use actors::{ControllerEvent, EventDispatcher};
pub use aggregator::{GroupAggregator, GroupSummary, WorkloadSummary};
pub use engine::{EngineConfig, EngineError, EngineResult, LifecycleEngine, RoleTemplate};
pub use notifier::{NotificationSink, TransitionNotifier, TransitionRecord};
pub use resources::{ComputeResourceManager, MockResourceManager};
pub use state::{InstanceStatus, StateStore, StoreError};
