//! Hierarchical instance state for the controller.
//!
//! This module provides the in-memory registry of:
//! - Workloads, their replica groups, and each group's roles
//! - Role instances (status, revision, ready/required resource counters)
//!
//! The store is constructed once and shared by the lifecycle engine and the
//! group aggregator. It is not persisted.

mod store;
mod types;

pub use store::{StateStore, StoreError, StoreResult};
pub use types::{
    InstanceSnapshot, InstanceStatus, ReadyProgress, ResourceReset, RoleSnapshot,
};
