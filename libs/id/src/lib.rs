//! # ensemble-id
//!
//! Typed names and identifiers for the ensemble serving controller.
//!
//! ## Design Principles
//!
//! - Names (namespace, workload, group, role) are user-controlled labels and are
//!   validated as DNS-1123 labels
//! - Instance IDs are system-generated and never reused: `{role}-{ulid}`
//! - Composite keys (`RoleKey`, `InstanceKey`) address one node of the
//!   workload → group → role → instance hierarchy
//! - Everything roundtrips through `Display` / `FromStr` and serde
//!
//! ## Formats
//!
//! - Workload key: `inference/llama`
//! - Group name: `llama-0`
//! - Instance ID: `prefill-01hv4z2wqxkjnm8gpqy6vbkc3d`

mod error;
mod macros;
mod types;

pub use error::IdError;
#[doc(hidden)]
pub use macros::validate_label;
pub use macros::MAX_LABEL_LEN;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
