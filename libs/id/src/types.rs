//! Typed names, composite keys, and instance identifiers.
//!
//! Names are validated labels. Keys compose names into addresses in the
//! workload → group → role → instance hierarchy. Instance IDs carry their
//! role name plus a ULID so they are unique for the life of the process.

use serde::{Deserialize, Serialize};

use crate::{define_name, IdError, Ulid};

// =============================================================================
// Names
// =============================================================================

define_name!(Namespace, "namespace");
define_name!(WorkloadName, "workload name");
define_name!(GroupName, "group name");
define_name!(RoleName, "role name");

// =============================================================================
// Workload Key
// =============================================================================

/// Namespace-qualified workload name, formatted as `{namespace}/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: Namespace,
    pub name: WorkloadName,
}

impl WorkloadKey {
    /// Creates a workload key from validated parts.
    #[must_use]
    pub fn new(namespace: Namespace, name: WorkloadName) -> Self {
        Self { namespace, name }
    }

    /// Parses a `{namespace}/{name}` string.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty {
                kind: "workload key",
            });
        }

        let Some((namespace, name)) = s.split_once('/') else {
            return Err(IdError::MissingSeparator {
                kind: "workload key",
                value: s.to_string(),
                separator: '/',
            });
        };

        Ok(Self {
            namespace: Namespace::parse(namespace)?,
            name: WorkloadName::parse(name)?,
        })
    }
}

impl std::fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for WorkloadKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// Instance ID
// =============================================================================

/// Identifier of one role instance: `{role}-{ulid}` with a lowercase ULID.
///
/// Generated once at scale-up time. The ULID suffix makes every generated ID
/// distinct, so an ID is never handed out twice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generates a fresh instance ID for `role`.
    #[must_use]
    pub fn generate(role: &RoleName) -> Self {
        Self(format!(
            "{}-{}",
            role,
            Ulid::new().to_string().to_ascii_lowercase()
        ))
    }

    /// Parses an instance ID of the form `{role}-{ulid}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty { kind: "instance ID" });
        }

        let Some((role, suffix)) = s.rsplit_once('-') else {
            return Err(IdError::MissingSeparator {
                kind: "instance ID",
                value: s.to_string(),
                separator: '-',
            });
        };

        RoleName::parse(role)?;
        suffix
            .to_ascii_uppercase()
            .parse::<Ulid>()
            .map_err(|e| IdError::InvalidUlid(e.to_string()))?;

        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The role-name portion of the ID.
    #[must_use]
    pub fn role_part(&self) -> &str {
        self.0.rsplit_once('-').map(|(role, _)| role).unwrap_or("")
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for InstanceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Revision
// =============================================================================

/// Generation of a role template. Stamped on instances at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(u64);

impl Revision {
    /// The revision of a role that has never seen a template change.
    pub const FIRST: Self = Self(1);

    /// Creates a revision from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next revision.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for Revision {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Revision> for u64 {
    fn from(revision: Revision) -> Self {
        revision.0
    }
}

impl Serialize for Revision {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = u64::deserialize(deserializer)?;
        Ok(Self(value))
    }
}

// =============================================================================
// Composite Keys
// =============================================================================

/// Address of one role inside one group of a workload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleKey {
    pub workload: WorkloadKey,
    pub group: GroupName,
    pub role: RoleName,
}

impl RoleKey {
    #[must_use]
    pub fn new(workload: WorkloadKey, group: GroupName, role: RoleName) -> Self {
        Self {
            workload,
            group,
            role,
        }
    }

    /// Key of a specific instance of this role.
    #[must_use]
    pub fn instance(&self, instance_id: InstanceId) -> InstanceKey {
        InstanceKey {
            role: self.clone(),
            instance_id,
        }
    }
}

impl std::fmt::Display for RoleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.workload, self.group, self.role)
    }
}

/// Address of one instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub role: RoleKey,
    pub instance_id: InstanceId,
}

impl InstanceKey {
    pub fn workload(&self) -> &WorkloadKey {
        &self.role.workload
    }

    pub fn group(&self) -> &GroupName {
        &self.role.group
    }

    pub fn role_name(&self) -> &RoleName {
        &self.role.role
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.role, self.instance_id)
    }
}

// =============================================================================
// Tests
// =============================================================================
