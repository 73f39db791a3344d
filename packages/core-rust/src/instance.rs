//! Instance records: tenant identity, lifecycle status, and resource quotas.
//!
//! An *instance* is a logical tenant. Every cache key is scoped to exactly one
//! instance, and the [`InstanceRecord`] is the system of record for that
//! tenant's lifecycle: when it was created, when it was last active, whether
//! it accepts requests, and whether automated cleanup may delete it.
//!
//! Status transition policy (enforced by callers, not by the record itself):
//! `active <-> paused`, `active <-> migrating`, any -> `deleting` ->
//! `inactive`, and `inactive -> active`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an instance.
///
/// Serialized lowercase (`"active"`, `"paused"`, ...) for the registry's
/// JSON representation and the HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Accepting reads and writes.
    Active,
    /// Retired; data may still exist but requests are rejected.
    Inactive,
    /// Bulk load in progress. Requests are still accepted.
    Migrating,
    /// Deletion in progress. Requests are rejected with 410 Gone.
    Deleting,
    /// Administratively paused. Requests are rejected until resumed.
    Paused,
}

impl InstanceStatus {
    /// Lowercase string form, matching the serialized representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Migrating => "migrating",
            Self::Deleting => "deleting",
            Self::Paused => "paused",
        }
    }

    /// Whether the transition `self -> next` is allowed by the lifecycle policy.
    ///
    /// Any status may transition to `Deleting`; `Deleting` only proceeds to
    /// `Inactive`. A transition to the current status is always allowed so
    /// idempotent updates are not rejected.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next || next == Self::Deleting {
            return true;
        }
        matches!(
            (self, next),
            (Self::Active, Self::Paused | Self::Migrating)
                | (Self::Paused | Self::Migrating | Self::Inactive, Self::Active)
                | (Self::Deleting, Self::Inactive)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource limits for one instance.
///
/// Quotas are declarative today: the core records them but admission control
/// is left to the deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    /// Maximum cache memory in megabytes.
    pub max_memory_mb: u64,
    /// Maximum durable storage in gigabytes.
    pub max_storage_gb: u64,
    /// Maximum CPU cores.
    pub max_cpu_cores: u32,
    /// Maximum concurrent requests.
    pub max_concurrent: u32,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            max_memory_mb: 8192,
            max_storage_gb: 100,
            max_cpu_cores: 4,
            max_concurrent: 10_000,
        }
    }
}

fn default_tag() -> String {
    "default".to_string()
}

/// Identity and lifecycle of one tenant.
///
/// Records are owned by the instance registry; everything handed to other
/// components is a clone, so holders can mutate freely without affecting
/// registry state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique tenant identity; the namespace root for all of its keys.
    pub instance_id: String,
    /// Descriptive deployment tag.
    #[serde(default = "default_tag")]
    pub game_type: String,
    /// Descriptive region tag.
    #[serde(default = "default_tag")]
    pub region: String,
    /// Creation time. Preserved across updates.
    pub created_at: DateTime<Utc>,
    /// Last observed activity. `created_at <= last_active` always holds.
    pub last_active: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Free-form string metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Optional resource limits. `None` means the default quota applies.
    #[serde(default)]
    pub resource_quota: Option<ResourceQuota>,
    /// When true the record is exempt from automated cleanup.
    #[serde(default)]
    pub is_permanent: bool,
}

impl InstanceRecord {
    /// Creates a new active record with default tags and quotas.
    ///
    /// The id is trimmed; validity is checked separately by [`validate`](Self::validate).
    #[must_use]
    pub fn new(instance_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.trim().to_string(),
            game_type: default_tag(),
            region: default_tag(),
            created_at: now,
            last_active: now,
            status: InstanceStatus::Active,
            metadata: HashMap::new(),
            resource_quota: Some(ResourceQuota::default()),
            is_permanent: false,
        }
    }

    /// Checks the record invariants.
    ///
    /// # Errors
    ///
    /// Returns an error when the id is empty (after trimming) or when
    /// `last_active` precedes `created_at`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instance_id.trim().is_empty() {
            anyhow::bail!("instance_id must not be empty");
        }
        if self.last_active < self.created_at {
            anyhow::bail!(
                "instance {}: last_active {} precedes created_at {}",
                self.instance_id,
                self.last_active,
                self.created_at
            );
        }
        Ok(())
    }

    /// Whether this instance currently accepts cache requests.
    ///
    /// True for `active` and `migrating` (a bulk load does not interrupt
    /// traffic); false otherwise.
    #[must_use]
    pub fn can_accept_requests(&self) -> bool {
        matches!(
            self.status,
            InstanceStatus::Active | InstanceStatus::Migrating
        )
    }

    /// Whether automated cleanup may delete this instance.
    ///
    /// Requires: not permanent, status `active`, and at least `minimum_age`
    /// elapsed since creation. Inactivity is a separate criterion applied by
    /// the cleanup service on top of this check.
    #[must_use]
    pub fn can_be_auto_deleted(&self, now: DateTime<Utc>, minimum_age: Duration) -> bool {
        !self.is_permanent
            && self.status == InstanceStatus::Active
            && now - self.created_at >= minimum_age
    }

    /// Stamps `last_active = now`, keeping the ordering invariant.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_active {
            self.last_active = now;
        }
    }

    /// The effective quota: the explicit one, or the default.
    #[must_use]
    pub fn quota(&self) -> ResourceQuota {
        self.resource_quota.unwrap_or_default()
    }
}
