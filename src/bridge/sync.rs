use crate::message::{Priority, Subsystem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of divergence detected between the two subsystems' states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    DataMismatch,
    VersionConflict,
    ConcurrentModification,
}

/// Policy for handling a detected conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Requires operator intervention; the operation is recorded and skipped.
    Manual,
    /// Resolved in place, then the operation is applied.
    AutoResolve,
    /// Skipped this round; the owning side will resubmit.
    Defer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConflict {
    pub kind: ConflictKind,
    pub source: Subsystem,
    pub target: Subsystem,
    pub description: String,
    pub resolution: ConflictResolution,
    pub priority: Priority,
}

/// One pending change collected from a side during `sync_state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncOperation {
    pub id: String,
    pub source: Subsystem,
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl SyncOperation {
    pub fn new(source: Subsystem, key: impl Into<String>, value: Value, version: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            key: key.into(),
            value,
            version,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate outcome of one `sync_state` round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncResult {
    pub success: bool,
    pub items_synced: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub conflicts: Vec<SyncConflict>,
}

/// What to do with an operation given its detected conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDecision {
    Apply,
    ResolveThenApply,
    Skip,
}

/// Detect conflicts for one operation against the reconciled state.
///
/// `concurrent` is true when the peer side touched the same key in this
/// sync round. `stored` is the bridge's reconciled `(value, version)` for
/// the key, if any.
pub fn classify_operation(
    operation: &SyncOperation,
    concurrent: bool,
    stored: Option<&(Value, u64)>,
) -> Vec<SyncConflict> {
    let mut conflicts = Vec::new();

    if concurrent {
        conflicts.push(SyncConflict {
            kind: ConflictKind::ConcurrentModification,
            source: operation.source,
            target: operation.source.peer(),
            description: format!(
                "both subsystems modified `{}` in the same sync round",
                operation.key
            ),
            resolution: ConflictResolution::Manual,
            priority: Priority::High,
        });
    }

    if let Some((stored_value, stored_version)) = stored {
        if *stored_version > operation.version {
            conflicts.push(SyncConflict {
                kind: ConflictKind::VersionConflict,
                source: operation.source,
                target: operation.source.peer(),
                description: format!(
                    "`{}` is at version {} but the operation carries version {}",
                    operation.key, stored_version, operation.version
                ),
                resolution: ConflictResolution::AutoResolve,
                priority: Priority::Normal,
            });
        } else if *stored_version == operation.version && stored_value != &operation.value {
            conflicts.push(SyncConflict {
                kind: ConflictKind::DataMismatch,
                source: operation.source,
                target: operation.source.peer(),
                description: format!(
                    "`{}` diverged at version {}",
                    operation.key, stored_version
                ),
                resolution: ConflictResolution::Defer,
                priority: Priority::Normal,
            });
        }
    }

    conflicts
}

/// Manual and deferred conflicts block the operation; auto-resolvable
/// conflicts are resolved and the operation applied; a clean operation
/// applies directly.
pub fn decide(conflicts: &[SyncConflict]) -> ApplyDecision {
    if conflicts
        .iter()
        .any(|c| matches!(c.resolution, ConflictResolution::Manual | ConflictResolution::Defer))
    {
        ApplyDecision::Skip
    } else if conflicts
        .iter()
        .any(|c| c.resolution == ConflictResolution::AutoResolve)
    {
        ApplyDecision::ResolveThenApply
    } else {
        ApplyDecision::Apply
    }
}
