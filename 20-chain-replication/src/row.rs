//! Row identity, stored row copies, and the per-row state machine.
//!
//! Every replica stores its own copy of a [`RowRecord`]. The head's copy is
//! authoritative; the other copies trail it by at most the write currently in
//! flight. [`RowState`] is the view of a head copy the executor validates
//! operations against, and [`Operation::plan`] turns a validated operation into
//! the next record to write.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChainError, ChainResult};

/// Identity of a row: `(partition_key, row_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub partition_key: String,
    pub row_key: String,
}

impl RowKey {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.partition_key, self.row_key)
    }
}

/// Replica-local optimistic concurrency token.
///
/// Only meaningful to the replica that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ETag(pub u64);

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W/\"{}\"", self.0)
    }
}

/// One replica's copy of a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub key: RowKey,
    /// Logically absent when `tombstone` is set.
    pub payload: Value,
    pub version: u64,
    /// View that last wrote this copy.
    pub view_id: u64,
    pub tombstone: bool,
    /// Set while the write that produced this copy has not reached the tail.
    pub lock: bool,
    /// Unix millis at which the head accepted the locked write.
    pub lock_acquired_ms: u64,
    /// Filled in by [`crate::replica::Replica::get`]; never copied between replicas.
    #[serde(skip)]
    pub etag: Option<ETag>,
}

impl RowRecord {
    /// Position of this copy in the forward-only order every replica follows.
    ///
    /// Delete keeps the version, so a tombstone sorts after the live copy with
    /// the same version, and a committed copy after its locked twin.
    pub fn order(&self) -> (u64, bool, bool) {
        (self.version, self.tombstone, !self.lock)
    }

    /// Whether `other` was produced by the same write as `self`.
    pub fn same_write(&self, other: &RowRecord) -> bool {
        self.version == other.version && self.tombstone == other.tombstone
    }

    pub fn is_pending(&self) -> bool {
        self.lock
    }

    /// Returns the committed form of this copy, detached from any replica.
    pub fn committed(&self) -> RowRecord {
        RowRecord {
            lock: false,
            etag: None,
            ..self.clone()
        }
    }

    /// How long ago the head accepted this copy's write.
    pub fn lock_age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.lock_acquired_ms))
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// State of a row as seen through its head copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Absent,
    Pending { version: u64, tombstone: bool },
    Committed { version: u64 },
    Tombstoned { version: u64 },
}

impl RowState {
    pub fn of(record: Option<&RowRecord>) -> Self {
        match record {
            None => RowState::Absent,
            Some(r) if r.lock => RowState::Pending {
                version: r.version,
                tombstone: r.tombstone,
            },
            Some(r) if r.tombstone => RowState::Tombstoned { version: r.version },
            Some(r) => RowState::Committed { version: r.version },
        }
    }
}

/// A client-requested row mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Create { payload: Value },
    Replace {
        payload: Value,
        expected_version: u64,
    },
    Delete { expected_version: u64 },
    /// Insert-or-replace without a version check.
    Upsert { payload: Value },
    /// Shallow JSON object merge of `patch` into the stored payload.
    Merge { patch: Value, expected_version: u64 },
}

/// The next head copy an operation produces, before locking and view stamping.
#[derive(Debug, Clone, PartialEq)]
pub struct Planned {
    pub version: u64,
    pub tombstone: bool,
    pub payload: Value,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Replace { .. } => "replace",
            Operation::Delete { .. } => "delete",
            Operation::Upsert { .. } => "upsert",
            Operation::Merge { .. } => "merge",
        }
    }

    pub fn expected_version(&self) -> Option<u64> {
        match self {
            Operation::Replace { expected_version, .. }
            | Operation::Delete { expected_version }
            | Operation::Merge { expected_version, .. } => Some(*expected_version),
            Operation::Create { .. } | Operation::Upsert { .. } => None,
        }
    }

    /// Validates this operation against the head copy and computes the record
    /// it would install. Has no side effects.
    pub fn plan(&self, key: &RowKey, current: Option<&RowRecord>) -> ChainResult<Planned> {
        let state = RowState::of(current);
        let expected = self.expected_version();

        // Pending heads are resolved by the executor before planning.
        if let RowState::Pending { version, .. } = state {
            return Err(ChainError::VersionConflict {
                key: key.clone(),
                expected,
                actual: Some(version),
            });
        }

        match (self, state) {
            (Operation::Create { payload }, RowState::Absent)
            | (Operation::Upsert { payload }, RowState::Absent) => Ok(Planned {
                version: 1,
                tombstone: false,
                payload: payload.clone(),
            }),
            (Operation::Create { payload }, RowState::Tombstoned { version })
            | (Operation::Upsert { payload }, RowState::Tombstoned { version })
            | (Operation::Upsert { payload }, RowState::Committed { version }) => Ok(Planned {
                version: version + 1,
                tombstone: false,
                payload: payload.clone(),
            }),
            (Operation::Create { .. }, RowState::Committed { version }) => {
                Err(ChainError::AlreadyExists {
                    key: key.clone(),
                    version,
                })
            }
            (_, RowState::Absent) | (_, RowState::Tombstoned { .. }) => {
                Err(ChainError::NotFound(key.clone()))
            }
            (_, RowState::Committed { version }) if expected != Some(version) => {
                Err(ChainError::VersionConflict {
                    key: key.clone(),
                    expected,
                    actual: Some(version),
                })
            }
            (Operation::Replace { payload, .. }, RowState::Committed { version }) => Ok(Planned {
                version: version + 1,
                tombstone: false,
                payload: payload.clone(),
            }),
            (Operation::Merge { patch, .. }, RowState::Committed { version }) => {
                let stored = current.map(|r| &r.payload).unwrap_or(&Value::Null);
                Ok(Planned {
                    version: version + 1,
                    tombstone: false,
                    payload: merge_payload(stored, patch),
                })
            }
            (Operation::Delete { .. }, RowState::Committed { version }) => Ok(Planned {
                version,
                tombstone: true,
                payload: Value::Null,
            }),
            (_, RowState::Pending { .. }) => unreachable!("pending handled above"),
        }
    }
}

fn merge_payload(stored: &Value, patch: &Value) -> Value {
    match (stored, patch) {
        (Value::Object(base), Value::Object(fields)) => {
            let mut merged = base.clone();
            for (name, value) in fields {
                merged.insert(name.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> RowKey {
        RowKey::new("jobType-A", "jobId-A")
    }

    fn record(version: u64, tombstone: bool, lock: bool) -> RowRecord {
        RowRecord {
            key: key(),
            payload: json!({"message": "m"}),
            version,
            view_id: 1,
            tombstone,
            lock,
            lock_acquired_ms: 0,
            etag: None,
        }
    }

    #[test]
    fn state_follows_head_copy() {
        assert_eq!(RowState::of(None), RowState::Absent);
        assert_eq!(
            RowState::of(Some(&record(3, false, true))),
            RowState::Pending {
                version: 3,
                tombstone: false
            }
        );
        assert_eq!(
            RowState::of(Some(&record(3, false, false))),
            RowState::Committed { version: 3 }
        );
        assert_eq!(
            RowState::of(Some(&record(3, true, false))),
            RowState::Tombstoned { version: 3 }
        );
    }

    #[test]
    fn create_on_absent_starts_at_one() {
        let planned = Operation::Create { payload: json!(1) }.plan(&key(), None).unwrap();
        assert_eq!(planned.version, 1);
        assert!(!planned.tombstone);
    }

    #[test]
    fn create_after_tombstone_bumps_version() {
        let tomb = record(2, true, false);
        let planned = Operation::Create {
            payload: json!("P2"),
        }
        .plan(&key(), Some(&tomb))
        .unwrap();
        assert_eq!(planned.version, 3);
        assert_eq!(planned.payload, json!("P2"));
    }

    #[test]
    fn create_on_live_row_is_rejected() {
        let live = record(1, false, false);
        let err = Operation::Create { payload: json!(1) }
            .plan(&key(), Some(&live))
            .unwrap_err();
        assert!(matches!(err, ChainError::AlreadyExists { version: 1, .. }));
    }

    #[test]
    fn replace_checks_expected_version() {
        let live = record(4, false, false);
        let ok = Operation::Replace {
            payload: json!("x"),
            expected_version: 4,
        }
        .plan(&key(), Some(&live))
        .unwrap();
        assert_eq!(ok.version, 5);

        let err = Operation::Replace {
            payload: json!("x"),
            expected_version: 3,
        }
        .plan(&key(), Some(&live))
        .unwrap_err();
        assert!(matches!(
            err,
            ChainError::VersionConflict { expected: Some(3), actual: Some(4), .. }
        ));
    }

    #[test]
    fn replace_and_delete_need_a_live_row() {
        let tomb = record(2, true, false);
        for op in [
            Operation::Replace {
                payload: json!(1),
                expected_version: 2,
            },
            Operation::Delete {
                expected_version: 2,
            },
        ] {
            assert!(matches!(op.plan(&key(), None), Err(ChainError::NotFound(_))));
            assert!(matches!(op.plan(&key(), Some(&tomb)), Err(ChainError::NotFound(_))));
        }
    }

    #[test]
    fn delete_keeps_version_and_drops_payload() {
        let live = record(2, false, false);
        let planned = Operation::Delete {
            expected_version: 2,
        }
        .plan(&key(), Some(&live))
        .unwrap();
        assert_eq!(planned.version, 2);
        assert!(planned.tombstone);
        assert_eq!(planned.payload, Value::Null);
        assert!(record(2, true, false).order() > live.order());
    }

    #[test]
    fn pending_head_is_a_conflict() {
        let pending = record(2, false, true);
        let err = Operation::Upsert { payload: json!(1) }
            .plan(&key(), Some(&pending))
            .unwrap_err();
        assert!(matches!(err, ChainError::VersionConflict { actual: Some(2), .. }));
    }

    #[test]
    fn merge_overlays_object_fields() {
        let mut live = record(1, false, false);
        live.payload = json!({"a": 1, "b": 2});
        let planned = Operation::Merge {
            patch: json!({"b": 3, "c": 4}),
            expected_version: 1,
        }
        .plan(&key(), Some(&live))
        .unwrap();
        assert_eq!(planned.payload, json!({"a": 1, "b": 3, "c": 4}));
        assert_eq!(planned.version, 2);
    }

    #[test]
    fn committed_copy_sorts_after_locked_twin() {
        let locked = record(5, false, true);
        let committed = locked.committed();
        assert!(committed.order() > locked.order());
        assert!(committed.same_write(&locked));
        assert!(!committed.same_write(&record(6, false, false)));
    }

    #[test]
    fn stored_form_leaves_out_the_etag() {
        let mut stored = record(2, true, false);
        stored.etag = Some(ETag(9));

        let text = serde_json::to_string(&stored).unwrap();
        assert!(!text.contains("etag"));

        let loaded: RowRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(loaded.etag, None);
        assert_eq!(
            loaded,
            RowRecord {
                etag: None,
                ..stored
            }
        );
    }
}
