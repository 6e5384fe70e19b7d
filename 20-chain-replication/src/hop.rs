//! Single-replica calls bounded by the hop timeout.
//!
//! Both the executor and the repair coordinator move replica copies forward
//! only through [`install`], which never writes a copy that is older than what
//! the replica already holds.

use std::fmt;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::error::ReplicaError;
use crate::replica::Replica;
use crate::row::{ETag, RowKey, RowRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HopError {
    /// No answer within the hop timeout; the request may still have landed.
    Timeout(Duration),
    /// The replica answered with an error.
    Failed(ReplicaError),
}

impl fmt::Display for HopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopError::Timeout(limit) => write!(f, "no answer within {limit:?}"),
            HopError::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// What [`install`] found at the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Installed {
    Written(ETag),
    /// The replica already had this write, committed at least as far.
    Current,
    /// The replica already holds a later write.
    Superseded,
}

pub(crate) async fn fetch(
    replica: &dyn Replica,
    key: &RowKey,
    limit: Duration,
) -> Result<Option<RowRecord>, HopError> {
    match timeout(limit, replica.get(key)).await {
        Ok(result) => result.map_err(HopError::Failed),
        Err(_) => Err(HopError::Timeout(limit)),
    }
}

pub(crate) async fn store(
    replica: &dyn Replica,
    record: RowRecord,
    expected: Option<ETag>,
    limit: Duration,
) -> Result<ETag, HopError> {
    match timeout(limit, replica.put(record, expected)).await {
        Ok(result) => result.map_err(HopError::Failed),
        Err(_) => Err(HopError::Timeout(limit)),
    }
}

/// Moves `replica`'s copy of `target.key` forward to `target`.
///
/// Re-reads and retries when the replica's etag changes underneath us, up to
/// `attempts` times.
pub(crate) async fn install(
    replica: &dyn Replica,
    target: &RowRecord,
    limit: Duration,
    attempts: u32,
) -> Result<Installed, HopError> {
    for _ in 0..attempts {
        let expected = match fetch(replica, &target.key, limit).await? {
            None => None,
            Some(current) if current.order() >= target.order() => {
                return Ok(if current.same_write(target) {
                    Installed::Current
                } else {
                    Installed::Superseded
                });
            }
            Some(current) => current.etag,
        };

        let copy = RowRecord {
            etag: None,
            ..target.clone()
        };
        match store(replica, copy, expected, limit).await {
            Ok(etag) => {
                debug!(
                    replica = replica.name(),
                    key = %target.key,
                    version = target.version,
                    lock = target.lock,
                    "installed row copy"
                );
                return Ok(Installed::Written(etag));
            }
            Err(HopError::Failed(ReplicaError::ConcurrencyConflict)) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(HopError::Failed(ReplicaError::Contended))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{Fault, MemoryReplica};
    use serde_json::json;

    fn record(version: u64, lock: bool) -> RowRecord {
        RowRecord {
            key: RowKey::new("p", "r"),
            payload: json!(version),
            version,
            view_id: 1,
            tombstone: false,
            lock,
            lock_acquired_ms: 0,
            etag: None,
        }
    }

    const LIMIT: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn install_moves_copy_forward_only() {
        let replica = MemoryReplica::new("r");
        assert!(matches!(
            install(&replica, &record(1, true), LIMIT, 3).await,
            Ok(Installed::Written(_))
        ));
        assert!(matches!(
            install(&replica, &record(1, false), LIMIT, 3).await,
            Ok(Installed::Written(_))
        ));
        // Re-locking a committed copy is a no-op.
        assert_eq!(
            install(&replica, &record(1, true), LIMIT, 3).await,
            Ok(Installed::Current)
        );

        replica.force(record(3, false));
        assert_eq!(
            install(&replica, &record(2, false), LIMIT, 3).await,
            Ok(Installed::Superseded)
        );
        assert_eq!(replica.peek(&RowKey::new("p", "r")).unwrap().version, 3);
        assert_eq!(replica.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_replica_times_out() {
        let replica = MemoryReplica::new("r");
        replica.inject(Fault::Delay(Duration::from_secs(5)));
        let err = fetch(&replica, &RowKey::new("p", "r"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, HopError::Timeout(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn unavailable_replica_fails_definitively() {
        let replica = MemoryReplica::new("r");
        replica.inject(Fault::Unavailable);
        assert!(matches!(
            install(&replica, &record(1, false), LIMIT, 3).await,
            Err(HopError::Failed(ReplicaError::Unavailable(_)))
        ));
    }
}
