//! Replica backends.
//!
//! A [`Replica`] is one independent storage endpoint in the chain. The table
//! only ever talks to it through `get` and token-guarded `put`; deletes are
//! puts of a tombstoned copy.
//!
//! [`MemoryReplica`] is an in-process backend with injectable faults, used by
//! the demo shell and the test suites to stand in for a slow or flaky remote
//! store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::error::ReplicaError;
use crate::row::{ETag, RowKey, RowRecord};

#[async_trait]
pub trait Replica: Send + Sync + 'static {
    /// Stable name used in logs and errors.
    fn name(&self) -> &str;

    /// Reads this replica's copy of `key`, with its current etag filled in.
    async fn get(&self, key: &RowKey) -> Result<Option<RowRecord>, ReplicaError>;

    /// Stores `record` if the replica's copy still carries `expected`.
    ///
    /// `expected = None` only succeeds when the replica holds no copy.
    async fn put(&self, record: RowRecord, expected: Option<ETag>) -> Result<ETag, ReplicaError>;
}

/// Fault injected into every request a [`MemoryReplica`] serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Hold each request for the given time before serving it.
    Delay(Duration),
    /// Fail each request.
    Unavailable,
}

/// In-memory replica.
///
/// Holds each row copy next to the etag it was stored under. Etags come from
/// a per-replica counter, so a token issued here is never valid elsewhere.
pub struct MemoryReplica {
    name: String,
    data: Mutex<BTreeMap<RowKey, (RowRecord, ETag)>>,
    fault: Mutex<Option<Fault>>,
    next_etag: AtomicU64,
    writes: AtomicU64,
}

impl MemoryReplica {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(BTreeMap::new()),
            fault: Mutex::new(None),
            next_etag: AtomicU64::new(1),
            writes: AtomicU64::new(0),
        }
    }

    /// Applies `fault` to every following request until [`clear_fault`](Self::clear_fault).
    pub fn inject(&self, fault: Fault) {
        *self.fault.lock().unwrap_or_else(|e| e.into_inner()) = Some(fault);
    }

    pub fn clear_fault(&self) {
        *self.fault.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Erases a row out-of-band, bypassing the chain protocol.
    pub fn purge(&self, key: &RowKey) {
        self.lock_data().remove(key);
    }

    /// Reads a copy without fault injection.
    pub fn peek(&self, key: &RowKey) -> Option<RowRecord> {
        self.lock_data().get(key).map(|(record, etag)| RowRecord {
            etag: Some(*etag),
            ..record.clone()
        })
    }

    /// Stores a copy without any token check or fault injection.
    pub fn force(&self, record: RowRecord) -> ETag {
        let etag = self.issue_etag();
        let record = RowRecord {
            etag: None,
            ..record
        };
        self.lock_data().insert(record.key.clone(), (record, etag));
        etag
    }

    /// Number of successful `put` calls served.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Snapshot of every stored copy.
    pub fn snapshot(&self) -> BTreeMap<RowKey, RowRecord> {
        self.lock_data()
            .iter()
            .map(|(key, (record, etag))| {
                (
                    key.clone(),
                    RowRecord {
                        etag: Some(*etag),
                        ..record.clone()
                    },
                )
            })
            .collect()
    }

    fn lock_data(&self) -> std::sync::MutexGuard<'_, BTreeMap<RowKey, (RowRecord, ETag)>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn issue_etag(&self) -> ETag {
        ETag(self.next_etag.fetch_add(1, Ordering::Relaxed))
    }

    async fn apply_fault(&self) -> Result<(), ReplicaError> {
        let fault = *self.fault.lock().unwrap_or_else(|e| e.into_inner());
        match fault {
            None => Ok(()),
            Some(Fault::Delay(delay)) => {
                trace!(replica = %self.name, ?delay, "delaying request");
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(Fault::Unavailable) => Err(ReplicaError::Unavailable(format!(
                "{} is not accepting requests",
                self.name
            ))),
        }
    }
}

#[async_trait]
impl Replica for MemoryReplica {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &RowKey) -> Result<Option<RowRecord>, ReplicaError> {
        self.apply_fault().await?;
        Ok(self.peek(key))
    }

    async fn put(&self, record: RowRecord, expected: Option<ETag>) -> Result<ETag, ReplicaError> {
        self.apply_fault().await?;

        let mut data = self.lock_data();
        let current = data.get(&record.key).map(|(_, etag)| *etag);
        if current != expected {
            return Err(ReplicaError::ConcurrencyConflict);
        }

        let etag = self.issue_etag();
        let record = RowRecord {
            etag: None,
            ..record
        };
        data.insert(record.key.clone(), (record, etag));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(etag)
    }
}
