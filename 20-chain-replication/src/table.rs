//! The replicated table: row operations driven through the chain.
//!
//! A write runs in two parts:
//!
//! 1. **Admission** (on the caller's task): load the head's copy, repair the
//!    chain if that copy is still pending, validate the operation, and write a
//!    locked copy to the head guarded by the head's etag. Losing the etag race
//!    means another writer got there first.
//! 2. **Propagation** (on a spawned task): install the locked copy on each
//!    inner replica in chain order, the committed copy on the tail, then clear
//!    the lock on inners from the tail side back to the head.
//!
//! Once the head holds the locked copy the write cannot be abandoned, so
//! propagation is spawned and the caller only awaits its result. Dropping the
//! caller's future leaves propagation running.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::TableConfig;
use crate::error::{ChainError, ChainResult, ReplicaError};
use crate::hop::{self, HopError, Installed};
use crate::repair::{RepairCoordinator, RepairQueue, RepairReport, RepairWorker, repair_channel};
use crate::replica::Replica;
use crate::row::{Operation, RowKey, RowRecord, unix_millis};
use crate::view::{ChainView, ViewHandle};

/// Result of a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub version: u64,
    pub view_id: u64,
}

/// Handle for issuing row operations against a chain of replicas.
///
/// Cheap to clone; clones share the view slot and the repair queue.
#[derive(Clone)]
pub struct ReplicatedTable {
    views: ViewHandle,
    config: TableConfig,
    repairer: RepairCoordinator,
    repairs: RepairQueue,
}

impl ReplicatedTable {
    /// Creates a table over `view`.
    ///
    /// The returned [`RepairWorker`] services rows whose writes halted
    /// mid-chain; spawn it with [`RepairWorker::run_until`].
    pub fn new(view: ChainView, config: TableConfig) -> (Self, RepairWorker) {
        let views = ViewHandle::new(view);
        let repairer = RepairCoordinator::new(config.clone());
        let (repairs, worker) = repair_channel(views.clone(), repairer.clone(), config.clone());
        let table = Self {
            views,
            config,
            repairer,
            repairs,
        };
        (table, worker)
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> Arc<ChainView> {
        self.views.current()
    }

    /// Switches later operations to `view`. In-flight operations keep theirs.
    pub fn install_view(&self, view: ChainView) -> anyhow::Result<()> {
        let view_id = view.view_id();
        self.views.install(view)?;
        info!(view_id, "installed chain view");
        Ok(())
    }

    pub async fn create(&self, key: RowKey, payload: Value) -> ChainResult<WriteOutcome> {
        self.write(key, Operation::Create { payload }).await
    }

    pub async fn replace(
        &self,
        key: RowKey,
        payload: Value,
        expected_version: u64,
    ) -> ChainResult<WriteOutcome> {
        self.write(
            key,
            Operation::Replace {
                payload,
                expected_version,
            },
        )
        .await
    }

    /// Tombstones the row. The tombstone keeps `expected_version`.
    pub async fn delete(&self, key: RowKey, expected_version: u64) -> ChainResult<WriteOutcome> {
        self.write(key, Operation::Delete { expected_version }).await
    }

    /// Creates or replaces the row without a version check.
    pub async fn upsert(&self, key: RowKey, payload: Value) -> ChainResult<WriteOutcome> {
        self.write(key, Operation::Upsert { payload }).await
    }

    /// Overlays the fields of `patch` onto the stored JSON object.
    pub async fn merge(
        &self,
        key: RowKey,
        patch: Value,
        expected_version: u64,
    ) -> ChainResult<WriteOutcome> {
        self.write(
            key,
            Operation::Merge {
                patch,
                expected_version,
            },
        )
        .await
    }

    /// Reads the committed row.
    ///
    /// Served from the tail. If the head holds a later write, the chain is
    /// repaired first and the tail re-read.
    pub async fn read(&self, key: &RowKey) -> ChainResult<RowRecord> {
        let view = self.views.current();
        let tail_copy = self.fetch(view.tail(), key).await?;
        let head_copy = if view.len() == 1 {
            tail_copy.clone()
        } else {
            self.fetch(view.head(), key).await?
        };

        let behind = match (&head_copy, &tail_copy) {
            (Some(head), Some(tail)) => head.committed().order() > tail.order(),
            (Some(_), None) => true,
            (None, _) => false,
        };

        let copy = if behind {
            debug!(%key, "tail behind head on read, repairing");
            self.repairer.repair(&view, key).await?;
            self.fetch(view.tail(), key).await?
        } else {
            tail_copy
        };

        match copy {
            Some(record) if !record.tombstone => Ok(RowRecord {
                etag: None,
                ..record
            }),
            _ => Err(ChainError::NotFound(key.clone())),
        }
    }

    /// Reconciles every replica with the head's copy of `key`.
    pub async fn repair(&self, key: &RowKey) -> ChainResult<RepairReport> {
        let view = self.views.current();
        self.repairer.repair(&view, key).await
    }

    async fn write(&self, key: RowKey, op: Operation) -> ChainResult<WriteOutcome> {
        let view = self.views.current();
        let head = view.head();

        let current = self.admit(&view, &key, &op).await?;
        let planned = op.plan(&key, current.as_ref())?;

        let record = RowRecord {
            key: key.clone(),
            payload: planned.payload,
            version: planned.version,
            view_id: view.view_id(),
            tombstone: planned.tombstone,
            lock: true,
            lock_acquired_ms: unix_millis(),
            etag: None,
        };
        let expected = current.as_ref().and_then(|copy| copy.etag);

        match hop::store(head.as_ref(), record.clone(), expected, self.config.hop_timeout()).await {
            Ok(_) => {}
            Err(HopError::Failed(ReplicaError::ConcurrencyConflict)) => {
                debug!(%key, op = op.name(), "lost head race");
                return Err(ChainError::VersionConflict {
                    key,
                    expected: op.expected_version(),
                    actual: None,
                });
            }
            Err(HopError::Timeout(timeout)) => {
                // The put may have landed; leave it for repair to settle.
                self.repairs.enqueue(key.clone());
                return Err(ChainError::ReplicaUnreachable {
                    key,
                    replica: head.name().to_string(),
                    timeout,
                });
            }
            Err(HopError::Failed(reason)) => {
                return Err(ChainError::ReplicaFailed {
                    key,
                    replica: head.name().to_string(),
                    reason,
                });
            }
        }

        debug!(%key, op = op.name(), version = record.version, "head accepted write");

        let propagation = Propagation {
            view: Arc::clone(&view),
            record,
            config: self.config.clone(),
            repairs: self.repairs.clone(),
        };
        let outcome = tokio::spawn(propagation.run()).await??;

        info!(%key, op = op.name(), version = outcome.version, "committed row write");
        Ok(outcome)
    }

    /// Loads the head's copy for a write, settling a pending copy first.
    async fn admit(
        &self,
        view: &ChainView,
        key: &RowKey,
        op: &Operation,
    ) -> ChainResult<Option<RowRecord>> {
        let head = view.head();
        let mut current = self.fetch(head, key).await?;

        if let Some(copy) = &current {
            if copy.view_id > view.view_id() {
                return Err(ChainError::StaleView {
                    key: key.clone(),
                    row_view: copy.view_id,
                    current_view: view.view_id(),
                });
            }
        }

        if let Some(copy) = current.as_ref().filter(|copy| copy.is_pending()) {
            // Repair installs forward only; a writer still propagating this
            // copy sees Current or Superseded at each later hop.
            let age = copy.lock_age(unix_millis());
            if age < self.config.lock_timeout() {
                debug!(%key, version = copy.version, ?age, "finishing pending write before ours");
            } else {
                warn!(%key, version = copy.version, ?age, "taking over abandoned write");
            }
            self.repairer.repair(view, key).await?;
            current = self.fetch(head, key).await?;

            if let Some(copy) = current.as_ref().filter(|copy| copy.is_pending()) {
                return Err(ChainError::VersionConflict {
                    key: key.clone(),
                    expected: op.expected_version(),
                    actual: Some(copy.version),
                });
            }
        }

        Ok(current)
    }

    async fn fetch(
        &self,
        replica: &Arc<dyn Replica>,
        key: &RowKey,
    ) -> ChainResult<Option<RowRecord>> {
        hop::fetch(replica.as_ref(), key, self.config.hop_timeout())
            .await
            .map_err(|err| match err {
                HopError::Timeout(timeout) => ChainError::ReplicaUnreachable {
                    key: key.clone(),
                    replica: replica.name().to_string(),
                    timeout,
                },
                HopError::Failed(reason) => ChainError::ReplicaFailed {
                    key: key.clone(),
                    replica: replica.name().to_string(),
                    reason,
                },
            })
    }
}

/// Carries one head-accepted write down the chain.
struct Propagation {
    view: Arc<ChainView>,
    record: RowRecord,
    config: TableConfig,
    repairs: RepairQueue,
}

impl Propagation {
    async fn run(self) -> ChainResult<WriteOutcome> {
        let outcome = WriteOutcome {
            version: self.record.version,
            view_id: self.view.view_id(),
        };
        let committed = self.record.committed();
        let replicas = self.view.replicas();
        let tail = replicas.len() - 1;

        for (index, replica) in replicas.iter().enumerate().skip(1) {
            let copy = if index == tail { &committed } else { &self.record };
            if self.hop(replica, copy).await? == Installed::Superseded {
                // A later write only reaches a replica after repair has
                // committed this one on every replica.
                debug!(
                    key = %self.record.key,
                    replica = replica.name(),
                    "write already rolled forward"
                );
                return Ok(outcome);
            }
        }

        // Head last: an unlocked head means every replica has committed.
        for replica in replicas[..tail.max(1)].iter().rev() {
            if self.hop(replica, &committed).await? == Installed::Superseded {
                return Ok(outcome);
            }
        }

        Ok(outcome)
    }

    async fn hop(&self, replica: &Arc<dyn Replica>, copy: &RowRecord) -> ChainResult<Installed> {
        let key = &self.record.key;
        match hop::install(
            replica.as_ref(),
            copy,
            self.config.hop_timeout(),
            self.config.etag_retries,
        )
        .await
        {
            Ok(installed) => Ok(installed),
            Err(HopError::Timeout(timeout)) => {
                warn!(%key, replica = replica.name(), ?timeout, "hop timed out, queueing repair");
                self.repairs.enqueue(key.clone());
                Err(ChainError::ReplicaUnreachable {
                    key: key.clone(),
                    replica: replica.name().to_string(),
                    timeout,
                })
            }
            Err(HopError::Failed(reason)) => {
                warn!(
                    %key,
                    replica = replica.name(),
                    error = %reason,
                    "hop failed, queueing repair"
                );
                self.repairs.enqueue(key.clone());
                Err(ChainError::PartiallyApplied {
                    key: key.clone(),
                    version: self.record.version,
                    replica: replica.name().to_string(),
                    reason,
                })
            }
        }
    }
}
