//! Bringing lagging replicas up to the head's copy.
//!
//! Repair never computes anything new: it takes the head's copy of a row,
//! clears its lock, and installs that committed copy on every replica behind
//! it, tail-ward first and head last. Installing is keyed by the copy's
//! order, so running repair on a consistent chain writes nothing.
//!
//! Rows whose write halted mid-chain are handed to the [`RepairWorker`]
//! through a [`RepairQueue`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TableConfig;
use crate::error::{ChainError, ChainResult};
use crate::hop::{self, HopError, Installed};
use crate::replica::Replica;
use crate::row::{RowKey, RowRecord};
use crate::view::{ChainView, ViewHandle};

/// Result of a successful repair.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairReport {
    /// Committed copy every replica now holds, or `None` if the head has no copy.
    pub record: Option<RowRecord>,
    /// Replicas that had to be written, in the order they were written.
    pub repaired: Vec<String>,
}

impl RepairReport {
    pub fn was_consistent(&self) -> bool {
        self.repaired.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RepairCoordinator {
    config: TableConfig,
}

impl RepairCoordinator {
    pub fn new(config: TableConfig) -> Self {
        Self { config }
    }

    /// Reconciles every replica in `view` with the head's copy of `key`.
    ///
    /// Stops at the first replica that cannot be brought up to date and
    /// reports [`ChainError::ChainInconsistent`]; replicas before it keep
    /// whatever was installed, so the next repair resumes from there.
    pub async fn repair(&self, view: &ChainView, key: &RowKey) -> ChainResult<RepairReport> {
        let limit = self.config.hop_timeout();
        let head = view.head();

        let Some(authoritative) = hop::fetch(head.as_ref(), key, limit)
            .await
            .map_err(|err| inconsistent(key, head, err))?
        else {
            return Ok(RepairReport {
                record: None,
                repaired: Vec::new(),
            });
        };

        let target = authoritative.committed();
        let mut repaired = Vec::new();

        for replica in &view.replicas()[1..] {
            match hop::install(replica.as_ref(), &target, limit, self.config.etag_retries).await {
                Ok(Installed::Written(_)) => repaired.push(replica.name().to_string()),
                Ok(Installed::Current) => {}
                Ok(Installed::Superseded) => {
                    // A replica can only be ahead of the copy we read if a
                    // newer write reached the head after our read.
                    debug!(%key, replica = replica.name(), "newer write overtook repair");
                    return Ok(RepairReport {
                        record: Some(target),
                        repaired,
                    });
                }
                Err(err) => {
                    warn!(%key, replica = replica.name(), error = %err, "repair halted");
                    return Err(inconsistent(key, replica, err));
                }
            }
        }

        if authoritative.is_pending() {
            match hop::install(head.as_ref(), &target, limit, self.config.etag_retries).await {
                Ok(Installed::Written(_)) => repaired.push(head.name().to_string()),
                Ok(_) => {}
                Err(err) => return Err(inconsistent(key, head, err)),
            }
        }

        if !repaired.is_empty() {
            info!(
                %key,
                version = target.version,
                tombstone = target.tombstone,
                repaired = ?repaired,
                "repaired row"
            );
        }

        Ok(RepairReport {
            record: Some(target),
            repaired,
        })
    }
}

fn inconsistent(key: &RowKey, replica: &Arc<dyn Replica>, err: HopError) -> ChainError {
    ChainError::ChainInconsistent {
        key: key.clone(),
        replica: replica.name().to_string(),
        reason: err.to_string(),
    }
}

#[derive(Debug)]
struct RepairRequest {
    key: RowKey,
    attempt: u32,
}

/// Sending half of the repair queue, held by the table.
#[derive(Debug, Clone)]
pub struct RepairQueue {
    tx: mpsc::UnboundedSender<RepairRequest>,
}

impl RepairQueue {
    pub fn enqueue(&self, key: RowKey) {
        debug!(%key, "queueing row for repair");
        if self.tx.send(RepairRequest { key, attempt: 0 }).is_err() {
            warn!("repair worker is gone; row left for the next read or write to repair");
        }
    }
}

/// Drains the repair queue, repairing each row against the current view.
///
/// A failed repair is retried after a jittered backoff up to
/// `repair_attempts` times; after that the row waits for the next read or
/// write to touch it.
pub struct RepairWorker {
    rx: mpsc::UnboundedReceiver<RepairRequest>,
    retry_tx: mpsc::UnboundedSender<RepairRequest>,
    views: ViewHandle,
    coordinator: RepairCoordinator,
    config: TableConfig,
}

pub fn repair_channel(
    views: ViewHandle,
    coordinator: RepairCoordinator,
    config: TableConfig,
) -> (RepairQueue, RepairWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = RepairWorker {
        rx,
        retry_tx: tx.clone(),
        views,
        coordinator,
        config,
    };
    (RepairQueue { tx }, worker)
}

impl RepairWorker {
    /// Runs until `shutdown` resolves.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("repair worker shutting down");
                    break;
                }
                request = self.rx.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }
    }

    /// Repairs every row currently queued without waiting for new ones.
    ///
    /// Returns the number of rows processed.
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(request) = self.rx.try_recv() {
            self.handle(request).await;
            processed += 1;
        }
        processed
    }

    async fn handle(&self, request: RepairRequest) {
        let view = self.views.current();
        match self.coordinator.repair(&view, &request.key).await {
            Ok(report) => {
                debug!(key = %request.key, repaired = ?report.repaired, "queued repair done")
            }
            Err(err) => {
                let attempt = request.attempt + 1;
                if attempt >= self.config.repair_attempts {
                    warn!(key = %request.key, error = %err, attempt, "giving up on queued repair");
                    return;
                }
                let delay = self.backoff(attempt);
                warn!(
                    key = %request.key,
                    error = %err,
                    attempt,
                    ?delay,
                    "queued repair failed, retrying"
                );
                let retry_tx = self.retry_tx.clone();
                let key = request.key;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = retry_tx.send(RepairRequest { key, attempt });
                });
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.repair_retry();
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base * attempt + Duration::from_millis(jitter)
    }
}
