//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chain_replication::repair::RepairWorker;
use chain_replication::{
    ChainView, Fault, MemoryReplica, Replica, ReplicatedTable, RowKey, RowRecord, TableConfig,
};
use serde_json::Value;

/// Delay injected into a single replica by the delay scenarios.
pub const SHORT_DELAY: Duration = Duration::from_millis(3000);

/// A table over in-memory replicas that tests can poke at directly.
pub struct TestChain {
    pub replicas: Vec<Arc<MemoryReplica>>,
    pub table: ReplicatedTable,
    pub worker: RepairWorker,
}

impl TestChain {
    /// Builds a chain of `n` replicas named `replica-0` (head) .. `replica-{n-1}` (tail).
    pub fn spawn(n: usize) -> Self {
        Self::with_config(n, TableConfig::default())
    }

    pub fn with_config(n: usize, config: TableConfig) -> Self {
        let replicas: Vec<Arc<MemoryReplica>> = (0..n)
            .map(|i| Arc::new(MemoryReplica::new(format!("replica-{i}"))))
            .collect();
        let view = ChainView::new(
            1,
            replicas
                .iter()
                .map(|replica| Arc::clone(replica) as Arc<dyn Replica>)
                .collect(),
        )
        .expect("valid test view");
        let (table, worker) = ReplicatedTable::new(view, config);
        Self {
            replicas,
            table,
            worker,
        }
    }

    pub fn replica(&self, index: usize) -> &MemoryReplica {
        &self.replicas[index]
    }

    pub fn tail_index(&self) -> usize {
        self.replicas.len() - 1
    }

    /// Erases `key` from every replica behind the chain's back.
    pub fn force_delete(&self, key: &RowKey) {
        for replica in &self.replicas {
            replica.purge(key);
        }
    }

    pub fn inject(&self, index: usize, fault: Fault) {
        self.replicas[index].inject(fault);
    }

    pub fn clear_faults(&self) {
        for replica in &self.replicas {
            replica.clear_fault();
        }
    }

    /// Each replica's copy of `key`, head first.
    pub fn copies(&self, key: &RowKey) -> Vec<Option<RowRecord>> {
        self.replicas.iter().map(|replica| replica.peek(key)).collect()
    }

    /// Successful puts served by each replica, head first.
    pub fn write_counts(&self) -> Vec<u64> {
        self.replicas.iter().map(|replica| replica.write_count()).collect()
    }

    /// Asserts every replica holds the same committed copy of `key`.
    pub fn assert_converged(&self, key: &RowKey, version: u64, payload: &Value) {
        for (index, copy) in self.copies(key).into_iter().enumerate() {
            let copy = copy.unwrap_or_else(|| panic!("replica-{index} has no copy of {key}"));
            assert_eq!(copy.version, version, "replica-{index} version");
            assert!(!copy.lock, "replica-{index} still pending");
            assert!(!copy.tombstone, "replica-{index} tombstoned");
            assert_eq!(&copy.payload, payload, "replica-{index} payload");
        }
    }

    /// Asserts every replica holds a committed tombstone of `key` at `version`.
    pub fn assert_tombstoned(&self, key: &RowKey, version: u64) {
        for (index, copy) in self.copies(key).into_iter().enumerate() {
            let copy = copy.unwrap_or_else(|| panic!("replica-{index} has no copy of {key}"));
            assert_eq!(copy.version, version, "replica-{index} version");
            assert!(copy.tombstone, "replica-{index} not tombstoned");
            assert!(!copy.lock, "replica-{index} still pending");
        }
    }
}

/// Row key in the `jobType-*` / `jobId-*` shape the scenarios use.
pub fn job_key(name: &str) -> RowKey {
    RowKey::new(format!("jobType-{name}"), format!("jobId-{name}"))
}
