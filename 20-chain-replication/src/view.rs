//! Chain membership: which replicas a write passes through, and in what order.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::{Result, ensure};

use crate::replica::Replica;

/// Position-derived role of a replica in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Head,
    Inner,
    Tail,
    /// Single-replica chain.
    HeadAndTail,
}

/// Immutable, ordered snapshot of the replicas a write travels through.
///
/// A new membership is a new `ChainView` with a larger `view_id`; a view in
/// use is never mutated.
pub struct ChainView {
    view_id: u64,
    replicas: Vec<Arc<dyn Replica>>,
}

impl ChainView {
    pub fn new(view_id: u64, replicas: Vec<Arc<dyn Replica>>) -> Result<Self> {
        ensure!(!replicas.is_empty(), "chain view requires at least one replica");
        let mut seen = HashSet::new();
        for replica in &replicas {
            ensure!(
                seen.insert(replica.name().to_string()),
                "replica {} appears twice in view {view_id}",
                replica.name()
            );
        }
        Ok(Self { view_id, replicas })
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn replicas(&self) -> &[Arc<dyn Replica>] {
        &self.replicas
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn head(&self) -> &Arc<dyn Replica> {
        &self.replicas[0]
    }

    pub fn tail(&self) -> &Arc<dyn Replica> {
        &self.replicas[self.replicas.len() - 1]
    }

    /// Replicas strictly between head and tail, in chain order.
    pub fn inners(&self) -> &[Arc<dyn Replica>] {
        if self.replicas.len() <= 2 {
            &[]
        } else {
            &self.replicas[1..self.replicas.len() - 1]
        }
    }

    pub fn role_of(&self, index: usize) -> Option<Role> {
        let last = self.replicas.len() - 1;
        match index {
            i if i > last => None,
            0 if last == 0 => Some(Role::HeadAndTail),
            0 => Some(Role::Head),
            i if i == last => Some(Role::Tail),
            _ => Some(Role::Inner),
        }
    }
}

impl fmt::Debug for ChainView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.replicas.iter().map(|r| r.name()).collect();
        f.debug_struct("ChainView")
            .field("view_id", &self.view_id)
            .field("replicas", &names)
            .finish()
    }
}

/// Shared slot holding the current view.
///
/// Operations take one snapshot with [`current`](Self::current) and keep it
/// for their whole run.
#[derive(Clone)]
pub struct ViewHandle {
    current: Arc<RwLock<Arc<ChainView>>>,
}

impl ViewHandle {
    pub fn new(view: ChainView) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(view))),
        }
    }

    pub fn current(&self) -> Arc<ChainView> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replaces the current view. `view` must carry a larger `view_id`.
    pub fn install(&self, view: ChainView) -> Result<()> {
        let mut slot = self.current.write().unwrap_or_else(|e| e.into_inner());
        ensure!(
            view.view_id() > slot.view_id(),
            "view {} does not supersede current view {}",
            view.view_id(),
            slot.view_id()
        );
        *slot = Arc::new(view);
        Ok(())
    }
}
