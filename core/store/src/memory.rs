//! In-memory queue store for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use outbox_common::{ActionId, ActionType, DroppedAction, Error, PendingAction, Result};

use crate::store::{QueueStore, DEFAULT_DROP_HISTORY};

#[derive(Debug, Default)]
struct Inner {
    /// Actions by id, with the insertion sequence number.
    records: HashMap<ActionId, (u64, PendingAction)>,
    next_seq: u64,
    /// Recent drops, oldest first.
    dropped: VecDeque<DroppedAction>,
}

impl Inner {
    fn ordered(&self) -> Vec<(u64, PendingAction)> {
        let mut rows: Vec<_> = self.records.values().cloned().collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows
    }
}

/// In-memory queue store.
///
/// Useful for testing and for embedders that accept a non-durable queue.
/// All data is lost on drop.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    drop_history: usize,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            drop_history: DEFAULT_DROP_HISTORY,
        }
    }

    /// Keep at most `limit` drops.
    pub fn with_drop_history(mut self, limit: usize) -> Self {
        self.drop_history = limit;
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn add(&self, action: &PendingAction) -> Result<()> {
        let mut inner = self.write()?;
        if inner.records.contains_key(&action.id) {
            return Err(Error::AlreadyExists(format!("Action {} is already queued", action.id)));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(action.id.clone(), (seq, action.clone()));
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<PendingAction>> {
        Ok(self.read()?.records.values().map(|(_, a)| a.clone()).collect())
    }

    async fn get_all_by_priority(&self) -> Result<Vec<PendingAction>> {
        let mut rows = self.read()?.ordered();
        // Stable sort keeps insertion order within a band.
        rows.sort_by(|(_, a), (_, b)| b.priority.cmp(&a.priority));
        Ok(rows.into_iter().map(|(_, a)| a).collect())
    }

    async fn get_by_type(&self, action_type: ActionType) -> Result<Vec<PendingAction>> {
        Ok(self
            .read()?
            .ordered()
            .into_iter()
            .map(|(_, a)| a)
            .filter(|a| a.action_type == action_type)
            .collect())
    }

    async fn delete(&self, id: &ActionId) -> Result<()> {
        self.write()?.records.remove(id);
        Ok(())
    }

    async fn put(&self, action: &PendingAction) -> Result<()> {
        let mut inner = self.write()?;
        match inner.records.get_mut(&action.id) {
            Some((_, stored)) => {
                *stored = action.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("Action not queued: {}", action.id))),
        }
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.records.len())
    }

    async fn clear(&self) -> Result<()> {
        self.write()?.records.clear();
        Ok(())
    }

    async fn record_drop(&self, dropped: &DroppedAction) -> Result<()> {
        let mut inner = self.write()?;
        inner.records.remove(&dropped.id);
        if self.drop_history == 0 {
            return Ok(());
        }
        while inner.dropped.len() >= self.drop_history {
            inner.dropped.pop_front();
        }
        inner.dropped.push_back(dropped.clone());
        Ok(())
    }

    async fn recent_drops(&self) -> Result<Vec<DroppedAction>> {
        Ok(self.read()?.dropped.iter().cloned().collect())
    }

    async fn clear_drops(&self) -> Result<()> {
        self.write()?.dropped.clear();
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
