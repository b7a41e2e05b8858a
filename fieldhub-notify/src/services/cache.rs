use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::NotificationRecord;

/// What the badge counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BadgeMode {
    /// Entries not yet viewed.
    #[default]
    Unread,
    /// Every entry, viewed or not.
    Total,
}

/// Receiver of debounced batches.
pub trait BatchSink: Send + Sync + 'static {
    fn insert_many(&self, records: Vec<NotificationRecord>) -> usize;
}

/// Per-(viewer, purpose) ordered notification store, newest first.
///
/// Cheap to clone; clones share the same entries. Every mutation runs under
/// one write lock, so readers never see a half-applied batch.
#[derive(Clone, Default)]
pub struct NotificationCache {
    inner: Arc<RwLock<CacheState>>,
}

#[derive(Default)]
struct CacheState {
    entries: VecDeque<NotificationRecord>,
    ids: HashSet<Uuid>,
}

impl NotificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the state half-written:
    // every mutation below is a single push/flag flip per entry.
    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepend every record whose id is not cached yet; existing entries are
    /// never overwritten. Returns how many were inserted.
    pub fn insert_many(&self, records: Vec<NotificationRecord>) -> usize {
        let mut state = self.write();
        let mut inserted = 0;
        for record in records {
            if state.ids.insert(record.id) {
                state.entries.push_front(record);
                inserted += 1;
            }
        }
        inserted
    }

    /// Merge a newest-first page loaded from the store.
    ///
    /// Unknown ids go behind everything already cached; known ids only pick
    /// up `viewed = true` (read state never reverts).
    pub fn merge_durable(&self, records: Vec<NotificationRecord>) -> usize {
        let mut state = self.write();
        let mut appended = 0;
        for record in records {
            if state.ids.contains(&record.id) {
                if record.viewed {
                    if let Some(entry) = state.entries.iter_mut().find(|e| e.id == record.id) {
                        entry.viewed = true;
                    }
                }
            } else {
                state.ids.insert(record.id);
                state.entries.push_back(record);
                appended += 1;
            }
        }
        appended
    }

    /// Flag one entry as viewed. Returns `false` when the id is unknown.
    pub fn mark_read(&self, id: Uuid) -> bool {
        let mut state = self.write();
        match state.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.viewed = true;
                true
            }
            None => false,
        }
    }

    /// Flag every entry as viewed. Returns how many changed.
    pub fn mark_all_read(&self) -> usize {
        let mut state = self.write();
        let mut changed = 0;
        for entry in state.entries.iter_mut().filter(|e| !e.viewed) {
            entry.viewed = true;
            changed += 1;
        }
        changed
    }

    /// Read-only copy in display order.
    pub fn snapshot(&self) -> Vec<NotificationRecord> {
        self.read().entries.iter().cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<NotificationRecord> {
        self.read().entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn count(&self) -> usize {
        self.read().entries.len()
    }

    pub fn unread_count(&self) -> usize {
        self.read().entries.iter().filter(|e| !e.viewed).count()
    }

    pub fn badge_count(&self, mode: BadgeMode) -> usize {
        match mode {
            BadgeMode::Unread => self.unread_count(),
            BadgeMode::Total => self.count(),
        }
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.entries.clear();
        state.ids.clear();
    }
}

impl BatchSink for NotificationCache {
    fn insert_many(&self, records: Vec<NotificationRecord>) -> usize {
        NotificationCache::insert_many(self, records)
    }
}
