//! Arena of request records, guarded by the registry lock.
//!
//! Every record lives in a slot keyed by a [`RequestKey`]. A record is
//! discoverable by cancellation, teardown and event callbacks only while it
//! is tracked; untracked records belong to the thread that issued them.
//!
//! Lock order: the loop lock, when needed, is always taken before the
//! registry lock. Nothing in here touches the loop lock, and no record is
//! completed while the registry lock is held.

use super::request::{OutstandingRequest, RequestKind};
use crate::error::ErrorKind;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

const LOG_TARGET: &str = "r_chime::broker::registry";

pub type RequestKey = u64;

#[derive(Default)]
struct RegistryInner {
    next_key: RequestKey,
    slots: HashMap<RequestKey, OutstandingRequest>,
}

#[derive(Default)]
pub struct OutstandingRegistry {
    inner: Mutex<RegistryInner>,
}

impl OutstandingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an untracked record and returns its key.
    pub fn create(&self, mut record: OutstandingRequest) -> RequestKey {
        record.tracked = false;
        let mut inner = self.inner.lock();
        inner.next_key += 1;
        let key = inner.next_key;
        inner.slots.insert(key, record);
        key
    }

    /// Runs `f` on the record under the registry lock. `None` if it is gone.
    pub fn with<R>(&self, key: RequestKey, f: impl FnOnce(&mut OutstandingRequest) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.slots.get_mut(&key).map(f)
    }

    /// Links the record into the tracked set. `false` if it no longer exists.
    pub fn track(&self, key: RequestKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(&key) {
            Some(record) => {
                record.tracked = true;
                trace!(target: LOG_TARGET, "Tracking request {}", record.request_id);
                true
            }
            None => false,
        }
    }

    /// Removes the record whether tracked or not.
    pub fn take(&self, key: RequestKey) -> Option<OutstandingRequest> {
        let mut record = self.inner.lock().slots.remove(&key)?;
        record.tracked = false;
        Some(record)
    }

    /// Removes the record only if nobody else can see it yet.
    pub fn take_untracked(&self, key: RequestKey) -> Option<OutstandingRequest> {
        let mut inner = self.inner.lock();
        if inner.slots.get(&key).is_some_and(|r| r.tracked) {
            return None;
        }
        inner.slots.remove(&key)
    }

    pub fn remove_tracked(&self, key: RequestKey) -> Option<OutstandingRequest> {
        let mut inner = self.inner.lock();
        if !inner.slots.get(&key).is_some_and(|r| r.tracked) {
            return None;
        }
        let mut record = inner.slots.remove(&key)?;
        record.tracked = false;
        Some(record)
    }

    /// Unlinks every tracked record matching `predicate` in one critical section.
    pub fn remove_if(
        &self,
        mut predicate: impl FnMut(&OutstandingRequest) -> bool,
    ) -> Vec<OutstandingRequest> {
        let mut inner = self.inner.lock();
        let keys: Vec<RequestKey> = inner
            .slots
            .iter()
            .filter(|(_, r)| r.tracked && predicate(r))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| inner.slots.remove(&k))
            .map(|mut r| {
                r.tracked = false;
                r
            })
            .collect()
    }

    pub fn pop_tracked(&self) -> Option<OutstandingRequest> {
        let mut inner = self.inner.lock();
        let key = inner
            .slots
            .iter()
            .find(|(_, r)| r.tracked)
            .map(|(k, _)| *k)?;
        let mut record = inner.slots.remove(&key)?;
        record.tracked = false;
        Some(record)
    }

    /// Completes every tracked record with `outcome`, one at a time, each with
    /// the lock released. Returns how many were completed.
    pub fn drain_all(&self, outcome: Result<(), ErrorKind>) -> usize {
        let mut drained = 0;
        while let Some(record) = self.pop_tracked() {
            record.complete(outcome);
            drained += 1;
        }
        drained
    }

    /// Marks untracked sample triggers playing as `index` as already finished.
    pub fn note_removed(&self, index: u32) -> bool {
        let mut inner = self.inner.lock();
        let mut found = false;
        for record in inner.slots.values_mut() {
            if !record.tracked
                && record.kind == RequestKind::TriggerSample
                && record.server_object_id == Some(index)
            {
                record.early_finish = true;
                found = true;
            }
        }
        found
    }

    pub fn tracked_len(&self) -> usize {
        self.inner.lock().slots.values().filter(|r| r.tracked).count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
