//! Per-file byte-range mutual exclusion (component A).
//!
//! Ranges are quantised to [`ALIGNMENT`] on insertion and stored in a
//! `BTreeSet` ordered so that `end <= other.offset`, which places
//! non-overlapping ranges in a total order and makes overlap detection a
//! single `range` query. Ported from `range-lock.h`'s `std::set<Range>`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

const ALIGNMENT: u64 = 512;

fn align_down(x: u64) -> u64 {
    (x / ALIGNMENT) * ALIGNMENT
}

/// Align `offset` down and `length` up so `[offset, offset+length)` covers
/// the 512-byte envelope of the original request.
fn align_range(offset: u64, length: u64) -> (u64, u64) {
    let end = offset + length + ALIGNMENT - 1;
    let aligned_offset = align_down(offset);
    let aligned_end = align_down(end);
    (aligned_offset, aligned_end - aligned_offset)
}

#[derive(Debug)]
struct Entry {
    offset: u64,
    length: u64,
    id: u64,
    notify: Arc<Notify>,
}

impl Entry {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Non-overlapping ranges compare by whichever lies first; equal
        // endpoints sort adjacent without overlapping (`end() <= rhs.offset`
        // in range-lock.h). Ties broken by id so distinct entries never
        // compare equal spuriously.
        if self.end() <= other.offset {
            std::cmp::Ordering::Less
        } else if other.end() <= self.offset {
            std::cmp::Ordering::Greater
        } else {
            self.id.cmp(&other.id)
        }
    }
}

/// A stable reference to a range this lock currently holds, naming the
/// aligned `[offset, offset+length)` span actually inserted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle {
    id: u64,
    pub offset: u64,
    pub length: u64,
}

pub enum TryLock {
    Acquired(Handle),
    /// The conflicting range and a future that resolves once it's released.
    Conflict(ConflictWaiter),
}

pub struct ConflictWaiter {
    notify: Arc<Notify>,
    pub conflicting_offset: u64,
    pub conflicting_length: u64,
}

impl ConflictWaiter {
    pub async fn wait(self) {
        self.notify.notified().await;
    }
}

/// Per-file range-lock coordinator. Serialises overlapping refills while
/// letting disjoint refills proceed in parallel.
pub struct RangeLock {
    index: Mutex<BTreeSet<Entry>>,
    next_id: AtomicU64,
}

impl Default for RangeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeLock {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(BTreeSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attempt to lock `[offset, offset+length)` (aligned to 512 bytes).
    /// Returns the conflicting range's wait handle without inserting if it
    /// overlaps an already-held range.
    pub fn try_lock(&self, offset: u64, length: u64) -> TryLock {
        let (aligned_offset, aligned_length) = align_range(offset, length);
        let probe = Entry {
            offset: aligned_offset,
            length: aligned_length,
            id: 0,
            notify: Arc::new(Notify::new()),
        };

        let mut index = self.index.lock().unwrap();
        if let Some(existing) = index.get(&probe) {
            return TryLock::Conflict(ConflictWaiter {
                notify: Arc::clone(&existing.notify),
                conflicting_offset: existing.offset,
                conflicting_length: existing.length,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Handle {
            id,
            offset: aligned_offset,
            length: aligned_length,
        };
        index.insert(Entry {
            offset: aligned_offset,
            length: aligned_length,
            id,
            notify: Arc::new(Notify::new()),
        });
        TryLock::Acquired(handle)
    }

    /// Loop acquiring `[offset, offset+length)`, waiting on conflicts and
    /// re-contending after every release (wake-all semantics, per
    /// `spec.md` §9's explicit choice over a fairer single-waiter handoff).
    pub async fn lock(&self, offset: u64, length: u64) -> Handle {
        loop {
            match self.try_lock(offset, length) {
                TryLock::Acquired(handle) => return handle,
                TryLock::Conflict(waiter) => waiter.wait().await,
            }
        }
    }

    /// Remove the range named by `handle`, waking all waiters on it.
    pub fn unlock(&self, handle: Handle) {
        let mut index = self.index.lock().unwrap();
        let probe = Entry {
            offset: handle.offset,
            length: handle.length,
            id: handle.id,
            notify: Arc::new(Notify::new()),
        };
        if let Some(entry) = index.take(&probe) {
            entry.notify.notify_waiters();
        }
    }

    /// Shrink or grow the locked range in place, provided the new range
    /// does not overlap a neighbour. Returns `false` ("Denied") otherwise.
    pub fn adjust(&self, handle: &mut Handle, new_offset: u64, new_length: u64) -> bool {
        let (aligned_offset, aligned_length) = align_range(new_offset, new_length);
        let mut index = self.index.lock().unwrap();

        let probe = Entry {
            offset: handle.offset,
            length: handle.length,
            id: handle.id,
            notify: Arc::new(Notify::new()),
        };
        let Some(mut entry) = index.take(&probe) else {
            return false;
        };

        let candidate = Entry {
            offset: aligned_offset,
            length: aligned_length,
            id: handle.id,
            notify: Arc::clone(&entry.notify),
        };
        let conflicts = index
            .range(..)
            .any(|other| other.id != handle.id && !(candidate.end() <= other.offset || other.end() <= candidate.offset));
        if conflicts {
            index.insert(entry);
            return false;
        }

        entry.offset = aligned_offset;
        entry.length = aligned_length;
        index.insert(entry);
        handle.offset = aligned_offset;
        handle.length = aligned_length;
        true
    }

    #[cfg(test)]
    pub(crate) fn locked_ranges(&self) -> Vec<(u64, u64)> {
        self.index
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.offset, e.length))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn disjoint_ranges_both_acquire() {
        let lock = RangeLock::new();
        let a = lock.try_lock(0, 512);
        let b = lock.try_lock(4096, 512);
        assert!(matches!(a, TryLock::Acquired(_)));
        assert!(matches!(b, TryLock::Acquired(_)));
    }

    #[tokio::test]
    async fn overlapping_range_conflicts() {
        let lock = RangeLock::new();
        let TryLock::Acquired(h) = lock.try_lock(0, 1024) else {
            panic!("expected acquired")
        };
        match lock.try_lock(512, 512) {
            TryLock::Conflict(w) => {
                assert_eq!(w.conflicting_offset, h.offset);
            }
            TryLock::Acquired(_) => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn unlock_wakes_waiters() {
        let lock = StdArc::new(RangeLock::new());
        let h = lock.lock(0, 512).await;

        let lock2 = StdArc::clone(&lock);
        let waiter = tokio::spawn(async move {
            lock2.lock(0, 512).await;
        });

        // give the waiter a chance to register
        tokio::task::yield_now().await;
        lock.unlock(h);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn adjust_denied_on_overlap() {
        let lock = RangeLock::new();
        let TryLock::Acquired(mut h) = lock.try_lock(0, 512) else {
            panic!()
        };
        let TryLock::Acquired(_h2) = lock.try_lock(1024, 512) else {
            panic!()
        };
        // growing into the second range must be denied
        assert!(!lock.adjust(&mut h, 0, 1536));
        // shrinking is fine
        assert!(lock.adjust(&mut h, 0, 256));
    }

    #[tokio::test]
    async fn alignment_envelope() {
        let lock = RangeLock::new();
        let TryLock::Acquired(h) = lock.try_lock(100, 50) else {
            panic!()
        };
        assert_eq!(h.offset, 0);
        assert_eq!(h.length, 512);
    }
}
