//! POSIX-style advisory byte-range locks.
//!
//! Locks are kept per canonical path, so two descriptors opened on the same
//! file through different paths still see each other. This table covers the
//! descriptors of one environment; [`HostFileSystem::set_lock`] mirrors every
//! granted range to the host through [`os_lock`](super::os_lock) so other
//! environments and processes see it too.
//!
//! [`HostFileSystem::set_lock`]: super::HostFileSystem::set_lock

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sqlite_wasm_core::Fd;

/// Shared or exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// `F_RDLCK`.
    Shared,
    /// `F_WRLCK`.
    Exclusive,
}

/// One held byte range, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    /// Descriptor holding the lock.
    pub owner: Fd,
    /// First byte.
    pub start: u64,
    /// One past the last byte; `u64::MAX` extends to end of file.
    pub end: u64,
    /// Lock type.
    pub lock_type: LockType,
}

impl LockRecord {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    fn conflicts_with(&self, owner: Fd, start: u64, end: u64, lock_type: LockType) -> bool {
        self.owner != owner
            && self.overlaps(start, end)
            && (self.lock_type == LockType::Exclusive || lock_type == LockType::Exclusive)
    }
}

/// Convert `l_start` and `l_len` (already made absolute) to a half-open range.
///
/// A zero length extends to end of file; a negative length covers the bytes
/// before `start`. Returns `None` if the range starts before byte 0.
pub fn lock_range(start: i64, len: i64) -> Option<(u64, u64)> {
    let (start, end) = match len {
        0 => (start, None),
        len if len > 0 => (start, start.checked_add(len)),
        len => (start.checked_add(len)?, Some(start)),
    };
    let start = u64::try_from(start).ok()?;
    let end = match end {
        Some(end) => u64::try_from(end).ok()?,
        None => u64::MAX,
    };
    Some((start, end))
}

fn take_overlapping(records: &mut Vec<LockRecord>, owner: Fd, start: u64, end: u64) -> Vec<LockRecord> {
    let (taken, kept) = records
        .drain(..)
        .partition(|r| r.owner == owner && r.overlaps(start, end));
    *records = kept;
    taken
}

/// Parts of `record` outside `[start, end)`.
pub fn outside(record: &LockRecord, start: u64, end: u64) -> impl Iterator<Item = (u64, u64)> {
    let before = (record.start < start).then_some((record.start, start));
    let after = (record.end > end).then_some((end, record.end));
    before.into_iter().chain(after)
}

/// Lock state for every file of one environment.
#[derive(Debug, Default)]
pub struct LockManager {
    files: Mutex<HashMap<PathBuf, Vec<LockRecord>>>,
}

impl LockManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// First lock held by another descriptor that would block the request.
    pub fn conflicting(
        &self,
        path: &Path,
        owner: Fd,
        start: u64,
        end: u64,
        lock_type: LockType,
    ) -> Option<LockRecord> {
        let files = self.files.lock();
        files
            .get(path)?
            .iter()
            .find(|r| r.conflicts_with(owner, start, end, lock_type))
            .copied()
    }

    /// Take a lock, replacing the owner's overlapping locks.
    ///
    /// Returns the owner's records that were replaced, or the conflicting
    /// record if another descriptor holds an incompatible lock; nothing
    /// changes in that case.
    pub fn lock(
        &self,
        path: &Path,
        owner: Fd,
        start: u64,
        end: u64,
        lock_type: LockType,
    ) -> Result<Vec<LockRecord>, LockRecord> {
        let mut files = self.files.lock();
        let records = files.entry(path.to_path_buf()).or_default();
        if let Some(conflict) = records
            .iter()
            .find(|r| r.conflicts_with(owner, start, end, lock_type))
        {
            return Err(*conflict);
        }
        let replaced = take_overlapping(records, owner, start, end);
        records.push(LockRecord {
            owner,
            start,
            end,
            lock_type,
        });
        Ok(replaced)
    }

    /// Drop the owner's locks overlapping `[start, end)` and return them.
    pub fn unlock(&self, path: &Path, owner: Fd, start: u64, end: u64) -> Vec<LockRecord> {
        let mut files = self.files.lock();
        let Some(records) = files.get_mut(path) else {
            return Vec::new();
        };
        let removed = take_overlapping(records, owner, start, end);
        if records.is_empty() {
            files.remove(path);
        }
        removed
    }

    /// Drop every lock held by `owner` on `path`.
    pub fn release_all(&self, path: &Path, owner: Fd) {
        self.unlock(path, owner, 0, u64::MAX);
    }

    /// Locks currently held on `path`.
    pub fn held(&self, path: &Path) -> Vec<LockRecord> {
        self.files.lock().get(path).cloned().unwrap_or_default()
    }

    /// Drop all locks.
    pub fn clear(&self) {
        self.files.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Fd = Fd(4);
    const B: Fd = Fd(5);

    fn path() -> PathBuf {
        PathBuf::from("/data/main.db")
    }

    #[test]
    fn test_relock_replaces_overlapping() {
        let locks = LockManager::new();
        locks.lock(&path(), A, 0, 10, LockType::Shared).unwrap();
        locks.lock(&path(), A, 5, 15, LockType::Shared).unwrap();

        let held = locks.held(&path());
        assert_eq!(held.len(), 1);
        assert_eq!((held[0].start, held[0].end), (5, 15));

        locks.unlock(&path(), A, 0, 20);
        assert!(locks.held(&path()).is_empty());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let locks = LockManager::new();
        locks.lock(&path(), A, 0, 100, LockType::Shared).unwrap();
        locks.lock(&path(), B, 50, 150, LockType::Shared).unwrap();

        assert_eq!(locks.held(&path()).len(), 2);
        assert!(locks.conflicting(&path(), B, 0, 10, LockType::Shared).is_none());
    }

    #[test]
    fn test_exclusive_conflicts() {
        let locks = LockManager::new();
        locks.lock(&path(), A, 0, 100, LockType::Shared).unwrap();

        let conflict = locks.lock(&path(), B, 99, 200, LockType::Exclusive).unwrap_err();
        assert_eq!(conflict.owner, A);
        assert_eq!(locks.held(&path()).len(), 1);

        // Adjacent ranges do not overlap.
        locks.lock(&path(), B, 100, 200, LockType::Exclusive).unwrap();
    }

    #[test]
    fn test_partial_overlap_with_exclusive() {
        let locks = LockManager::new();
        locks.lock(&path(), A, 0, 10, LockType::Exclusive).unwrap();

        let conflict = locks.lock(&path(), B, 5, 15, LockType::Shared).unwrap_err();
        assert_eq!((conflict.owner, conflict.start, conflict.end), (A, 0, 10));
        let conflict = locks.lock(&path(), B, 9, u64::MAX, LockType::Exclusive).unwrap_err();
        assert_eq!(conflict.owner, A);
        assert_eq!(locks.held(&path()).len(), 1);

        locks.lock(&path(), B, 10, 15, LockType::Shared).unwrap();
        assert_eq!(locks.held(&path()).len(), 2);
    }

    #[test]
    fn test_refused_upgrade_keeps_shared_lock() {
        let locks = LockManager::new();
        locks.lock(&path(), A, 0, 10, LockType::Shared).unwrap();
        locks.lock(&path(), B, 0, 10, LockType::Shared).unwrap();

        let conflict = locks.lock(&path(), A, 0, 10, LockType::Exclusive).unwrap_err();
        assert_eq!(conflict.owner, B);

        let mut held = locks.held(&path());
        held.sort_by_key(|record| record.owner.0);
        assert_eq!(held.len(), 2);
        assert_eq!((held[0].owner, held[0].lock_type), (A, LockType::Shared));
        assert!(locks.conflicting(&path(), B, 0, 10, LockType::Exclusive).is_some());
    }

    #[test]
    fn test_owner_may_upgrade_its_own_lock() {
        let locks = LockManager::new();
        locks.lock(&path(), A, 0, 10, LockType::Shared).unwrap();
        locks.lock(&path(), A, 0, 10, LockType::Exclusive).unwrap();

        let held = locks.held(&path());
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].lock_type, LockType::Exclusive);
    }

    #[test]
    fn test_release_all_on_close() {
        let locks = LockManager::new();
        locks.lock(&path(), A, 0, 10, LockType::Shared).unwrap();
        locks.lock(&path(), A, 20, 30, LockType::Exclusive).unwrap();
        locks.lock(&path(), B, 40, 50, LockType::Shared).unwrap();

        locks.release_all(&path(), A);

        let held = locks.held(&path());
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].owner, B);
    }

    #[test]
    fn test_lock_range() {
        assert_eq!(lock_range(10, 0), Some((10, u64::MAX)));
        assert_eq!(lock_range(10, 5), Some((10, 15)));
        assert_eq!(lock_range(10, -4), Some((6, 10)));
        assert_eq!(lock_range(2, -4), None);
        assert_eq!(lock_range(-1, 1), None);
    }
}
