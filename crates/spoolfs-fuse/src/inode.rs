//! Inode ↔ path mapping with kernel lookup-count tracking.
//!
//! The hierarchy is read-only, so an inode entry is just a path plus a
//! kind. `nlookup` follows the FUSE protocol: `lookup` and
//! `readdirplus`-style paths increment it, `readdir` does not, and the
//! entry is evicted only when `forget` brings the count to zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// What an inode refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    /// The mount root.
    Root,
    /// A directory below the root.
    Directory,
    /// A logical file.
    File,
}

/// One entry of the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Logical path relative to the mount root ("" for the root).
    pub path: String,
    /// Entry kind.
    pub kind: InodeKind,
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: String, kind: InodeKind, nlookup: u64) -> Self {
        Self {
            path,
            kind,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Current kernel lookup count.
    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe bidirectional inode table.
pub struct InodeTable {
    by_id: DashMap<u64, Arc<InodeEntry>>,
    by_path: DashMap<String, u64>,
    next_id: AtomicU64,
}

impl InodeTable {
    /// Table with the root pre-allocated at [`ROOT_INODE`].
    pub fn new() -> Self {
        let table = Self {
            by_id: DashMap::new(),
            by_path: DashMap::new(),
            next_id: AtomicU64::new(ROOT_INODE + 1),
        };
        table.by_id.insert(
            ROOT_INODE,
            Arc::new(InodeEntry::new(String::new(), InodeKind::Root, 1)),
        );
        table.by_path.insert(String::new(), ROOT_INODE);
        table
    }

    fn insert_new(&self, path: &str, kind: InodeKind, nlookup: u64) -> u64 {
        let ino = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.by_id.insert(
            ino,
            Arc::new(InodeEntry::new(path.to_string(), kind, nlookup)),
        );
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Inode for `path`, incrementing `nlookup` (use from `lookup`).
    pub fn get_or_insert(&self, path: &str, kind: InodeKind) -> u64 {
        if let Some(ino) = self.by_path.get(path).map(|e| *e) {
            if let Some(entry) = self.by_id.get(&ino) {
                entry.nlookup.fetch_add(1, Ordering::Relaxed);
                return ino;
            }
        }
        self.insert_new(path, kind, 1)
    }

    /// Inode for `path` without touching `nlookup` (use from `readdir`,
    /// which per the FUSE spec must not affect the count).
    pub fn get_or_insert_no_lookup_inc(&self, path: &str, kind: InodeKind) -> u64 {
        if let Some(ino) = self.by_path.get(path).map(|e| *e) {
            return ino;
        }
        self.insert_new(path, kind, 0)
    }

    /// Entry for an inode.
    pub fn get(&self, ino: u64) -> Option<Arc<InodeEntry>> {
        self.by_id.get(&ino).map(|e| Arc::clone(&e))
    }

    /// Inode mapped to a path, if any.
    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).map(|e| *e)
    }

    /// Decrement `nlookup` by `count`; evict at zero. Root is never
    /// evicted. Returns whether the inode was evicted.
    pub fn forget(&self, ino: u64, count: u64) -> bool {
        if ino == ROOT_INODE {
            return false;
        }
        let Some(entry) = self.get(ino) else {
            return false;
        };
        let prev = entry.nlookup.fetch_sub(count, Ordering::AcqRel);
        if prev > count {
            return false;
        }
        self.by_id.remove(&ino);
        self.by_path.remove(&entry.path);
        true
    }

    /// Number of live inodes (including the root).
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True when only the root remains.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_exists() {
        let table = InodeTable::new();
        let root = table.get(ROOT_INODE).unwrap();
        assert_eq!(root.kind, InodeKind::Root);
        assert_eq!(table.get_inode(""), Some(ROOT_INODE));
    }

    #[test]
    fn test_lookup_increments_nlookup() {
        let table = InodeTable::new();
        let ino = table.get_or_insert("movies/a.mkv", InodeKind::File);
        assert!(ino > ROOT_INODE);
        assert_eq!(table.get(ino).unwrap().nlookup(), 1);

        assert_eq!(table.get_or_insert("movies/a.mkv", InodeKind::File), ino);
        assert_eq!(table.get(ino).unwrap().nlookup(), 2);
    }

    #[test]
    fn test_readdir_does_not_increment() {
        let table = InodeTable::new();
        let ino = table.get_or_insert_no_lookup_inc("movies", InodeKind::Directory);
        assert_eq!(table.get(ino).unwrap().nlookup(), 0);
        assert_eq!(
            table.get_or_insert_no_lookup_inc("movies", InodeKind::Directory),
            ino
        );
        assert_eq!(table.get(ino).unwrap().nlookup(), 0);
    }

    #[test]
    fn test_forget_evicts_at_zero() {
        let table = InodeTable::new();
        let ino = table.get_or_insert("f", InodeKind::File);
        table.get_or_insert("f", InodeKind::File);

        assert!(!table.forget(ino, 1));
        assert!(table.get(ino).is_some());
        assert!(table.forget(ino, 1));
        assert!(table.get(ino).is_none());
        assert!(table.get_inode("f").is_none());
    }

    #[test]
    fn test_forget_root_is_noop() {
        let table = InodeTable::new();
        assert!(!table.forget(ROOT_INODE, 1));
        assert!(table.get(ROOT_INODE).is_some());
    }

    #[test]
    fn test_concurrent_inserts_unique() {
        use std::thread;
        let table = Arc::new(InodeTable::new());
        let mut joins = Vec::new();
        for i in 0..8 {
            let table = Arc::clone(&table);
            joins.push(thread::spawn(move || {
                table.get_or_insert(&format!("f{i}"), InodeKind::File)
            }));
        }
        let mut inos: Vec<u64> = joins.into_iter().map(|j| j.join().unwrap()).collect();
        inos.sort_unstable();
        inos.dedup();
        assert_eq!(inos.len(), 8);
        assert_eq!(table.len(), 9);
    }
}
