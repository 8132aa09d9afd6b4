//! Client file-handle registry: process-wide table mapping opaque
//! descriptors to [`XpnFile`] objects.
//!
//! Grounded in the reference implementation's `xpn_file_table`: smallest
//! unused non-negative descriptor first (a free-list populated on
//! `remove`, falling back to a monotonically increasing counter), O(1)
//! remove, `dup`/`dup2` semantics, and a `reinit_vfhs` hook for elastic
//! membership changes.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::config::PartitionConfig;
use crate::file::XpnFile;

/// Outcome of [`FileTable::dup`]: the descriptor now bound to the
/// duplicated file, plus the file that was bound to that descriptor
/// before the call if this was its last live reference. The caller must
/// release `released`'s subhandles/sessions, matching dup2's
/// close-then-reuse semantics.
pub struct DupResult {
    pub fd: i32,
    pub released: Option<XpnFile>,
}

/// Thread-safe table of open file descriptors. A single mutex guards
/// insert/remove/dup/lookup; operations are short map accesses.
#[derive(Default)]
pub struct FileTable {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    files: HashMap<i32, XpnFile>,
    free_keys: Vec<i32>,
    sequential_key: i32,
}

impl Inner {
    fn new() -> Self {
        Self { files: HashMap::new(), free_keys: Vec::new(), sequential_key: 1 }
    }
}

impl FileTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::new()) }
    }

    /// Inserts `file`, returning the smallest unused non-negative
    /// descriptor: a free key if one is available, otherwise the next
    /// unused value of a monotonically increasing counter.
    pub fn insert(&self, file: XpnFile) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let fd = if let Some(fd) = inner.free_keys.pop() {
            fd
        } else {
            while inner.files.contains_key(&inner.sequential_key) {
                inner.sequential_key += 1;
            }
            inner.sequential_key
        };
        inner.files.insert(fd, file);
        fd
    }

    /// Removes `fd`, returning `true` if it was present. The descriptor is
    /// pushed onto the free list for reuse by a later `insert`.
    pub fn remove(&self, fd: i32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.files.remove(&fd).is_some() {
            inner.free_keys.push(fd);
            true
        } else {
            false
        }
    }

    /// `posix dup`/`dup2`-style duplication. Increments the file's
    /// refcount; if `new_fd >= 0` and it is already open, it is replaced
    /// (dup2 semantics) — its refcount is decremented, and if that drops
    /// it to zero, it is returned via [`DupResult::released`] so the
    /// caller can close its underlying sessions before reusing the
    /// descriptor. If `new_fd < 0`, a fresh descriptor is allocated via
    /// [`Self::insert`] semantics but shares the same underlying file.
    pub fn dup(&self, fd: i32, new_fd: i32) -> Option<DupResult> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.files.get(&fd)?.clone();
        file.refcount.fetch_add(1, Ordering::SeqCst);

        if new_fd >= 0 {
            let mut released = None;
            if new_fd != fd {
                if let Some(old) = inner.files.remove(&new_fd) {
                    if old.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
                        released = Some(old);
                    }
                }
            }
            inner.free_keys.retain(|&k| k != new_fd);
            inner.files.insert(new_fd, file);
            Some(DupResult { fd: new_fd, released })
        } else {
            let fd = if let Some(fd) = inner.free_keys.pop() {
                fd
            } else {
                while inner.files.contains_key(&inner.sequential_key) {
                    inner.sequential_key += 1;
                }
                inner.sequential_key
            };
            inner.files.insert(fd, file);
            Some(DupResult { fd, released: None })
        }
    }

    pub fn get(&self, fd: i32) -> Option<XpnFile> {
        let inner = self.inner.lock().unwrap();
        inner.files.get(&fd).cloned()
    }

    pub fn replace(&self, fd: i32, file: XpnFile) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.files.contains_key(&fd) {
            inner.files.insert(fd, file);
            true
        } else {
            false
        }
    }

    pub fn has(&self, fd: i32) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.files.contains_key(&fd)
    }

    /// Closes every open handle and resets keys to `1`, as if the process
    /// had just started.
    pub fn clean(&self) -> Vec<i32> {
        let mut inner = self.inner.lock().unwrap();
        let fds: Vec<i32> = inner.files.keys().copied().collect();
        inner.files.clear();
        inner.free_keys.clear();
        inner.sequential_key = 1;
        fds
    }

    /// Rebuilds every live file's subhandles against `partition`, as a
    /// server membership change requires. Only a single partition is
    /// supported per rebind, matching the reference implementation's
    /// current limitation.
    pub fn reinit_vfhs(&self, partition: &PartitionConfig) {
        let mut inner = self.inner.lock().unwrap();
        for file in inner.files.values_mut() {
            file.rebind(partition);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::MetadataHeader;

    fn dummy_file(path: &str) -> XpnFile {
        XpnFile {
            path: path.to_string(),
            partition: "default".into(),
            header: MetadataHeader::absent(),
            subhandles: Vec::new(),
            refcount: Arc::new(std::sync::atomic::AtomicU32::new(1)),
            flags: 0,
            mode: 0,
            dir_cursor: 0,
            dir_seen: std::collections::HashSet::new(),
            dir_entries: None,
        }
    }

    #[test]
    fn s3_registry_scenario_from_spec() {
        let table = FileTable::new();
        assert_eq!(table.insert(dummy_file("f1")), 1);
        assert_eq!(table.insert(dummy_file("f2")), 2);
        assert!(table.remove(1));
        assert_eq!(table.insert(dummy_file("f3")), 1);
        assert_eq!(table.dup(1, 10).map(|r| r.fd), Some(10));

        assert_eq!(table.get(1).unwrap().path, "f3");
        assert_eq!(table.get(2).unwrap().path, "f2");
        assert_eq!(table.get(10).unwrap().path, "f3");
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn handle_uniqueness_under_interleaved_operations() {
        let table = FileTable::new();
        let mut live = std::collections::HashSet::new();

        let fd1 = table.insert(dummy_file("a"));
        assert!(live.insert(fd1));
        let fd2 = table.insert(dummy_file("b"));
        assert!(live.insert(fd2));

        table.remove(fd1);
        live.remove(&fd1);

        let fd3 = table.insert(dummy_file("c"));
        assert!(live.insert(fd3));
        assert_eq!(fd3, fd1, "freed descriptor should be reused before growing the counter");

        let dup_fd = table.dup(fd2, -1).unwrap().fd;
        assert!(live.insert(dup_fd), "dup must never collide with a live descriptor");
        assert_ne!(dup_fd, fd2);
        assert_ne!(dup_fd, fd3);
    }

    #[test]
    fn dup2_onto_an_open_fd_closes_it_first() {
        let table = FileTable::new();
        let a = table.insert(dummy_file("a"));
        let b = table.insert(dummy_file("b"));

        let result = table.dup(a, b).unwrap();
        assert_eq!(result.fd, b);
        assert_eq!(table.get(b).unwrap().path, "a");
        assert_eq!(table.len(), 2);

        let released = result.released.expect("b's only reference should be released");
        assert_eq!(released.path, "b");
        assert_eq!(released.refcount.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dup2_onto_a_still_referenced_fd_does_not_report_a_release() {
        let table = FileTable::new();
        let a = table.insert(dummy_file("a"));
        let b = table.insert(dummy_file("b"));
        // Another descriptor keeps "b" alive, so overwriting `b` must not
        // report it as releasable.
        table.dup(b, -1).unwrap();

        let result = table.dup(a, b).unwrap();
        assert!(result.released.is_none(), "b still has a live reference through its other descriptor");
    }

    #[test]
    fn clean_resets_sequential_allocation() {
        let table = FileTable::new();
        table.insert(dummy_file("a"));
        table.insert(dummy_file("b"));
        let closed = table.clean();
        assert_eq!(closed.len(), 2);
        assert!(table.is_empty());
        assert_eq!(table.insert(dummy_file("c")), 1);
    }
}
