//! Server session table.
//!
//! Maps request-scoped keys to open local resources (an open shard path,
//! or a positioned directory listing) so `WS`-suffixed opcodes can keep
//! state across requests on the same channel. Thread-safe under a single
//! mutex: contention is low because one channel is serviced by one task.
//!
//! Sessions are modeled as an arena indexed by a generation-tagged handle
//! (the design notes flag the cyclic-ownership hazard of a naive
//! channel-owned-pointer table; tagging removes the dangling-reference
//! class of bug entirely since a stale handle just misses the lookup).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::localfs::DirEntry;

/// Opaque handle returned by [`SessionTable::open_file`] /
/// [`SessionTable::open_dir`]. Carries a generation counter so a handle
/// from a closed/reused slot never aliases a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    slot: u64,
    generation: u64,
}

impl SessionHandle {
    /// Encodes the handle as the `i64` carried on the wire.
    pub fn to_wire(self) -> i64 {
        ((self.generation as i64) << 32) | (self.slot as i64 & 0xFFFF_FFFF)
    }

    pub fn from_wire(value: i64) -> Self {
        Self { slot: (value & 0xFFFF_FFFF) as u64, generation: ((value >> 32) & 0xFFFF_FFFF) as u64 }
    }
}

enum Slot {
    Free,
    File { path: PathBuf, connection: u64, generation: u64 },
    Dir { path: PathBuf, entries: Vec<DirEntry>, position: usize, connection: u64, generation: u64 },
}

/// Thread-safe table of open session-mode resources.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<SessionTableInner>,
}

#[derive(Default)]
struct SessionTableInner {
    slots: Vec<Slot>,
    free_list: Vec<usize>,
    next_generation: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open file path under `connection`, returning the
    /// handle future requests on the same channel must present.
    pub fn open_file(&self, connection: u64, path: PathBuf) -> SessionHandle {
        let mut inner = self.inner.lock().unwrap();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let slot_entry = Slot::File { path, connection, generation };
        let slot = if let Some(idx) = inner.free_list.pop() {
            inner.slots[idx] = slot_entry;
            idx
        } else {
            inner.slots.push(slot_entry);
            inner.slots.len() - 1
        };
        SessionHandle { slot: slot as u64, generation }
    }

    /// Registers a positioned directory listing, returning its handle.
    pub fn open_dir(&self, connection: u64, path: PathBuf, entries: Vec<DirEntry>) -> SessionHandle {
        let mut inner = self.inner.lock().unwrap();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let slot_entry = Slot::Dir { path, entries, position: 0, connection, generation };
        let slot = if let Some(idx) = inner.free_list.pop() {
            inner.slots[idx] = slot_entry;
            idx
        } else {
            inner.slots.push(slot_entry);
            inner.slots.len() - 1
        };
        SessionHandle { slot: slot as u64, generation }
    }

    pub fn file_path(&self, handle: SessionHandle) -> Option<PathBuf> {
        let inner = self.inner.lock().unwrap();
        match inner.slots.get(handle.slot as usize) {
            Some(Slot::File { path, generation, .. }) if *generation == handle.generation => {
                Some(path.clone())
            }
            _ => None,
        }
    }

    /// Returns up to `max` directory entries starting at the handle's
    /// current cursor, advancing the cursor, and reporting whether the
    /// listing is now exhausted.
    pub fn read_dir_page(&self, handle: SessionHandle, max: usize) -> Option<(Vec<DirEntry>, bool)> {
        let mut inner = self.inner.lock().unwrap();
        match inner.slots.get_mut(handle.slot as usize) {
            Some(Slot::Dir { entries, position, generation, .. }) if *generation == handle.generation => {
                let end = (*position + max).min(entries.len());
                let page = entries[*position..end].to_vec();
                *position = end;
                Some((page, end >= entries.len()))
            }
            _ => None,
        }
    }

    /// Closes `handle`, freeing its slot for reuse. Returns `false` if the
    /// handle was already closed or never existed.
    pub fn close(&self, handle: SessionHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.slots.get(handle.slot as usize) {
            Some(Slot::File { generation, .. }) | Some(Slot::Dir { generation, .. })
                if *generation == handle.generation =>
            {
                inner.slots[handle.slot as usize] = Slot::Free;
                inner.free_list.push(handle.slot as usize);
                true
            }
            _ => false,
        }
    }

    /// Releases every entry opened by `connection`. Called on channel
    /// teardown so a crashed/disconnected client cannot leak session slots.
    pub fn close_connection(&self, connection: u64) {
        let mut inner = self.inner.lock().unwrap();
        let mut to_free = Vec::new();
        for (idx, slot) in inner.slots.iter().enumerate() {
            let owner = match slot {
                Slot::File { connection: c, .. } | Slot::Dir { connection: c, .. } => Some(*c),
                Slot::Free => None,
            };
            if owner == Some(connection) {
                to_free.push(idx);
            }
        }
        for idx in to_free {
            inner.slots[idx] = Slot::Free;
            inner.free_list.push(idx);
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.len() - inner.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
