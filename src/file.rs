//! Open file handle (`XpnFile`) and its per-shard subhandles.

use std::collections::HashSet;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::config::PartitionConfig;
use crate::metadata::MetadataHeader;

/// Binds one open logical file to one shard on one server.
#[derive(Debug, Clone)]
pub struct Subhandle {
    pub server: u32,
    pub local_path: String,
    /// Session-mode handle returned by `OPEN_WS`/`CREAT_WS`, if the
    /// partition's `session.file` switch is enabled for this server.
    pub session_handle: Option<i64>,
}

/// A client-side open file: logical path, cached metadata header, and one
/// subhandle per server in the owning partition (any server may hold a
/// block of the file under round-robin striping).
#[derive(Debug, Clone)]
pub struct XpnFile {
    pub path: String,
    pub partition: String,
    pub header: MetadataHeader,
    pub subhandles: Vec<Subhandle>,
    /// Shared between every descriptor produced by `dup`/`dup2` for this
    /// file, so closing one duplicate only drops the underlying session
    /// once every reference is gone — `Arc` sharing makes this automatic
    /// across `Clone`, unlike a plain counter copied into each clone.
    pub refcount: Arc<AtomicU32>,
    pub flags: i32,
    pub mode: u32,
    /// Index of the next server `readdir` should query, for directory
    /// descriptors only: every server is listed in partition order,
    /// dedupe'd against `dir_seen`, matching a directory's entries being
    /// present on more than one server.
    pub dir_cursor: usize,
    pub dir_seen: HashSet<String>,
    /// Fully pre-fetched, deduped directory listing, used instead of
    /// `subhandles`/`dir_cursor` when the partition's `session_dir`
    /// switch is off: every server is opened, drained, and closed up
    /// front at `opendir` time rather than keeping a listing handle open
    /// across each `readdir` call.
    pub dir_entries: Option<Vec<String>>,
}

impl XpnFile {
    /// Builds the per-shard subhandle set for `path` against `partition`.
    /// Local paths are the file's logical path unchanged — striping is
    /// expressed through byte offsets within that path on each server, not
    /// through distinct per-server filenames.
    pub fn new(path: String, partition: &PartitionConfig, header: MetadataHeader, flags: i32, mode: u32) -> Self {
        let subhandles = (0..partition.server_count())
            .map(|server| Subhandle { server, local_path: path.clone(), session_handle: None })
            .collect();
        Self {
            path,
            partition: partition.name.clone(),
            header,
            subhandles,
            refcount: Arc::new(AtomicU32::new(1)),
            flags,
            mode,
            dir_cursor: 0,
            dir_seen: HashSet::new(),
            dir_entries: None,
        }
    }

    /// Rebuilds subhandles against a new partition membership, releasing
    /// the old set. Used by [`crate::registry::FileTable::reinit_vfhs`]
    /// after an `expand`/`shrink`.
    pub fn rebind(&mut self, partition: &PartitionConfig) {
        self.subhandles = (0..partition.server_count())
            .map(|server| Subhandle { server, local_path: self.path.clone(), session_handle: None })
            .collect();
        self.partition = partition.name.clone();
    }
}
