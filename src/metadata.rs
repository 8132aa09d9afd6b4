//! Metadata header: the fixed-size record prepended to every data shard.
//!
//! Carries magic, layout version, block size, replica count, server count
//! at creation, master server index, and the logical file size. Only the
//! master shard's header is authoritative for `file_size`; the header is
//! written at offset 0 of the shard file so an `only_file_size` update can
//! be done in place without touching the rest of the layout.

use byteorder::{ByteOrder, LittleEndian};
use dashmap::DashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{XpnError, XpnResult};
use crate::localfs::LocalFs;

/// Build-time magic number. A mismatch means the header is absent or
/// corrupt, never a fatal error.
pub const MAGIC: u32 = 0x5850_4E31; // "XPN1"
/// Current on-disk layout version.
pub const VERSION: u32 = 1;

/// Size in bytes of the header every shard begins with. Payload data
/// starts at this offset. Chosen as one page so payload writes stay
/// page-aligned on the common case.
pub const HEADER_SIZE: u64 = 4096;

const MAGIC_OFF: usize = 0;
const VERSION_OFF: usize = 4;
const BLOCK_SIZE_OFF: usize = 8;
const REPLICA_COUNT_OFF: usize = 16;
const SERVER_COUNT_OFF: usize = 20;
const MASTER_OFF: usize = 24;
const FILE_SIZE_OFF: usize = 28;
const ENCODED_LEN: usize = FILE_SIZE_OFF + 8;

/// The metadata header carried by every shard of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    pub block_size: u64,
    pub replica_count: u32,
    pub server_count: u32,
    pub master: u32,
    pub file_size: u64,
}

impl MetadataHeader {
    /// A zero header: what [`read_mdata`] returns for an absent or
    /// corrupt header, and what a brand-new file starts with before its
    /// first size-extending write.
    pub fn absent() -> Self {
        Self { block_size: 0, replica_count: 0, server_count: 0, master: 0, file_size: 0 }
    }

    pub fn is_absent(&self) -> bool {
        *self == Self::absent()
    }

    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        LittleEndian::write_u32(&mut buf[MAGIC_OFF..], MAGIC);
        LittleEndian::write_u32(&mut buf[VERSION_OFF..], VERSION);
        LittleEndian::write_u64(&mut buf[BLOCK_SIZE_OFF..], self.block_size);
        LittleEndian::write_u32(&mut buf[REPLICA_COUNT_OFF..], self.replica_count);
        LittleEndian::write_u32(&mut buf[SERVER_COUNT_OFF..], self.server_count);
        LittleEndian::write_u32(&mut buf[MASTER_OFF..], self.master);
        LittleEndian::write_u64(&mut buf[FILE_SIZE_OFF..], self.file_size);
        buf
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ENCODED_LEN {
            return None;
        }
        let magic = LittleEndian::read_u32(&bytes[MAGIC_OFF..]);
        let version = LittleEndian::read_u32(&bytes[VERSION_OFF..]);
        if magic != MAGIC || version != VERSION {
            return None;
        }
        Some(Self {
            block_size: LittleEndian::read_u64(&bytes[BLOCK_SIZE_OFF..]),
            replica_count: LittleEndian::read_u32(&bytes[REPLICA_COUNT_OFF..]),
            server_count: LittleEndian::read_u32(&bytes[SERVER_COUNT_OFF..]),
            master: LittleEndian::read_u32(&bytes[MASTER_OFF..]),
            file_size: LittleEndian::read_u64(&bytes[FILE_SIZE_OFF..]),
        })
    }
}

/// Per-path mutexes guarding `only_file_size` read-compare-write updates
/// on the local path. Keyed by the shard path string; entries are cheap
/// and never removed, matching the teacher crate's preference for a
/// process-wide concurrent map (`dashmap`) over ad hoc locking.
static SIZE_LOCKS: once_lock::OnceLock<DashMap<String, Arc<Mutex<()>>>> = once_lock::OnceLock::new();

mod once_lock {
    pub use std::sync::OnceLock;
}

fn size_lock_for(path: &str) -> Arc<Mutex<()>> {
    let map = SIZE_LOCKS.get_or_init(DashMap::new);
    map.entry(path.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
}

/// Reads the metadata header from `path` on `fs`. Returns
/// [`MetadataHeader::absent`] if the magic/version does not match or if
/// `path` refers to a directory (directories carry no metadata: this is
/// success, not an error).
pub async fn read_mdata(fs: &dyn LocalFs, path: &Path) -> XpnResult<MetadataHeader> {
    match fs.stat(path).await {
        Ok(st) if st.is_dir => return Ok(MetadataHeader::absent()),
        Ok(_) => {}
        Err(XpnError::NotFound(_)) => return Ok(MetadataHeader::absent()),
        Err(e) => return Err(e),
    }

    let bytes = fs.read_at(path, 0, HEADER_SIZE as usize).await?;
    Ok(MetadataHeader::decode(&bytes).unwrap_or_else(MetadataHeader::absent))
}

/// Writes `header` to `path` on `fs`.
///
/// When `only_file_size` is set, performs a mutex-guarded read-compare-write
/// that advances `file_size` only if `header.file_size` is strictly
/// greater than the value currently stored, leaving every other field
/// untouched. Otherwise writes the whole header.
pub async fn write_mdata(
    fs: &dyn LocalFs,
    path: &Path,
    header: MetadataHeader,
    only_file_size: bool,
) -> XpnResult<()> {
    if !only_file_size {
        fs.write_at(path, 0, &header.encode()).await?;
        return Ok(());
    }

    let lock = size_lock_for(&path.to_string_lossy());
    let _guard = lock.lock().unwrap_or_else(|poison| poison.into_inner());

    let current = read_mdata(fs, path).await?;
    let merged = if current.is_absent() {
        header
    } else if header.file_size > current.file_size {
        MetadataHeader { file_size: header.file_size, ..current }
    } else {
        return Ok(());
    };

    fs.write_at(path, 0, &merged.encode()).await?;
    Ok(())
}
