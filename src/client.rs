//! Client API: orchestrates shard fan-out across a partition's servers
//! behind a POSIX-shaped surface (`open`/`read`/`write`/`close`/...).
//!
//! Grounded in the reference implementation's `xpn_api` layer: every call
//! hashes or looks up the file's master server, computes the striping
//! layout via [`crate::policy::distribute`], fans the resulting fragments
//! out across the partition's [`Nfi`] stubs through a [`WorkerPool`], and
//! folds per-shard results back into one POSIX-style return value.

use std::sync::Arc;

use crate::config::PartitionConfig;
use crate::error::{XpnError, XpnResult};
use crate::file::{Subhandle, XpnFile};
use crate::hash;
use crate::localfs::{FileStat, VfsStat};
use crate::metadata::{self, MetadataHeader};
use crate::nfi::Nfi;
use crate::policy::{self, DistributionParams, Fragment};
use crate::registry::FileTable;
use crate::wire::FileRef;
use crate::workers::WorkerPool;

/// `open`/`creat` flag bit requesting creation if the path does not
/// already exist, matching the POSIX `O_CREAT` value on Linux.
pub const O_CREAT: i32 = 0o100;

/// A client bound to one partition: its server list, its open-file
/// registry, and the worker pool used to fan reads and writes out across
/// shards.
pub struct XpnClient {
    partition: PartitionConfig,
    nfis: Vec<Arc<dyn Nfi>>,
    files: FileTable,
    pool: Box<dyn WorkerPool>,
}

impl XpnClient {
    pub fn new(partition: PartitionConfig, nfis: Vec<Arc<dyn Nfi>>, pool: Box<dyn WorkerPool>) -> XpnResult<Self> {
        partition.validate()?;
        if nfis.len() != partition.server_count() as usize {
            return Err(XpnError::InvalidArgument(format!(
                "partition {} expects {} servers, got {}",
                partition.name,
                partition.server_count(),
                nfis.len()
            )));
        }
        Ok(Self { partition, nfis, files: FileTable::new(), pool })
    }

    /// Exposes the client's open-file registry so a
    /// [`crate::membership::MembershipController`] can register it for
    /// rebinding after an `expand`/`shrink`.
    pub fn file_table(&self) -> &FileTable {
        &self.files
    }

    fn distribution_params(&self, header: &MetadataHeader) -> DistributionParams {
        DistributionParams {
            block_size: header.block_size,
            server_count: self.partition.server_count(),
            master: header.master,
            replica_count: header.replica_count,
            header_size: metadata::HEADER_SIZE,
        }
    }

    /// Opens (or, with [`O_CREAT`] set in `flags`, creates) `path` on
    /// every server in the partition, returning a client-local descriptor.
    ///
    /// When the partition's `session_file` switch is off, every server is
    /// still visited with the `_WOS` opcode (to validate/create the path
    /// up front), but no session handle is retained: later `read`/`write`
    /// calls address the shard by path instead, per [`Subhandle`].
    pub async fn open(&self, path: &str, flags: i32, mode: u32) -> XpnResult<i32> {
        let master = hash::hash(path, self.partition.server_count(), true);
        let create = flags & O_CREAT != 0;
        let sessioned = self.partition.session_file;

        let mut subhandles = Vec::with_capacity(self.nfis.len());
        for (server, nfi) in self.nfis.iter().enumerate() {
            let handle = if create { nfi.creat(path, mode, sessioned).await? } else { nfi.open(path, flags, sessioned).await? };
            let session_handle = if sessioned { Some(handle) } else { None };
            subhandles.push(Subhandle { server: server as u32, local_path: path.to_string(), session_handle });
        }

        let file_size = if create { 0 } else { self.nfis[master as usize].getattr(path).await?.size };

        let header = MetadataHeader {
            block_size: self.partition.block_size,
            replica_count: self.partition.replica_count,
            server_count: self.partition.server_count(),
            master,
            file_size,
        };

        let mut file = XpnFile::new(path.to_string(), &self.partition, header, flags, mode as u32);
        file.subhandles = subhandles;
        Ok(self.files.insert(file))
    }

    /// Closes `fd`, releasing every subhandle once every descriptor
    /// sharing its refcount (via [`Self::dup`]) has closed.
    pub async fn close(&self, fd: i32) -> XpnResult<()> {
        let file = self.files.get(fd).ok_or_else(|| XpnError::InvalidArgument("bad descriptor".into()))?;
        self.files.remove(fd);
        if file.refcount.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) > 1 {
            return Ok(());
        }
        for subhandle in &file.subhandles {
            if let Some(handle) = subhandle.session_handle {
                self.nfis[subhandle.server as usize].close(handle).await?;
            }
        }
        Ok(())
    }

    /// `posix dup`/`dup2` — see [`FileTable::dup`]. If `new_fd` was
    /// already open and this was its last live reference, its subhandles
    /// are closed here before the new binding takes effect, matching
    /// dup2's close-then-reuse semantics.
    pub async fn dup(&self, fd: i32, new_fd: i32) -> XpnResult<i32> {
        let result = self.files.dup(fd, new_fd).ok_or_else(|| XpnError::InvalidArgument("bad descriptor".into()))?;
        if let Some(released) = result.released {
            for subhandle in &released.subhandles {
                if let Some(handle) = subhandle.session_handle {
                    self.nfis[subhandle.server as usize].close(handle).await?;
                }
            }
        }
        Ok(result.fd)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, fanning the
    /// request out across every server the range stripes over and
    /// reassembling the result with [`policy::assemble`]. Returns the
    /// number of bytes actually placed into `buf` (short on EOF).
    pub async fn read(&self, fd: i32, buf: &mut [u8], offset: u64) -> XpnResult<usize> {
        let file = self.files.get(fd).ok_or_else(|| XpnError::InvalidArgument("bad descriptor".into()))?;
        if file.header.is_absent() || buf.is_empty() {
            return Ok(0);
        }
        let params = self.distribution_params(&file.header);
        let fragments: Vec<Fragment> =
            policy::distribute(offset, buf.len() as u64, params).into_iter().filter(|f| f.replica == 0).collect();

        let tasks = self.prepare_fragments(&file, fragments)?.into_iter().map(|(frag, nfi, file_ref)| async move {
            nfi.read(file_ref, frag.local_offset, frag.length as u32).await.map(|data| (frag, data))
        });
        let results: Vec<(Fragment, Vec<u8>)> =
            futures::future::try_join_all(tasks).await?;

        Ok(policy::assemble(buf, offset, &results))
    }

    /// Writes `data` starting at `offset`, fanning the primary and every
    /// replica copy out across their respective servers, then advances
    /// the file's logical size via `WRITE_MDATA_FILE_SIZE` on the master.
    pub async fn write(&self, fd: i32, data: &[u8], offset: u64) -> XpnResult<usize> {
        let file = self.files.get(fd).ok_or_else(|| XpnError::InvalidArgument("bad descriptor".into()))?;
        if data.is_empty() {
            return Ok(0);
        }

        let header = if file.header.is_absent() {
            MetadataHeader {
                block_size: self.partition.block_size,
                replica_count: self.partition.replica_count,
                server_count: self.partition.server_count(),
                master: hash::hash(&file.path, self.partition.server_count(), true),
                file_size: 0,
            }
        } else {
            file.header
        };
        let params = self.distribution_params(&header);
        let fragments = policy::distribute(offset, data.len() as u64, params);

        let mut handles = Vec::with_capacity(fragments.len());
        for (frag, nfi, file_ref) in self.prepare_fragments(&file, fragments)? {
            let start = (frag.logical_offset - offset) as usize;
            let chunk = data[start..start + frag.length as usize].to_vec();
            let task: crate::workers::BoxedTask = Box::pin(async move {
                nfi.write(file_ref, frag.local_offset, &chunk).await.map(|n| n as i32)
            });
            handles.push(self.pool.launch(task).await);
        }
        for handle in handles {
            handle.await.map_err(|e| XpnError::Fatal(e.to_string()))??;
        }

        let new_size = header.file_size.max(offset + data.len() as u64);
        self.nfis[header.master as usize].write_mdata_file_size(&file.path, new_size).await?;

        let mut updated = file.clone();
        updated.header = MetadataHeader { file_size: new_size, ..header };
        self.files.replace(fd, updated);

        Ok(data.len())
    }

    /// Resolves each fragment's target subhandle, returning the `Nfi` and
    /// the [`FileRef`] the caller should issue its I/O against — a session
    /// handle when the subhandle has one open, otherwise the shard's path
    /// directly (`session_file` disabled for this partition).
    fn prepare_fragments(
        &self,
        file: &XpnFile,
        fragments: Vec<Fragment>,
    ) -> XpnResult<Vec<(Fragment, Arc<dyn Nfi>, FileRef)>> {
        fragments
            .into_iter()
            .map(|frag| {
                let subhandle = file
                    .subhandles
                    .get(frag.server as usize)
                    .ok_or_else(|| XpnError::InvalidArgument("fragment targets an unknown server".into()))?;
                let file_ref = match subhandle.session_handle {
                    Some(handle) => FileRef::Handle(handle),
                    None => FileRef::Path(subhandle.local_path.clone()),
                };
                Ok((frag, self.nfis[frag.server as usize].clone(), file_ref))
            })
            .collect()
    }

    pub async fn unlink(&self, path: &str) -> XpnResult<()> {
        for nfi in &self.nfis {
            nfi.rm(path).await?;
        }
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> XpnResult<()> {
        for nfi in &self.nfis {
            nfi.rename(from, to).await?;
        }
        Ok(())
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> XpnResult<()> {
        for nfi in &self.nfis {
            nfi.mkdir(path, mode).await?;
        }
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> XpnResult<()> {
        for nfi in &self.nfis {
            nfi.rmdir(path).await?;
        }
        Ok(())
    }

    pub async fn stat(&self, path: &str) -> XpnResult<FileStat> {
        let master = hash::hash(path, self.partition.server_count(), true);
        self.nfis[master as usize].getattr(path).await
    }

    pub async fn statvfs(&self, path: &str) -> XpnResult<VfsStat> {
        let mut total = VfsStat::default();
        for nfi in &self.nfis {
            let stat = nfi.statvfs(path).await?;
            total.total_blocks += stat.total_blocks;
            total.free_blocks += stat.free_blocks;
            total.total_files += stat.total_files;
            total.free_files += stat.free_files;
            total.block_size = stat.block_size;
        }
        Ok(total)
    }

    /// Opens a directory listing and returns a client-local descriptor
    /// for it. `readdir` queries each server's listing in partition order
    /// and dedupes the results, since a directory's entries may be
    /// visible on more than one server.
    ///
    /// When the partition's `session_dir` switch is off, every server's
    /// listing is drained and closed right here (no listing handle is
    /// held open across the later `readdir` calls); when it is on, a
    /// live subhandle per server is kept instead, matching [`Self::open`]'s
    /// `session_file` distinction.
    pub async fn opendir(&self, path: &str) -> XpnResult<i32> {
        let mut file = XpnFile::new(path.to_string(), &self.partition, MetadataHeader::absent(), 0, 0);

        if self.partition.session_dir {
            let mut subhandles = Vec::with_capacity(self.nfis.len());
            for (server, nfi) in self.nfis.iter().enumerate() {
                let handle = nfi.opendir(path).await?;
                subhandles.push(Subhandle { server: server as u32, local_path: path.to_string(), session_handle: Some(handle) });
            }
            file.subhandles = subhandles;
        } else {
            let mut entries = Vec::new();
            let mut seen = std::collections::HashSet::new();
            for nfi in &self.nfis {
                let handle = nfi.opendir(path).await?;
                loop {
                    let (end, name) = nfi.readdir(handle).await?;
                    if let Some(name) = name {
                        if seen.insert(name.clone()) {
                            entries.push(name);
                        }
                    }
                    if end {
                        break;
                    }
                }
                nfi.closedir(handle).await?;
            }
            file.dir_entries = Some(entries);
        }
        Ok(self.files.insert(file))
    }

    /// Returns the next not-yet-seen entry across every server's listing,
    /// in partition order, or `None` once every server is exhausted.
    pub async fn readdir(&self, fd: i32) -> XpnResult<Option<String>> {
        if let Some(mut file) = self.files.get(fd) {
            if let Some(entries) = &mut file.dir_entries {
                if file.dir_cursor >= entries.len() {
                    return Ok(None);
                }
                let name = entries[file.dir_cursor].clone();
                file.dir_cursor += 1;
                self.files.replace(fd, file);
                return Ok(Some(name));
            }
        }

        loop {
            let mut file = self.files.get(fd).ok_or_else(|| XpnError::InvalidArgument("bad descriptor".into()))?;
            if file.subhandles.is_empty() {
                return Err(XpnError::InvalidArgument("not a directory descriptor".into()));
            }
            if file.dir_cursor >= file.subhandles.len() {
                return Ok(None);
            }
            let subhandle = file.subhandles[file.dir_cursor].clone();
            let handle = subhandle.session_handle.ok_or_else(|| XpnError::InvalidArgument("directory already closed".into()))?;
            let (end, name) = self.nfis[subhandle.server as usize].readdir(handle).await?;
            if end {
                file.dir_cursor += 1;
            }
            match name {
                Some(name) => {
                    let fresh = file.dir_seen.insert(name.clone());
                    self.files.replace(fd, file);
                    if fresh {
                        return Ok(Some(name));
                    }
                    // Already returned from an earlier server; keep scanning.
                }
                None => {
                    self.files.replace(fd, file);
                }
            }
        }
    }

    pub async fn closedir(&self, fd: i32) -> XpnResult<()> {
        self.close(fd).await
    }

    /// Moves `src` to `dst` within the same partition's namespace on
    /// every server, used for `FLUSH`/`PRELOAD`/`CHECKPOINT`-style staging
    /// operations that the wire protocol models identically.
    pub async fn flush(&self, src: &str, dst: &str) -> XpnResult<()> {
        for nfi in &self.nfis {
            nfi.rename(src, dst).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::localfs::{LocalFs, StdLocalFs};
    use crate::nfi::LocalNfi;
    use crate::workers::SequentialPool;

    fn partition(servers: u32) -> PartitionConfig {
        use crate::config::{Policy, ServerEndpoint, TransportKind};
        PartitionConfig {
            name: "default".into(),
            servers: (0..servers)
                .map(|i| ServerEndpoint { transport: TransportKind::Local, host: format!("node{i}"), port: None })
                .collect(),
            block_size: 4,
            replica_count: 1,
            policy: Policy::RoundRobin,
            session_file: true,
            session_dir: true,
        }
    }

    async fn client_with_servers(n: u32) -> XpnClient {
        let (client, _paths) = client_with_server_paths(n).await;
        client
    }

    /// Like [`client_with_servers`] but also hands back each server's
    /// backing directory, so a test can write directly into one server's
    /// local storage without going through the client's every-server
    /// fan-out.
    async fn client_with_server_paths(n: u32) -> (XpnClient, Vec<std::path::PathBuf>) {
        let mut nfis: Vec<Arc<dyn Nfi>> = Vec::new();
        let mut paths = Vec::new();
        for _ in 0..n {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.keep();
            let fs: Arc<dyn LocalFs> = Arc::new(StdLocalFs::new(path.clone()));
            nfis.push(Arc::new(LocalNfi::new(fs)));
            paths.push(path);
        }
        (XpnClient::new(partition(n), nfis, Box::new(SequentialPool)).unwrap(), paths)
    }

    /// Sessionless partition: `session_file`/`session_dir` both off, so
    /// `open`/`opendir` never retain a server-side handle.
    async fn client_with_sessionless_servers(n: u32) -> (XpnClient, Vec<std::path::PathBuf>) {
        let mut nfis: Vec<Arc<dyn Nfi>> = Vec::new();
        let mut paths = Vec::new();
        for _ in 0..n {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.keep();
            let fs: Arc<dyn LocalFs> = Arc::new(StdLocalFs::new(path.clone()));
            nfis.push(Arc::new(LocalNfi::new(fs)));
            paths.push(path);
        }
        let mut config = partition(n);
        config.session_file = false;
        config.session_dir = false;
        (XpnClient::new(config, nfis, Box::new(SequentialPool)).unwrap(), paths)
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_across_three_servers() {
        let client = client_with_servers(3).await;
        let fd = client.open("/f", O_CREAT, 0o644).await.unwrap();

        let payload: Vec<u8> = (0..40u8).collect();
        let written = client.write(fd, &payload, 0).await.unwrap();
        assert_eq!(written, payload.len());

        let mut buf = vec![0u8; payload.len()];
        let read = client.read(fd, &mut buf, 0).await.unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(buf, payload);

        client.close(fd).await.unwrap();
    }

    #[tokio::test]
    async fn stat_reports_the_logical_size_not_the_shard_size() {
        let client = client_with_servers(2).await;
        let fd = client.open("/f", O_CREAT, 0o644).await.unwrap();
        client.write(fd, b"0123456789", 0).await.unwrap();
        let stat = client.stat("/f").await.unwrap();
        assert_eq!(stat.size, 10);
        client.close(fd).await.unwrap();
    }

    #[tokio::test]
    async fn dup_keeps_the_file_open_until_every_reference_closes() {
        let client = client_with_servers(1).await;
        let fd = client.open("/f", O_CREAT, 0o644).await.unwrap();
        let dup_fd = client.dup(fd, -1).await.unwrap();
        assert_ne!(fd, dup_fd);

        client.close(fd).await.unwrap();
        // The underlying session should still be reachable through dup_fd.
        client.write(dup_fd, b"x", 0).await.unwrap();
        client.close(dup_fd).await.unwrap();
    }

    #[tokio::test]
    async fn dup2_onto_an_open_fd_releases_its_sessions() {
        let client = client_with_servers(1).await;
        let a = client.open("/a", O_CREAT, 0o644).await.unwrap();
        let b = client.open("/b", O_CREAT, 0o644).await.unwrap();

        let result = client.dup(a, b).await.unwrap();
        assert_eq!(result, b);
        // "/b"'s session was released by the dup2, so operating on it
        // through a stale reference would now hit a closed handle. "a"'s
        // data is still reachable through the descriptor `b` now owns.
        client.write(b, b"x", 0).await.unwrap();
        client.close(b).await.unwrap();
    }

    #[tokio::test]
    async fn readdir_fans_out_across_every_server_and_dedupes() {
        let (client, paths) = client_with_server_paths(2).await;
        std::fs::write(paths[0].join("only_on_0"), b"").unwrap();
        std::fs::write(paths[1].join("only_on_1"), b"").unwrap();
        std::fs::write(paths[0].join("shared"), b"").unwrap();
        std::fs::write(paths[1].join("shared"), b"").unwrap();

        let dirfd = client.opendir("/").await.unwrap();
        let mut names = Vec::new();
        while let Some(name) = client.readdir(dirfd).await.unwrap() {
            names.push(name);
        }
        client.closedir(dirfd).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["only_on_0", "only_on_1", "shared"]);
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_with_session_file_disabled() {
        let (client, _paths) = client_with_sessionless_servers(3).await;
        let fd = client.open("/f", O_CREAT, 0o644).await.unwrap();

        let file = client.files.get(fd).unwrap();
        assert!(
            file.subhandles.iter().all(|s| s.session_handle.is_none()),
            "session_file disabled: open must not retain a server-side handle"
        );

        client.write(fd, b"hello world", 0).await.unwrap();
        let mut buf = vec![0u8; 11];
        let read = client.read(fd, &mut buf, 0).await.unwrap();
        assert_eq!(read, 11);
        assert_eq!(&buf, b"hello world");
        client.close(fd).await.unwrap();
    }

    #[tokio::test]
    async fn opendir_readdir_prefetches_every_entry_with_session_dir_disabled() {
        let (client, paths) = client_with_sessionless_servers(2).await;
        std::fs::write(paths[0].join("only_on_0"), b"").unwrap();
        std::fs::write(paths[1].join("only_on_1"), b"").unwrap();
        std::fs::write(paths[0].join("shared"), b"").unwrap();
        std::fs::write(paths[1].join("shared"), b"").unwrap();

        let dirfd = client.opendir("/").await.unwrap();
        let file = client.files.get(dirfd).unwrap();
        assert!(
            file.dir_entries.is_some(),
            "session_dir disabled: opendir must prefetch the whole listing up front"
        );
        assert!(
            file.subhandles.iter().all(|s| s.session_handle.is_none()),
            "session_dir disabled: no per-server listing handle should be retained"
        );

        let mut names = Vec::new();
        while let Some(name) = client.readdir(dirfd).await.unwrap() {
            names.push(name);
        }
        client.closedir(dirfd).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["only_on_0", "only_on_1", "shared"]);
    }
}
