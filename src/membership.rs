//! Elastic membership controller: expand/shrink a partition's server
//! list, rehash affected paths, and rebind every client's open handles.
//!
//! Grounded in the reference implementation's `xpn_controller`: a small
//! action enum sent to a controller process, which reshapes a partition
//! and pushes the new membership out to every connected client's file
//! table via `reinit_vfhs`.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::config::{PartitionConfig, ServerEndpoint};
use crate::error::{XpnError, XpnResult};
use crate::hash;
use crate::metadata;
use crate::nfi::Nfi;
use crate::policy::{self, DistributionParams};
use crate::registry::FileTable;
use crate::wire::FileRef;

/// Administrative action the controller can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Stop,
    StartServers,
    StopServers,
    PingServers,
    /// Adds servers not previously part of the partition.
    ExpandNew,
    /// Re-admits servers already present in the partition's config but
    /// currently stopped.
    ExpandChange,
    /// Removes servers from the partition, keeping their data cordoned
    /// off rather than deleted.
    ShrinkNew,
    ShrinkChange,
}

/// Result of an expand/shrink: the partition's new membership and the
/// count of clients whose file tables were rebound against it.
#[derive(Debug, Clone)]
pub struct MembershipChange {
    pub partition: PartitionConfig,
    pub rebound_clients: usize,
}

/// Coordinates membership changes across every client sharing a
/// partition. Clients register their [`FileTable`] so the controller can
/// push `reinit_vfhs` out to them after a reshape; a client that never
/// registers simply keeps using its old, now-stale, subhandles until its
/// next `open`.
#[derive(Default)]
pub struct MembershipController {
    registered: std::sync::Mutex<Vec<std::sync::Arc<FileTable>>>,
}

impl MembershipController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, files: std::sync::Arc<FileTable>) {
        self.registered.lock().unwrap().push(files);
    }

    /// Adds `new_servers` to `partition`: rehashes and migrates every file
    /// under `root` to the grown layout, then rebinds every registered
    /// client's open files against it.
    ///
    /// `old_nfis` must address every server already in `partition`, in
    /// partition order; `new_nfis` must address every server in the
    /// resulting grown partition (the original servers plus the newly
    /// admitted ones), also in partition order — the full connection set
    /// a fresh [`crate::client::XpnClient`] for the grown partition would
    /// use.
    pub async fn expand(
        &self,
        partition: &PartitionConfig,
        new_servers: Vec<ServerEndpoint>,
        root: &str,
        old_nfis: &[Arc<dyn Nfi>],
        new_nfis: &[Arc<dyn Nfi>],
    ) -> XpnResult<MembershipChange> {
        if new_servers.is_empty() {
            return Err(XpnError::InvalidArgument("expand requires at least one new server".into()));
        }
        let mut grown = partition.clone();
        grown.servers.extend(new_servers);
        grown.validate()?;
        info!(partition = %grown.name, from = partition.server_count(), to = grown.server_count(), "expanding partition");
        migrate(partition, &grown, root, old_nfis, new_nfis).await?;
        Ok(self.apply(grown))
    }

    /// Removes the servers at `remove_indices` from `partition`, rehashing
    /// and migrating every file under `root` to the shrunk layout before
    /// rebinding every registered client's open files.
    ///
    /// Indices are resolved against the partition's current server list
    /// before any removal happens, so duplicate or out-of-range indices
    /// are rejected up front rather than partially applied. `nfis` must
    /// address every server currently in `partition`, in partition order;
    /// the surviving subset (in the shrunk partition's order) is used as
    /// the migration's destination.
    pub async fn shrink(
        &self,
        partition: &PartitionConfig,
        remove_indices: &[usize],
        root: &str,
        nfis: &[Arc<dyn Nfi>],
    ) -> XpnResult<MembershipChange> {
        if remove_indices.is_empty() {
            return Err(XpnError::InvalidArgument("shrink requires at least one server index".into()));
        }
        let server_count = partition.servers.len();
        let mut seen = HashSet::new();
        for &idx in remove_indices {
            if idx >= server_count || !seen.insert(idx) {
                return Err(XpnError::InvalidArgument(format!("invalid or duplicate server index {idx}")));
            }
        }
        if remove_indices.len() >= server_count {
            return Err(XpnError::InvalidArgument("shrink cannot remove every server in a partition".into()));
        }

        let mut shrunk = partition.clone();
        shrunk.servers =
            shrunk.servers.into_iter().enumerate().filter(|(i, _)| !remove_indices.contains(i)).map(|(_, s)| s).collect();
        shrunk.replica_count = shrunk.replica_count.min(shrunk.server_count());
        shrunk.validate()?;
        info!(partition = %shrunk.name, from = partition.server_count(), to = shrunk.server_count(), "shrinking partition");

        let surviving: Vec<Arc<dyn Nfi>> =
            nfis.iter().enumerate().filter(|(i, _)| !remove_indices.contains(i)).map(|(_, nfi)| nfi.clone()).collect();
        migrate(partition, &shrunk, root, nfis, &surviving).await?;
        Ok(self.apply(shrunk))
    }

    fn apply(&self, partition: PartitionConfig) -> MembershipChange {
        let registered = self.registered.lock().unwrap();
        for files in registered.iter() {
            files.reinit_vfhs(&partition);
        }
        MembershipChange { rebound_clients: registered.len(), partition }
    }
}

/// Lists every entry directly under `root` across every server in
/// `nfis`, deduped. Matches [`crate::client::XpnClient::opendir`]'s
/// sessionless fan-out: open, drain to end, close, on each server in
/// turn, since a shard's directory entry may be visible on more than
/// one server.
async fn enumerate_paths(root: &str, nfis: &[Arc<dyn Nfi>]) -> XpnResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    for nfi in nfis {
        let handle = nfi.opendir(root).await?;
        loop {
            let (end, name) = nfi.readdir(handle).await?;
            if let Some(name) = name {
                if seen.insert(name.clone()) {
                    paths.push(if root.ends_with('/') { format!("{root}{name}") } else { format!("{root}/{name}") });
                }
            }
            if end {
                break;
            }
        }
        nfi.closedir(handle).await?;
    }
    Ok(paths)
}

/// For every file directly under `root` on any server in `old`, rehashes
/// under `new`'s server count and, if the owning server or its striping
/// offset changed, streams the shard to its new home.
///
/// Reads every fragment under the old layout into one buffer before
/// writing any fragment under the new layout, so a server that plays
/// both roles (its index survives a shrink, or it is read from under
/// the old layout and written to under the new one) never has its
/// still-unread old data clobbered mid-migration. Replicas are not
/// migrated: only the primary copy (`replica == 0`) is carried over,
/// since the reference scenario this mirrors (`spec`'s elastic resize)
/// exercises single-copy partitions.
async fn migrate(
    old: &PartitionConfig,
    new: &PartitionConfig,
    root: &str,
    old_nfis: &[Arc<dyn Nfi>],
    new_nfis: &[Arc<dyn Nfi>],
) -> XpnResult<()> {
    let paths = enumerate_paths(root, old_nfis).await?;
    for path in paths {
        migrate_one(&path, old, new, old_nfis, new_nfis).await?;
    }
    Ok(())
}

async fn migrate_one(
    path: &str,
    old: &PartitionConfig,
    new: &PartitionConfig,
    old_nfis: &[Arc<dyn Nfi>],
    new_nfis: &[Arc<dyn Nfi>],
) -> XpnResult<()> {
    let old_master = hash::hash(path, old.server_count(), true);
    let new_master = hash::hash(path, new.server_count(), true);

    let size = old_nfis[old_master as usize].getattr(path).await?.size;

    let old_params = DistributionParams {
        block_size: old.block_size,
        server_count: old.server_count(),
        master: old_master,
        replica_count: old.replica_count,
        header_size: metadata::HEADER_SIZE,
    };
    let new_params = DistributionParams {
        block_size: new.block_size,
        server_count: new.server_count(),
        master: new_master,
        replica_count: new.replica_count,
        header_size: metadata::HEADER_SIZE,
    };

    let old_frags = policy::distribute(0, size, old_params);
    let mut buf = vec![0u8; size as usize];
    for frag in old_frags.iter().filter(|f| f.replica == 0) {
        let data = old_nfis[frag.server as usize].read(FileRef::Path(path.to_string()), frag.local_offset, frag.length as u32).await?;
        let start = frag.logical_offset as usize;
        buf[start..start + data.len()].copy_from_slice(&data);
    }

    let new_frags = policy::distribute(0, size, new_params);
    for frag in new_frags.iter().filter(|f| f.replica == 0) {
        let start = frag.logical_offset as usize;
        let end = start + frag.length as usize;
        new_nfis[frag.server as usize].write(FileRef::Path(path.to_string()), frag.local_offset, &buf[start..end]).await?;
    }

    new_nfis[new_master as usize].write_mdata_file_size(path, size).await?;
    info!(path, from_master = old_master, to_master = new_master, bytes = size, "migrated shard to new home");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{XpnClient, O_CREAT};
    use crate::config::{Policy, ServerEndpoint, TransportKind};
    use crate::file::XpnFile;
    use crate::localfs::{LocalFs, StdLocalFs};
    use crate::metadata::MetadataHeader;
    use crate::workers::SequentialPool;
    use std::sync::Arc;

    fn partition(servers: u32) -> PartitionConfig {
        PartitionConfig {
            name: "default".into(),
            servers: (0..servers)
                .map(|i| ServerEndpoint { transport: TransportKind::Local, host: format!("node{i}"), port: None })
                .collect(),
            block_size: 4,
            replica_count: 1,
            policy: Policy::RoundRobin,
            session_file: false,
            session_dir: false,
        }
    }

    /// `n` fresh, independent temp-directory-backed [`LocalNfi`] stubs.
    fn temp_nfis(n: u32) -> Vec<Arc<dyn Nfi>> {
        (0..n)
            .map(|_| {
                let dir = tempfile::tempdir().unwrap();
                let fs: Arc<dyn LocalFs> = Arc::new(StdLocalFs::new(dir.keep()));
                Arc::new(crate::nfi::LocalNfi::new(fs)) as Arc<dyn Nfi>
            })
            .collect()
    }

    #[tokio::test]
    async fn s6_expand_rebinds_open_files_to_the_grown_partition() {
        let controller = MembershipController::new();
        let original = partition(2);
        let old_nfis = temp_nfis(2);
        let mut new_nfis = old_nfis.clone();
        new_nfis.extend(temp_nfis(1));

        let files = Arc::new(FileTable::new());
        let fd = files.insert(XpnFile::new("/f".into(), &original, MetadataHeader::absent(), 0, 0));
        controller.register(files.clone());

        let new_server = ServerEndpoint { transport: TransportKind::Local, host: "node2".into(), port: None };
        let change = controller.expand(&original, vec![new_server], "/", &old_nfis, &new_nfis).await.unwrap();
        assert_eq!(change.partition.server_count(), 3);
        assert_eq!(change.rebound_clients, 1);

        let rebound = files.get(fd).unwrap();
        assert_eq!(rebound.subhandles.len(), 3);
    }

    #[tokio::test]
    async fn expand_migrates_an_existing_file_so_its_bytes_survive_the_rehash() {
        let original = partition(2);
        let old_nfis = temp_nfis(2);

        let client = XpnClient::new(original.clone(), old_nfis.clone(), Box::new(SequentialPool)).unwrap();
        let fd = client.open("/f", O_CREAT, 0o644).await.unwrap();
        let payload: Vec<u8> = (0..10u8).collect();
        client.write(fd, &payload, 0).await.unwrap();
        client.close(fd).await.unwrap();

        let mut new_nfis = old_nfis.clone();
        new_nfis.extend(temp_nfis(1));

        let controller = MembershipController::new();
        let new_server = ServerEndpoint { transport: TransportKind::Local, host: "node2".into(), port: None };
        let change = controller.expand(&original, vec![new_server], "/", &old_nfis, &new_nfis).await.unwrap();
        assert_eq!(change.partition.server_count(), 3);

        let grown_client = XpnClient::new(change.partition, new_nfis, Box::new(SequentialPool)).unwrap();
        let read_fd = grown_client.open("/f", 0, 0).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        let read = grown_client.read(read_fd, &mut buf, 0).await.unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(buf, payload, "read-after-expand must return the pre-expand bytes");
    }

    #[tokio::test]
    async fn shrink_migrates_an_existing_file_so_its_bytes_survive_the_rehash() {
        let original = partition(3);
        let nfis = temp_nfis(3);

        let client = XpnClient::new(original.clone(), nfis.clone(), Box::new(SequentialPool)).unwrap();
        let fd = client.open("/f", O_CREAT, 0o644).await.unwrap();
        let payload: Vec<u8> = (0..20u8).collect();
        client.write(fd, &payload, 0).await.unwrap();
        client.close(fd).await.unwrap();

        let controller = MembershipController::new();
        let change = controller.shrink(&original, &[1], "/", &nfis).await.unwrap();
        assert_eq!(change.partition.server_count(), 2);

        let surviving: Vec<Arc<dyn Nfi>> = nfis.iter().enumerate().filter(|(i, _)| *i != 1).map(|(_, n)| n.clone()).collect();
        let shrunk_client = XpnClient::new(change.partition, surviving, Box::new(SequentialPool)).unwrap();
        let read_fd = shrunk_client.open("/f", 0, 0).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        let read = shrunk_client.read(read_fd, &mut buf, 0).await.unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(buf, payload, "read-after-shrink must return the pre-shrink bytes");
    }

    #[tokio::test]
    async fn shrink_rejects_removing_every_server() {
        let controller = MembershipController::new();
        let original = partition(2);
        assert!(controller.shrink(&original, &[0, 1], "/", &temp_nfis(2)).await.is_err());
    }

    #[tokio::test]
    async fn shrink_rejects_duplicate_indices() {
        let controller = MembershipController::new();
        let original = partition(3);
        assert!(controller.shrink(&original, &[0, 0], "/", &temp_nfis(3)).await.is_err());
    }

    #[tokio::test]
    async fn shrink_removes_the_requested_server() {
        let controller = MembershipController::new();
        let original = partition(3);
        let change = controller.shrink(&original, &[1], "/", &temp_nfis(3)).await.unwrap();
        assert_eq!(change.partition.server_count(), 2);
        assert_eq!(change.partition.servers[1].host, "node2");
    }
}
