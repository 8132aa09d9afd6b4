//! End-to-end scenarios exercising the full client-to-server stack,
//! wiring the striping client against real TCP servers rather than the
//! in-process `LocalNfi` stub the unit tests use.

use std::sync::Arc;
use std::time::Duration;

use xpn::client::{XpnClient, O_CREAT};
use xpn::config::{Policy, ServerEndpoint, TransportKind};
use xpn::localfs::{LocalFs, StdLocalFs};
use xpn::membership::MembershipController;
use xpn::nfi::{Nfi, SocketNfi};
use xpn::transport;
use xpn::workers::SequentialPool;
use xpn::PartitionConfig;

async fn spawn_server() -> (String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let fs: Arc<dyn LocalFs> = Arc::new(StdLocalFs::new(dir.path()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let endpoint = addr.to_string();
    let server_endpoint = endpoint.clone();
    tokio::spawn(async move { xpn::server::run(&server_endpoint, fs).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (endpoint, dir)
}

fn partition(servers: u32, block_size: u64) -> PartitionConfig {
    PartitionConfig {
        name: "default".into(),
        servers: (0..servers)
            .map(|i| ServerEndpoint { transport: TransportKind::Socket, host: format!("node{i}"), port: None })
            .collect(),
        block_size,
        replica_count: 1,
        policy: Policy::RoundRobin,
        session_file: true,
        session_dir: true,
    }
}

async fn connect_nfis(endpoints: &[String]) -> Vec<Arc<dyn Nfi>> {
    let mut nfis: Vec<Arc<dyn Nfi>> = Vec::new();
    for endpoint in endpoints {
        let channel = transport::connect(endpoint, Duration::from_secs(1)).await.unwrap();
        nfis.push(Arc::new(SocketNfi::new(channel)));
    }
    nfis
}

#[tokio::test]
async fn s2_single_remote_server_round_trip() {
    let (endpoint, _dir) = spawn_server().await;
    let nfis = connect_nfis(&[endpoint]).await;
    let client = XpnClient::new(partition(1, 4096), nfis, Box::new(SequentialPool)).unwrap();

    let fd = client.open("/a", O_CREAT, 0o644).await.unwrap();
    let written = client.write(fd, b"hello", 0).await.unwrap();
    assert_eq!(written, 5);
    client.close(fd).await.unwrap();

    let fd = client.open("/a", 0, 0).await.unwrap();
    let stat = client.stat("/a").await.unwrap();
    assert_eq!(stat.size, 5);

    let mut buf = vec![0u8; 5];
    let read = client.read(fd, &mut buf, 0).await.unwrap();
    assert_eq!(read, 5);
    assert_eq!(&buf, b"hello");
    client.close(fd).await.unwrap();
}

#[tokio::test]
async fn s1_three_server_striping_round_trip_over_the_wire() {
    let mut endpoints = Vec::new();
    let mut dirs = Vec::new();
    for _ in 0..3 {
        let (endpoint, dir) = spawn_server().await;
        endpoints.push(endpoint);
        dirs.push(dir);
    }
    let nfis = connect_nfis(&endpoints).await;
    let client = XpnClient::new(partition(3, 4), nfis, Box::new(SequentialPool)).unwrap();

    let fd = client.open("/striped", O_CREAT, 0o644).await.unwrap();
    let payload = b"abcdefghij";
    let written = client.write(fd, payload, 0).await.unwrap();
    assert_eq!(written, payload.len());

    let mut buf = vec![0u8; payload.len()];
    let read = client.read(fd, &mut buf, 0).await.unwrap();
    assert_eq!(read, payload.len());
    assert_eq!(&buf, payload);
    client.close(fd).await.unwrap();
}

#[tokio::test]
async fn s5_readdir_coverage_shrinks_after_removal() {
    let (endpoint, _dir) = spawn_server().await;
    let nfis = connect_nfis(&[endpoint]).await;
    let client = XpnClient::new(partition(1, 4096), nfis, Box::new(SequentialPool)).unwrap();

    client.mkdir("/base", 0o755).await.unwrap();
    client.mkdir("/base/subdir", 0o755).await.unwrap();
    for i in 0..4 {
        let fd = client.open(&format!("/base/{i}.txt"), O_CREAT, 0o644).await.unwrap();
        client.close(fd).await.unwrap();
    }

    let dirfd = client.opendir("/base").await.unwrap();
    let mut names = Vec::new();
    while let Some(name) = client.readdir(dirfd).await.unwrap() {
        names.push(name);
    }
    client.closedir(dirfd).await.unwrap();
    names.sort();
    assert_eq!(names, vec!["0.txt", "1.txt", "2.txt", "3.txt", "subdir"]);

    client.rmdir("/base/subdir").await.unwrap();
    let dirfd = client.opendir("/base").await.unwrap();
    let mut names = Vec::new();
    while let Some(name) = client.readdir(dirfd).await.unwrap() {
        names.push(name);
    }
    client.closedir(dirfd).await.unwrap();
    names.sort();
    assert_eq!(names, vec!["0.txt", "1.txt", "2.txt", "3.txt"]);
}

#[tokio::test]
async fn rebinding_an_open_descriptor_grows_its_subhandle_set() {
    let (endpoint, _dir) = spawn_server().await;
    let original = partition(1, 4096);
    let nfis = connect_nfis(&[endpoint]).await;
    let client = XpnClient::new(original.clone(), nfis, Box::new(SequentialPool)).unwrap();

    let fd = client.open("/f", O_CREAT, 0o644).await.unwrap();
    assert_eq!(client.file_table().get(fd).unwrap().subhandles.len(), 1);

    let mut grown = original;
    grown.servers.push(ServerEndpoint { transport: TransportKind::Socket, host: "node1".into(), port: None });
    client.file_table().reinit_vfhs(&grown);

    assert_eq!(client.file_table().get(fd).unwrap().subhandles.len(), 2);
    client.close(fd).await.unwrap();
}

#[tokio::test]
async fn s6_read_after_expand_returns_pre_expand_bytes() {
    let (endpoint_a, _dir_a) = spawn_server().await;
    let (endpoint_b, _dir_b) = spawn_server().await;
    let original = partition(2, 4096);
    let nfis = connect_nfis(&[endpoint_a.clone(), endpoint_b.clone()]).await;
    let client = XpnClient::new(original.clone(), nfis, Box::new(SequentialPool)).unwrap();

    // Three blocks at the original block size, so the rehash below
    // actually reshuffles which server owns which byte range.
    let payload = vec![0x5Au8; 10 * 1024];
    let fd = client.open("/grown", O_CREAT, 0o644).await.unwrap();
    client.write(fd, &payload, 0).await.unwrap();

    let mut before = vec![0u8; payload.len()];
    client.read(fd, &mut before, 0).await.unwrap();
    assert_eq!(before, payload);
    client.close(fd).await.unwrap();

    // A third server joins. The controller rehashes and migrates
    // "/grown"'s shards to the grown layout; only then can a client of
    // the grown partition read the file back correctly.
    let (endpoint_c, _dir_c) = spawn_server().await;

    let old_nfis = connect_nfis(&[endpoint_a.clone(), endpoint_b.clone()]).await;
    let new_nfis = connect_nfis(&[endpoint_a, endpoint_b, endpoint_c]).await;

    let controller = MembershipController::new();
    let new_server = ServerEndpoint { transport: TransportKind::Socket, host: "node2".into(), port: None };
    let change = controller.expand(&original, vec![new_server], "/", &old_nfis, &new_nfis).await.unwrap();
    assert_eq!(change.partition.server_count(), 3);

    let client = XpnClient::new(change.partition, new_nfis, Box::new(SequentialPool)).unwrap();
    let fd = client.open("/grown", 0, 0).await.unwrap();
    let mut after = vec![0u8; payload.len()];
    let read = client.read(fd, &mut after, 0).await.unwrap();
    assert_eq!(read, payload.len());
    assert_eq!(after, payload);
    client.close(fd).await.unwrap();
}
