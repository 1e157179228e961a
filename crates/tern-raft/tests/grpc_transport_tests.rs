//! Region RPC over gRPC on a loopback.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tern_core::{DiskEnv, Region, ServerName};
use tern_lsm::{Db, NoopMeter, Options};
use tern_raft::{
    serve_grpc, GrpcTransport, MemberContext, RaftConfig, RaftError, RaftRecord, RaftStates,
    RegionServer, RegionStore, RegionTransport, Role,
};
use tern_sstable::bytewise;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

async fn bind() -> (TcpListener, ServerName) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, ServerName::new("127.0.0.1", port))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_and_unknown_region_over_grpc() {
    let (listener, name) = bind().await;
    let (shutdown, _) = broadcast::channel(1);
    let server = tokio::spawn(serve_grpc(
        listener,
        RegionServer::new(name.clone()),
        shutdown.subscribe(),
    ));

    let client = GrpcTransport::new(Duration::from_secs(2));
    assert_eq!(client.echo(&name, 41).await.unwrap(), 41);
    // Cached client is reused.
    assert_eq!(client.echo(&name, -3).await.unwrap(), -3);
    assert_eq!(client.connected(), vec![name.clone()]);

    let state = client.get_raft_state(&name, "missing").await.unwrap();
    assert!(!state.found);
    assert!(state.state.is_none());
    assert!(!client.trim_edit_queue(&name, "missing", 5).await.unwrap());

    shutdown.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unreachable_target_is_transport_error() {
    let (listener, name) = bind().await;
    drop(listener);

    let client = GrpcTransport::new(Duration::from_millis(500));
    let err = client.echo(&name, 1).await.unwrap_err();
    assert!(matches!(err, RaftError::Transport(_) | RaftError::Timeout(_)));
    assert!(client.connected().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_after_server_restart_reconnects() {
    let (listener, name) = bind().await;
    let (shutdown, _) = broadcast::channel(1);
    let first = tokio::spawn(serve_grpc(
        listener,
        RegionServer::new(name.clone()),
        shutdown.subscribe(),
    ));

    let client = GrpcTransport::new(Duration::from_secs(2));
    assert_eq!(client.echo(&name, 7).await.unwrap(), 7);

    shutdown.send(()).unwrap();
    first.await.unwrap().unwrap();

    // The cached channel still points at the first server.
    let listener = TcpListener::bind(("127.0.0.1", name.port)).await.unwrap();
    let (shutdown, _) = broadcast::channel(1);
    let second = tokio::spawn(serve_grpc(
        listener,
        RegionServer::new(name.clone()),
        shutdown.subscribe(),
    ));

    assert_eq!(client.echo(&name, 8).await.unwrap(), 8);
    assert_eq!(client.connected(), vec![name.clone()]);

    shutdown.send(()).unwrap();
    second.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_member_region_commits_over_grpc() {
    let dir = TempDir::new().unwrap();
    let (listener, name) = bind().await;
    let (shutdown, _) = broadcast::channel(2);

    let meta = Db::open(
        dir.path().join("meta"),
        Options::default(),
        bytewise(),
        Arc::new(DiskEnv),
        Arc::new(NoopMeter),
    )
    .await
    .unwrap();
    let store = RegionStore::open(
        dir.path().join("region"),
        Options::default(),
        Arc::new(DiskEnv),
        Arc::new(NoopMeter),
    )
    .await
    .unwrap();
    let config = RaftConfig {
        candidate_wait_ms: 200,
        heartbeat_interval_ms: 20,
        collect_interval_ms: 20,
        rpc_timeout_ms: 150,
        ..RaftConfig::default()
    };
    let ctx = MemberContext {
        name: name.clone(),
        meta: Arc::new(meta),
        transport: Arc::new(GrpcTransport::new(config.rpc_timeout())),
        meter: Arc::new(NoopMeter),
    };
    let member = RaftStates::open(&ctx, Region::full(), vec![name.clone()], config, Arc::new(store)).unwrap();

    let region_server = RegionServer::new(name.clone());
    region_server.add_region(member.clone());
    let serving = tokio::spawn(serve_grpc(listener, region_server, shutdown.subscribe()));
    let running = member.spawn(shutdown.subscribe());

    let client = GrpcTransport::new(Duration::from_secs(2));
    let data = RaftRecord::new("rpc-key", "rpc-value").encode().unwrap();
    assert!(client
        .append_edit(&name, &Region::full().id(), data)
        .await
        .unwrap());

    let mut committed = false;
    for _ in 0..100 {
        if member.store().get(b"rpc-key").unwrap() == Some((1, b"rpc-value".to_vec())) {
            committed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(committed, "edit was not committed over gRPC");
    assert_eq!(member.role(), Role::Leader);

    let state = client
        .get_raft_state(&name, &Region::full().id())
        .await
        .unwrap();
    assert!(state.found);
    assert_eq!(state.state.unwrap().last_sequence.index, 1);

    shutdown.send(()).unwrap();
    running.await.unwrap();
    serving.await.unwrap().unwrap();
}
