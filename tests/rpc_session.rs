use acesrv::auth::Access;
use acesrv::client::{AceClient, Prefer};
use acesrv::config::{Policy, ServerConfig};
use acesrv::error::ClientError;
use acesrv::http_server;
use acesrv::memstore::MemStore;
use acesrv::protocol::{Encore, RpcRequest, RpcResponse, MSG_UNAUTHORISED};
use acesrv::secret;
use acesrv::server::ServerCore;
use acesrv::state::AppState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct TestServer {
    base: String,
    wdir: TempDir,
    _rdir: TempDir,
    handle: JoinHandle<()>,
}

async fn start(policy: Policy) -> TestServer {
    let wdir = tempfile::tempdir().unwrap();
    let rdir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        policy,
        write_dir: Some(wdir.path().to_path_buf()),
        read_dir: Some(rdir.path().to_path_buf()),
        ..ServerConfig::default()
    };
    config.validate().unwrap();

    let core = ServerCore::new(config, Arc::new(MemStore::new()), None, Instant::now());
    let state = AppState::new(core);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        http_server::serve(listener, state).await.unwrap();
    });

    TestServer {
        base,
        wdir,
        _rdir: rdir,
        handle,
    }
}

async fn raw(base: &str, req: &RpcRequest) -> RpcResponse {
    reqwest::Client::new()
        .post(format!("{}/rpc", base))
        .json(req)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_check() {
    let server = start(Policy::Public).await;
    let body = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn read_secret_allows_queries_but_not_shutdown() {
    let server = start(Policy::DirectorySecret).await;

    let mut writer = AceClient::connect(&server.base).await.unwrap();
    assert_eq!(writer.access(), Access::Write);
    writer
        .ingest("Gene : \"xyz\"\nLocus III\n\nGene other\n")
        .await
        .unwrap();

    let hello = raw(&server.base, &RpcRequest::hello()).await;
    assert!(hello.client_id > writer.client_id());
    let read_path = hello.read_secret.clone().unwrap();
    let read_magic =
        secret::parse_secret(&std::fs::read_to_string(&read_path).unwrap()).unwrap();

    let resp = raw(
        &server.base,
        &RpcRequest::command(hello.client_id, read_magic, "find gene xyz"),
    )
    .await;
    assert_eq!(resp.client_id, hello.client_id);
    assert_eq!(resp.text, "// Found 1 objects");

    let resp = raw(
        &server.base,
        &RpcRequest::command(hello.client_id, read_magic, "shutdown"),
    )
    .await;
    assert_eq!(resp.client_id, hello.client_id);
    assert!(resp.text.contains("requires write access"));

    // Still serving.
    let again = AceClient::connect(&server.base).await.unwrap();
    assert!(again.client_id() > hello.client_id);
}

#[tokio::test]
async fn wrong_secret_is_not_retried() {
    let server = start(Policy::DirectorySecret).await;
    let hello = raw(&server.base, &RpcRequest::hello()).await;
    let write_path = hello.write_secret.clone().unwrap();
    let write_magic =
        secret::parse_secret(&std::fs::read_to_string(&write_path).unwrap()).unwrap();

    let resp = raw(
        &server.base,
        &RpcRequest::command(hello.client_id, write_magic.wrapping_add(1), "count"),
    )
    .await;
    assert_eq!(resp.client_id, 0);
    assert_eq!(resp.text, MSG_UNAUTHORISED);
    assert!(!std::path::Path::new(&write_path).exists());

    let resp = raw(
        &server.base,
        &RpcRequest::command(hello.client_id, write_magic, "count"),
    )
    .await;
    assert_eq!(resp.client_id, 0);
}

#[tokio::test]
async fn pagination_over_http() {
    let server = start(Policy::Public).await;
    let mut client = AceClient::connect(&server.base).await.unwrap();
    let data: String = (0..50).map(|i| format!("Gene g{:02}\n\n", i)).collect();
    let summary = client.ingest(&data).await.unwrap();
    assert!(summary.starts_with("// 50 objects read"));

    client.command("find Gene").await.unwrap();
    let first = client.command("list -c 15").await.unwrap();
    assert_eq!(first.encore, Encore::More);
    assert_eq!(first.text.lines().count(), 15);

    let all = client.command_all("list -c 15").await.unwrap();
    assert_eq!(all.lines().count(), 50);
}

#[tokio::test]
async fn read_only_client_on_public_server() {
    let server = start(Policy::Public).await;
    let mut client = AceClient::connect_with(&server.base, Prefer::Read)
        .await
        .unwrap();
    assert_eq!(client.access(), Access::Read);

    let resp = client.command("who").await.unwrap();
    assert!(resp.text.contains("requires write access"));
    let err = client.ingest("Gene a\n").await.unwrap();
    assert!(err.contains("requires write access"));
}

#[tokio::test]
async fn quit_removes_secret_files() {
    let server = start(Policy::Restricted).await;
    let client = AceClient::connect(&server.base).await.unwrap();
    assert_eq!(std::fs::read_dir(server.wdir.path()).unwrap().count(), 1);

    client.quit().await.unwrap();
    assert_eq!(std::fs::read_dir(server.wdir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn invalid_encore_is_rejected_by_transport() {
    let server = start(Policy::Public).await;
    let status = reqwest::Client::new()
        .post(format!("{}/rpc", server.base))
        .json(&serde_json::json!({"client_id": 1, "encore": 1}))
        .send()
        .await
        .unwrap()
        .status();
    assert!(status.is_client_error());
}

#[tokio::test]
async fn shutdown_now_stops_the_server() {
    let server = start(Policy::Public).await;
    let mut admin = AceClient::connect(&server.base).await.unwrap();
    let mut other = AceClient::connect(&server.base).await.unwrap();

    let resp = admin.command("shutdown now").await.unwrap();
    assert_eq!(resp.client_id, 0);

    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("server did not stop")
        .unwrap();

    assert!(matches!(
        other.command("count").await,
        Err(ClientError::Http(_))
    ));
}

#[tokio::test]
async fn failed_connect_does_not_leave_a_session_behind() {
    let server = start(Policy::Restricted).await;

    // Restricted servers have no read tier.
    let err = AceClient::connect_with(&server.base, Prefer::Read).await;
    assert!(matches!(err, Err(ClientError::NoAccess)));
    assert_eq!(std::fs::read_dir(server.wdir.path()).unwrap().count(), 0);

    let client = AceClient::connect(&server.base).await.unwrap();
    assert_eq!(client.access(), Access::Write);
}
