use acesrv::config::{Policy, ServerConfig};
use acesrv::http_server;
use acesrv::memstore::MemStore;
use acesrv::protocol::{RpcRequest, RpcResponse, MSG_UNAUTHORISED};
use acesrv::server::{ServerCore, StopReason};
use acesrv::state::AppState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct Running {
    base: String,
    state: AppState,
    wdir: TempDir,
    handle: JoinHandle<()>,
}

async fn start(client_timeout: u64, server_timeout: u64) -> Running {
    let wdir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        policy: Policy::Public,
        write_dir: Some(wdir.path().to_path_buf()),
        client_timeout: Duration::from_secs(client_timeout),
        server_timeout: Duration::from_secs(server_timeout),
        autosave_interval: Duration::ZERO,
        ..ServerConfig::default()
    };
    let core = ServerCore::new(config, Arc::new(MemStore::new()), None, Instant::now());
    let state = AppState::new(core);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn({
        let state = state.clone();
        async move {
            http_server::serve(listener, state).await.unwrap();
        }
    });
    Running {
        base,
        state,
        wdir,
        handle,
    }
}

async fn rpc(base: &str, req: &RpcRequest) -> RpcResponse {
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

async fn stopped(state: &AppState) -> Option<StopReason> {
    state.core.lock().await.stopped()
}

#[tokio::test]
async fn idle_client_is_reaped_then_server_exits() {
    let server = start(1, 3).await;
    let hello = rpc(&server.base, &RpcRequest::hello()).await;
    assert!(hello.client_id > 0);
    assert_eq!(std::fs::read_dir(server.wdir.path()).unwrap().count(), 1);

    // Reaped after about a second; the countdown then needs three more.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(server.state.core.lock().await.active_count(), 0);
    assert_eq!(stopped(&server.state).await, None);
    assert_eq!(std::fs::read_dir(server.wdir.path()).unwrap().count(), 0);

    let resp = rpc(&server.base, &RpcRequest::command(hello.client_id, 0, "count")).await;
    assert_eq!(resp.client_id, 0);
    assert_eq!(resp.text, MSG_UNAUTHORISED);

    tokio::time::timeout(Duration::from_secs(15), server.handle)
        .await
        .expect("server did not stop")
        .unwrap();
    assert_eq!(stopped(&server.state).await, Some(StopReason::Idle));
    assert!(server.state.is_stopping());
}

#[tokio::test]
async fn handshake_during_countdown_keeps_server_alive() {
    // Clients never expire; the countdown starts at the first sweep (2s) and
    // would end the server at the following one (5s).
    let server = start(0, 2).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(stopped(&server.state).await, None);

    let hello = rpc(&server.base, &RpcRequest::hello()).await;
    assert!(hello.client_id > 0);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(stopped(&server.state).await, None);
    assert!(!server.handle.is_finished());
    let resp = rpc(&server.base, &RpcRequest::command(hello.client_id, 0, "count")).await;
    assert_eq!(resp.client_id, hello.client_id);

    // Once the last client leaves, the countdown runs again.
    let resp = rpc(&server.base, &RpcRequest::command(hello.client_id, 0, "quit")).await;
    assert!(resp.is_closed());
    tokio::time::timeout(Duration::from_secs(20), server.handle)
        .await
        .expect("server did not stop")
        .unwrap();
    assert_eq!(stopped(&server.state).await, Some(StopReason::Idle));
}
