//! Shared application state.

use crate::protocol::{RpcRequest, RpcResponse};
use crate::server::{ServerCore, StopReason};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinError;
use tracing::{error, info};

/// Shared by the HTTP handlers and the reaper task.
///
/// Every request runs under the single core lock, so requests are
/// serialized and the reaper never sees a session half-updated.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Mutex<ServerCore>>,
    stop_tx: Arc<watch::Sender<bool>>,
    rearm: Arc<Notify>,
}

impl AppState {
    pub fn new(core: ServerCore) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            core: Arc::new(Mutex::new(core)),
            stop_tx: Arc::new(stop_tx),
            rearm: Arc::new(Notify::new()),
        }
    }

    /// Run `f` against the core on the blocking pool while holding the lock.
    ///
    /// Everything that touches the core may do file I/O (secret files,
    /// database saves), so none of it runs on an async worker.
    pub async fn with_core<R, F>(&self, f: F) -> Result<R, JoinError>
    where
        F: FnOnce(&mut ServerCore) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut core = Arc::clone(&self.core).lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *core)).await
    }

    /// Run one request to completion.
    pub async fn handle(&self, req: RpcRequest) -> Result<RpcResponse, JoinError> {
        let (resp, stopped) = self
            .with_core(move |core| {
                let resp = core.handle(req, Instant::now());
                (resp, core.stopped().is_some())
            })
            .await?;

        if stopped {
            self.signal_stop();
        } else {
            self.rearm.notify_one();
        }
        Ok(resp)
    }

    /// Shut the core down from outside the request path (signals).
    pub async fn stop(&self, reason: StopReason) {
        if let Err(e) = self.with_core(move |core| core.shutdown(reason, true)).await {
            error!(error = %e, "Shutdown task failed");
        }
        self.signal_stop();
    }

    pub fn signal_stop(&self) {
        if !*self.stop_tx.borrow() {
            info!("Server stopping");
        }
        self.stop_tx.send_replace(true);
    }

    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Resolves when a request asks the reaper to recompute its deadline.
    pub async fn rearmed(&self) {
        self.rearm.notified().await
    }
}
