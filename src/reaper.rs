//! Idle reaping, the no-client shutdown countdown, and autosave.
//!
//! [`ServerCore::sweep`] evaluates all three in one pass and returns how long
//! to wait before the next pass. [`run_reaper`] is the task that calls it.

use crate::registry::DestroyReason;
use crate::server::{ServerCore, StopReason};
use crate::state::AppState;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Period used when every timer is disabled.
pub const FALLBACK_PERIOD: Duration = Duration::from_secs(60);
/// Added to countdown waits so the deadline has strictly passed when the sweep runs.
const COUNTDOWN_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct ReaperState {
    /// When a sweep first saw zero clients; `None` while clients exist.
    countdown_started: Option<Instant>,
    last_autosave: Instant,
}

impl ReaperState {
    pub fn new(now: Instant) -> Self {
        Self {
            countdown_started: None,
            last_autosave: now,
        }
    }

    pub fn cancel_countdown(&mut self) {
        if self.countdown_started.take().is_some() {
            debug!("Shutdown countdown cancelled");
        }
    }

    pub fn countdown_started(&self) -> Option<Instant> {
        self.countdown_started
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sweep {
    pub reaped: usize,
    pub next: Duration,
    pub stopped: Option<StopReason>,
}

impl ServerCore {
    pub fn sweep(&mut self, now: Instant) -> Sweep {
        if let Some(reason) = self.stopped() {
            return Sweep {
                reaped: 0,
                next: FALLBACK_PERIOD,
                stopped: Some(reason),
            };
        }

        let mut reaped = 0;
        let client_timeout = self.config.client_timeout;
        if !client_timeout.is_zero() {
            for id in self.registry.idle_sessions(now, client_timeout) {
                info!(client_id = id, timeout_secs = client_timeout.as_secs(), "Client timed out");
                self.registry.destroy(id, DestroyReason::Idle);
                reaped += 1;
            }
        }

        self.autosave(now);

        if self.registry.active_count() == 0 {
            if self.refuse_new {
                self.shutdown(StopReason::Operator, true);
            } else if !self.config.server_timeout.is_zero() {
                match self.reaper.countdown_started() {
                    None => {
                        info!(
                            timeout_secs = self.config.server_timeout.as_secs(),
                            "No clients, starting shutdown countdown"
                        );
                        self.reaper.countdown_started = Some(now);
                    }
                    Some(start) if now.saturating_duration_since(start) > self.config.server_timeout => {
                        self.shutdown(StopReason::Idle, true);
                    }
                    Some(_) => {}
                }
            }
        } else {
            self.reaper.cancel_countdown();
        }

        Sweep {
            reaped,
            next: self.next_period(now),
            stopped: self.stopped(),
        }
    }

    fn autosave(&mut self, now: Instant) {
        let interval = self.config.autosave_interval;
        if interval.is_zero() || now.saturating_duration_since(self.reaper.last_autosave) < interval {
            return;
        }
        self.reaper.last_autosave = now;
        match self.db.save_if_dirty() {
            Ok(true) => info!("Autosaved database"),
            Ok(false) => debug!("Autosave: nothing to save"),
            Err(e) => warn!(error = %e, "Autosave failed"),
        }
    }

    /// How long until the next sweep is worth running.
    pub fn next_period(&self, now: Instant) -> Duration {
        let primary = if self.registry.active_count() > 0 {
            self.config.client_timeout
        } else {
            match self.reaper.countdown_started() {
                Some(start) if !self.config.server_timeout.is_zero() => {
                    let elapsed = now.saturating_duration_since(start);
                    self.config.server_timeout.saturating_sub(elapsed) + COUNTDOWN_SLACK
                }
                _ => self.config.server_timeout,
            }
        };

        let autosave = self.config.autosave_interval;
        [primary, autosave]
            .into_iter()
            .filter(|d| !d.is_zero())
            .min()
            .unwrap_or(FALLBACK_PERIOD)
    }
}

/// Sweep until the server stops.
///
/// The wait is shortened whenever a request signals a rearm, so a fresh
/// client is covered by the client timeout rather than a long countdown
/// period.
pub async fn run_reaper(state: AppState) {
    let mut stop = state.subscribe_stop();
    let mut deadline = {
        let core = state.core.lock().await;
        tokio::time::Instant::now() + core.next_period(Instant::now())
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = state.rearmed() => {
                let core = state.core.lock().await;
                let candidate = tokio::time::Instant::now() + core.next_period(Instant::now());
                deadline = deadline.min(candidate);
                continue;
            }
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => return,
        }

        let sweep = match state.with_core(|core| core.sweep(Instant::now())).await {
            Ok(sweep) => sweep,
            Err(e) => {
                error!(error = %e, "Reaper sweep failed");
                state.signal_stop();
                return;
            }
        };
        if sweep.reaped > 0 {
            debug!(reaped = sweep.reaped, "Reaper sweep");
        }
        if sweep.stopped.is_some() {
            state.signal_stop();
            return;
        }
        deadline = tokio::time::Instant::now() + sweep.next;
    }
}
