//! # Sync Scheduler
//!
//! Decides when cycles run. At most one cycle runs at a time.
//!
//! ```text
//!            trigger / timer            cycle ok, error, cancelled
//!   ┌──────┐ ─────────────> ┌─────────┐ ─────────────────────────> ┌──────┐
//!   │ Idle │                │ Running │                            │ Idle │
//!   └──────┘ <───────────── └────┬────┘                            └──────┘
//!        reauthorized()          │ credential rejected
//!   ┌──────────────┐ <───────────┘
//!   │ AuthRequired │
//!   └──────────────┘
//! ```
//!
//! A trigger that arrives while a cycle runs sets a single pending flag; the
//! cycle is repeated once when it finishes, however many triggers arrived.

use crate::cycle::CycleReport;
use crate::error::Result;
use async_trait::async_trait;
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something that can run one sync cycle.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, cancel: CancellationToken) -> Result<CycleReport>;

    /// Delay until the next timer-driven cycle, read fresh on every tick.
    async fn interval(&self) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    /// Cycles are refused until the user authorizes again.
    AuthRequired,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::AuthRequired => "auth_required",
        };
        f.write_str(name)
    }
}

/// Answer to a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A cycle was started.
    Accepted,
    /// A cycle is running; one more run follows it.
    AlreadyRunning,
    AuthRequired,
    ShutDown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<CycleReport>,
}

#[derive(Debug)]
struct Shared {
    state: SchedulerState,
    pending: bool,
    last_cycle_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_report: Option<CycleReport>,
}

struct Inner {
    runner: Arc<dyn CycleRunner>,
    clock: Arc<dyn Clock>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<SchedulerState>,
    shutdown: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones share one scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    pub fn new(runner: Arc<dyn CycleRunner>, clock: Arc<dyn Clock>) -> Self {
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Self {
            inner: Arc::new(Inner {
                runner,
                clock,
                shared: Mutex::new(Shared {
                    state: SchedulerState::Idle,
                    pending: false,
                    last_cycle_at: None,
                    last_error: None,
                    last_report: None,
                }),
                state_tx,
                shutdown: CancellationToken::new(),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Start with `AuthRequired` when no usable credential exists.
    pub fn require_authorization(&self, reason: impl Into<String>) {
        let mut shared = self.inner.shared.lock();
        if shared.state == SchedulerState::Idle {
            shared.state = SchedulerState::AuthRequired;
            shared.last_error = Some(reason.into());
            drop(shared);
            self.inner.state_tx.send_replace(SchedulerState::AuthRequired);
        }
    }

    /// Run a cycle now, or once more after the running one.
    pub fn trigger(&self) -> TriggerOutcome {
        self.inner.trigger()
    }

    /// Leave `AuthRequired` after a successful authorization and sync.
    pub fn reauthorized(&self) -> TriggerOutcome {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state == SchedulerState::AuthRequired {
                info!("Authorization restored");
                shared.state = SchedulerState::Idle;
                shared.last_error = None;
                drop(shared);
                self.inner.state_tx.send_replace(SchedulerState::Idle);
            }
        }
        self.trigger()
    }

    /// Trigger a cycle now and then every interval.
    pub fn start(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move {
            loop {
                let outcome = inner.trigger();
                debug!(?outcome, "Timer trigger");

                let interval = inner.runner.interval().await;
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.shared.lock().state
    }

    pub fn status(&self) -> SchedulerStatus {
        let shared = self.inner.shared.lock();
        SchedulerStatus {
            state: shared.state,
            last_cycle_at: shared.last_cycle_at,
            last_error: shared.last_error.clone(),
            last_report: shared.last_report.clone(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until no cycle is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state != SchedulerState::Running).await;
    }

    /// Stop the timer, cancel the running cycle and wait for it to wind down.
    pub async fn shutdown(&self) {
        info!("Sync scheduler shutting down");
        self.inner.shutdown.cancel();
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            let _ = timer.await;
        }
        self.wait_idle().await;
    }
}

impl Inner {
    fn trigger(self: &Arc<Self>) -> TriggerOutcome {
        if self.shutdown.is_cancelled() {
            return TriggerOutcome::ShutDown;
        }

        let mut shared = self.shared.lock();
        let state = shared.state;
        match state {
            SchedulerState::AuthRequired => TriggerOutcome::AuthRequired,
            SchedulerState::Running => {
                if !shared.pending {
                    debug!("Cycle running, queueing one re-run");
                }
                shared.pending = true;
                TriggerOutcome::AlreadyRunning
            }
            SchedulerState::Idle => {
                shared.state = SchedulerState::Running;
                drop(shared);
                self.state_tx.send_replace(SchedulerState::Running);

                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.run_cycles().await });
                TriggerOutcome::Accepted
            }
        }
    }

    async fn run_cycles(self: Arc<Self>) {
        loop {
            let cancel = self.shutdown.child_token();
            let result = self.runner.run_cycle(cancel).await;
            let now = self.clock.now();

            let mut shared = self.shared.lock();
            let next = match result {
                Ok(report) => {
                    shared.last_cycle_at = Some(now);
                    shared.last_error = report.warning();
                    shared.last_report = Some(report);
                    SchedulerState::Idle
                }
                Err(e) if e.is_cancelled() => SchedulerState::Idle,
                Err(e) if e.requires_reauthorization() => {
                    warn!(error = %e, "Sync halted until reauthorized");
                    shared.last_cycle_at = Some(now);
                    shared.last_error = Some(e.to_string());
                    SchedulerState::AuthRequired
                }
                Err(e) => {
                    shared.last_cycle_at = Some(now);
                    shared.last_error = Some(e.to_string());
                    SchedulerState::Idle
                }
            };

            let rerun = next == SchedulerState::Idle
                && shared.pending
                && !self.shutdown.is_cancelled();
            shared.pending = false;
            if rerun {
                debug!("Running queued re-run");
                continue;
            }

            shared.state = next;
            drop(shared);
            self.state_tx.send_replace(next);
            break;
        }
    }
}

impl fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
