//! Background scheduler: periodic sync, startup sync, manual triggers.
//!
//! States: Stopped → Idle → Running → Idle, with Paused entered on network
//! loss (transport failures surfacing from a round) or an explicit pause, and
//! left on resume. At most one sync pass is in flight at a time; a manual
//! trigger during a running pass returns a handle to the in-flight pass.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use mailhaven_core::sync::{
    normalize_sync_interval, SchedulerState, SyncDataType, SYNC_INTERVAL_JITTER_SECS,
    SYNC_ROUND_TIMEOUT_SECS,
};

use crate::engine::{SyncEngine, SyncSummary};
use crate::error::Result;

/// How often the loop wakes to pump the retry queue between full ticks.
const QUEUE_PUMP_INTERVAL_SECS: u64 = 60;

/// Handle to a sync pass, shared by everyone who asked for it.
#[derive(Debug, Clone)]
pub struct SyncRunHandle {
    receiver: watch::Receiver<Option<SyncSummary>>,
}

impl SyncRunHandle {
    /// Wait for the pass to complete.
    pub async fn wait(mut self) -> Option<SyncSummary> {
        loop {
            if let Some(summary) = self.receiver.borrow().clone() {
                return Some(summary);
            }
            if self.receiver.changed().await.is_err() {
                return self.receiver.borrow().clone();
            }
        }
    }
}

pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    state: Arc<StdMutex<SchedulerState>>,
    background_task: Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<Mutex<Option<watch::Receiver<Option<SyncSummary>>>>>,
    resume_notify: Arc<Notify>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            state: Arc::new(StdMutex::new(SchedulerState::Stopped)),
            background_task: Mutex::new(None),
            in_flight: Arc::new(Mutex::new(None)),
            resume_notify: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, state: SchedulerState) {
        *self.state.lock().expect("state lock") = state;
    }

    /// Start the background loop. The first periodic tick fires one interval
    /// after start; the startup sync (if enabled) is a separate one-shot.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
            guard.take();
        }
        self.set_state(SchedulerState::Idle);

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let config = scheduler.engine.config();
            if config.sync_on_startup {
                debug!("[DeviceSync] Startup sync");
                let run = scheduler.trigger().await;
                let _ = run.wait().await;
            }

            let mut since_tick = Duration::ZERO;
            loop {
                let interval_minutes =
                    normalize_sync_interval(scheduler.engine.config().sync_interval_minutes);
                let interval = Duration::from_secs(u64::from(interval_minutes) * 60);

                tokio::time::sleep(Duration::from_secs(QUEUE_PUMP_INTERVAL_SECS)).await;
                since_tick += Duration::from_secs(QUEUE_PUMP_INTERVAL_SECS);

                if scheduler.state() == SchedulerState::Paused {
                    debug!("[DeviceSync] Paused; waiting for resume");
                    scheduler.resume_notify.notified().await;
                    continue;
                }

                if since_tick >= interval {
                    since_tick = Duration::ZERO;
                    let jitter = chrono::Utc::now().timestamp_millis().unsigned_abs()
                        % (SYNC_INTERVAL_JITTER_SECS * 1000);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;

                    debug!("[DeviceSync] Periodic tick");
                    let run = scheduler.trigger().await;
                    let _ = run.wait().await;
                } else {
                    // Between ticks, pump the retry queue for due items.
                    if let Err(err) = scheduler.engine.process_queue().await {
                        warn!("[DeviceSync] Queue pump failed: {}", err);
                    }
                }
            }
        });
        *guard = Some(handle);
        Ok(())
    }

    /// Stop the loop. The in-flight pass, if any, is cancelled at its next
    /// phase boundary.
    pub async fn stop(&self) {
        self.engine.cancel();
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        self.set_state(SchedulerState::Stopped);
        info!("[DeviceSync] Scheduler stopped");
    }

    /// Network lost or device suspended.
    pub fn pause(&self) {
        self.set_state(SchedulerState::Paused);
    }

    /// Network regained.
    pub fn resume(&self) {
        if self.state() == SchedulerState::Paused {
            self.set_state(SchedulerState::Idle);
            self.resume_notify.notify_waiters();
        }
    }

    /// Manual sync. While a pass is running this returns a handle to the
    /// in-flight pass instead of starting a new one.
    pub async fn sync_now(&self) -> SyncRunHandle {
        self.trigger().await
    }

    async fn trigger(&self) -> SyncRunHandle {
        let mut guard = self.in_flight.lock().await;
        if let Some(receiver) = guard.as_ref() {
            if receiver.borrow().is_none() {
                debug!("[DeviceSync] Pass already running; returning its handle");
                return SyncRunHandle {
                    receiver: receiver.clone(),
                };
            }
        }

        let (sender, receiver) = watch::channel(None);
        *guard = Some(receiver.clone());
        drop(guard);

        let engine = Arc::clone(&self.engine);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            {
                let mut state = state.lock().expect("state lock");
                if *state != SchedulerState::Stopped {
                    *state = SchedulerState::Running;
                }
            }

            let summary = match tokio::time::timeout(
                Duration::from_secs(SYNC_ROUND_TIMEOUT_SECS),
                engine.sync_all(),
            )
            .await
            {
                Ok(Ok(summary)) => summary,
                Ok(Err(err)) => {
                    warn!("[DeviceSync] Sync pass failed: {}", err);
                    SyncSummary {
                        status: "error".to_string(),
                        rounds: Vec::new(),
                    }
                }
                Err(_) => {
                    warn!("[DeviceSync] Sync pass timed out; cancelling");
                    engine.cancel();
                    SyncSummary {
                        status: "timeout".to_string(),
                        rounds: Vec::new(),
                    }
                }
            };

            {
                let mut state = state.lock().expect("state lock");
                if *state != SchedulerState::Stopped {
                    // Transport trouble pauses the scheduler until the network
                    // comes back; everything else returns to idle.
                    *state = if summary.status == "push_retry" || summary.status == "pull_retry" {
                        SchedulerState::Paused
                    } else {
                        SchedulerState::Idle
                    };
                }
            }
            let _ = sender.send(Some(summary));
        });

        SyncRunHandle { receiver }
    }

    /// Per-data-type status for the UI, regardless of scheduler state.
    pub fn status(&self, data_type: SyncDataType) -> Result<mailhaven_core::sync::SyncStatusReport> {
        self.engine.status(data_type)
    }
}
