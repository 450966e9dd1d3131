//! Periodic and one-shot re-check scheduling
//!
//! [`ScheduleManager`] decides what should be scheduled after each check;
//! a [`CheckTimer`] backend does the actual timekeeping. The manager only
//! talks to the backend when its own state changes, which keeps repeated
//! outcomes from stacking up duplicate timers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Why a scheduled check fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledCheck {
    Periodic,
    Retry,
}

/// Scheduling primitive the manager drives
pub trait CheckTimer: Send + Sync {
    /// Start (or restart) the repeating check
    fn schedule_repeating(&self, interval: Duration);
    /// Stop the repeating check
    fn cancel_repeating(&self);
    /// Start (or restart) a single delayed check
    fn schedule_once(&self, delay: Duration);
    /// Drop the pending single check
    fn cancel_once(&self);
}

/// What is currently scheduled
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleState {
    /// Interval of the active periodic check
    pub periodic: Option<Duration>,
    /// When the armed one-shot retry is due
    pub retry_due: Option<DateTime<Utc>>,
}

impl ScheduleState {
    pub fn retry_armed(&self) -> bool {
        self.retry_due.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    enabled: bool,
    interval: Duration,
    retry_delay: Duration,
}

/// Turns check outcomes into timer changes
pub struct ScheduleManager {
    timer: Arc<dyn CheckTimer>,
    settings: Mutex<Settings>,
    state: Mutex<ScheduleState>,
}

impl ScheduleManager {
    pub fn new(
        timer: Arc<dyn CheckTimer>,
        enabled: bool,
        interval: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            timer,
            settings: Mutex::new(Settings {
                enabled,
                interval,
                retry_delay,
            }),
            state: Mutex::new(ScheduleState::default()),
        }
    }

    /// Apply the enable flag and interval from configuration
    pub fn apply_config(&self, enabled: bool, interval: Duration) {
        {
            let mut settings = self.settings.lock();
            settings.enabled = enabled;
            settings.interval = interval;
        }

        if enabled {
            self.ensure_periodic();
        } else {
            self.cancel_all();
        }
    }

    /// React to the end of a check
    pub fn on_check_outcome(&self, success: bool, manifest_changed: bool) {
        if !self.settings.lock().enabled {
            self.cancel_all();
            return;
        }

        if success {
            if manifest_changed {
                self.ensure_periodic();
            }
            self.cancel_retry();
        } else {
            self.arm_retry();
        }
    }

    /// The armed retry has fired and is no longer pending
    pub fn on_retry_fired(&self) {
        self.state.lock().retry_due = None;
    }

    pub fn snapshot(&self) -> ScheduleState {
        self.state.lock().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.lock().enabled
    }

    fn ensure_periodic(&self) {
        let interval = self.settings.lock().interval;
        let mut state = self.state.lock();
        if state.periodic == Some(interval) {
            debug!("Periodic check already scheduled every {:?}", interval);
            return;
        }
        self.timer.schedule_repeating(interval);
        state.periodic = Some(interval);
        info!("Periodic update check scheduled every {:?}", interval);
    }

    fn arm_retry(&self) {
        let delay = self.settings.lock().retry_delay;
        let mut state = self.state.lock();
        if state.retry_armed() {
            debug!("One-shot retry already armed");
            return;
        }
        self.timer.schedule_once(delay);
        let offset = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        state.retry_due = Some(Utc::now() + offset);
        info!("One-shot update check armed in {:?}", delay);
    }

    fn cancel_retry(&self) {
        let mut state = self.state.lock();
        if state.retry_due.take().is_some() {
            self.timer.cancel_once();
            debug!("One-shot retry cancelled");
        }
    }

    fn cancel_all(&self) {
        let mut state = self.state.lock();
        if state.periodic.take().is_some() {
            self.timer.cancel_repeating();
            info!("Periodic update check cancelled");
        }
        if state.retry_due.take().is_some() {
            self.timer.cancel_once();
        }
    }
}

/// Timer backend built on tokio tasks.
///
/// Fired checks are delivered on the receiver returned by [`TokioCheckTimer::new`].
/// Scheduling must happen inside a tokio runtime.
pub struct TokioCheckTimer {
    sender: mpsc::UnboundedSender<ScheduledCheck>,
    repeating: Mutex<Option<JoinHandle<()>>>,
    once: Mutex<Option<JoinHandle<()>>>,
}

impl TokioCheckTimer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScheduledCheck>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let timer = Self {
            sender,
            repeating: Mutex::new(None),
            once: Mutex::new(None),
        };
        (timer, receiver)
    }

    fn replace(slot: &Mutex<Option<JoinHandle<()>>>, handle: Option<JoinHandle<()>>) {
        if let Some(previous) = std::mem::replace(&mut *slot.lock(), handle) {
            previous.abort();
        }
    }
}

impl CheckTimer for TokioCheckTimer {
    fn schedule_repeating(&self, interval: Duration) {
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                if sender.send(ScheduledCheck::Periodic).is_err() {
                    break;
                }
            }
        });
        Self::replace(&self.repeating, Some(handle));
    }

    fn cancel_repeating(&self) {
        Self::replace(&self.repeating, None);
    }

    fn schedule_once(&self, delay: Duration) {
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(ScheduledCheck::Retry);
        });
        Self::replace(&self.once, Some(handle));
    }

    fn cancel_once(&self) {
        Self::replace(&self.once, None);
    }
}

impl Drop for TokioCheckTimer {
    fn drop(&mut self) {
        Self::replace(&self.repeating, None);
        Self::replace(&self.once, None);
    }
}
