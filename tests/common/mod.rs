//! Shared fixtures: a scripted checker, a recording notifier, and pool
//! helpers for driving the scheduler and engine without the network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tfwatch::checker::{AvailabilityChecker, CheckOutcome};
use tfwatch::core::error::{AppError, AppResult};
use tfwatch::notify::Notifier;
use tfwatch::scheduler::Scheduler;
use tfwatch::storage::monitors::{self, Monitor, MonitorStatus, NewMonitor, NotifyMode};
use tfwatch::storage::settings::{SettingsStore, TelegramSettings};
use tfwatch::storage::{create_pool, get_connection, DbPool};

/// One scripted check result. The last step repeats forever.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Available,
    Full,
    Fail(&'static str),
}

/// Checker that replays a fixed script instead of fetching anything, while
/// counting calls and tracking how many checks overlap.
pub struct ScriptedChecker {
    steps: Mutex<VecDeque<Step>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedChecker {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make every check take `delay` before resolving.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        if steps.len() > 1 {
            steps.pop_front().unwrap_or(Step::Full)
        } else {
            steps.front().copied().unwrap_or(Step::Full)
        }
    }
}

#[async_trait]
impl AvailabilityChecker for ScriptedChecker {
    async fn check(&self, _testflight_url: &str, _proxy: Option<&str>) -> AppResult<CheckOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self.next_step();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match step {
            Step::Available => Ok(CheckOutcome {
                available: true,
                app_name: "Test App".to_string(),
                icon_url: "https://example.com/icon.png".to_string(),
                message: "Beta has open slots".to_string(),
            }),
            Step::Full => Ok(CheckOutcome {
                available: false,
                app_name: "Test App".to_string(),
                icon_url: "https://example.com/icon.png".to_string(),
                message: "Beta is full".to_string(),
            }),
            Step::Fail(cause) => Err(AppError::Classification(cause.to_string())),
        }
    }
}

/// Notifier that records every message instead of sending it. Can be told
/// to fail the next N sends.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
    failures_remaining: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, _cfg: &TelegramSettings, _proxy: Option<&str>, text: &str) -> AppResult<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::Notification("scripted delivery failure".to_string()));
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// File-backed pool in a fresh temp dir (shared across pool connections,
/// unlike `:memory:`).
pub fn temp_pool() -> (tempfile::TempDir, Arc<DbPool>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("test.sqlite");
    let pool = create_pool(path.to_str().expect("utf8 path")).expect("pool");
    (dir, Arc::new(pool))
}

/// Field values for a test monitor; tweak before inserting.
pub fn new_monitor(app_id: &str, interval: u32, notify_mode: NotifyMode) -> NewMonitor {
    NewMonitor {
        app_id: app_id.to_string(),
        app_name: String::new(),
        icon_url: String::new(),
        testflight_url: format!("https://testflight.apple.com/join/{app_id}"),
        status: MonitorStatus::Full,
        interval,
        duration: 0,
        notify_mode,
        enabled: true,
        last_check: None,
        last_error: None,
        expire_at: None,
        created_at: Utc::now(),
    }
}

pub fn seed_monitor(pool: &DbPool, new: &NewMonitor) -> Monitor {
    let conn = get_connection(pool).expect("conn");
    monitors::insert_monitor(&conn, new).expect("insert")
}

pub fn fetch_monitor(pool: &DbPool, id: i64) -> Monitor {
    let conn = get_connection(pool).expect("conn");
    monitors::get_monitor(&conn, id).expect("get").expect("row must exist")
}

pub fn make_scheduler(
    pool: &Arc<DbPool>,
    checker: Arc<ScriptedChecker>,
    notifier: Arc<RecordingNotifier>,
) -> Arc<Scheduler> {
    let settings = Arc::new(SettingsStore::load(Arc::clone(pool)).expect("settings"));
    Scheduler::new(Arc::clone(pool), checker, notifier, settings)
}
