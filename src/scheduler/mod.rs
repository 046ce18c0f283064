//! Monitor scheduling core.
//!
//! One coordinating loop drives every monitor off a priority queue of
//! `(due_at, monitor_id)` deadlines, not a timer task per monitor. Each due
//! check runs as its own spawned task so a slow fetch never delays ticks for
//! unrelated monitors, while a per-monitor in-flight marker keeps checks for
//! the same id strictly serialized.
//!
//! The scheduler is the only writer of monitor `status`. State transitions
//! (marking checking, applying results, re-arming ticks) happen in short
//! critical sections with no `.await` inside; the only suspension points are
//! the page fetch and the Telegram send.

use crate::checker::{AvailabilityChecker, CheckOutcome};
use crate::core::error::AppResult;
use crate::notify::{format_alert, Notifier};
use crate::storage::db::{get_connection, DbPool};
use crate::storage::monitors::{self, Monitor, MonitorStatus, NotifyMode};
use crate::storage::settings::SettingsStore;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// In-memory scheduling state for one registered monitor.
///
/// `prev_status` is the last terminal status seen by the scheduler and is the
/// source of truth for transition detection; the persisted field may lag a
/// concurrent write. `generation` identifies this registration: a result
/// carrying a stale generation belongs to a deleted (or re-registered)
/// incarnation and is discarded.
struct Entry {
    testflight_url: String,
    interval: u32,
    expire_at: Option<DateTime<Utc>>,
    notify_mode: NotifyMode,
    prev_status: MonitorStatus,
    enabled: bool,
    in_flight: bool,
    generation: u64,
    next_tick: Option<DateTime<Utc>>,
}

/// A queued wake-up: either a pending tick or an expiry sentinel. Stale
/// deadlines are harmless; dispatch re-validates against the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    at: DateTime<Utc>,
    id: i64,
}

struct SchedState {
    entries: HashMap<i64, Entry>,
    queue: BinaryHeap<Reverse<Deadline>>,
    next_generation: u64,
}

enum Due {
    Check { id: i64, url: String, generation: u64 },
    Expire { id: i64 },
}

pub struct Scheduler {
    db_pool: Arc<DbPool>,
    checker: Arc<dyn AvailabilityChecker>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<SettingsStore>,
    state: Mutex<SchedState>,
    wakeup: Notify,
}

impl Scheduler {
    pub fn new(
        db_pool: Arc<DbPool>,
        checker: Arc<dyn AvailabilityChecker>,
        notifier: Arc<dyn Notifier>,
        settings: Arc<SettingsStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db_pool,
            checker,
            notifier,
            settings,
            state: Mutex::new(SchedState {
                entries: HashMap::new(),
                queue: BinaryHeap::new(),
                next_generation: 0,
            }),
            wakeup: Notify::new(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load enabled monitors from the store, expire the ones already past
    /// their deadline, register the rest, and spawn the coordinating loop.
    pub fn start(self: &Arc<Self>) -> AppResult<()> {
        let conn = get_connection(&self.db_pool)?;
        let enabled = monitors::list_enabled(&conn)?;
        let now = Utc::now();

        let mut registered = 0usize;
        for m in &enabled {
            if m.expire_at.is_some_and(|t| t <= now) {
                monitors::mark_expired(&conn, m.id)?;
                log::info!("Monitor {} expired while the service was down", m.id);
                continue;
            }
            self.add(m);
            registered += 1;
        }
        drop(conn);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await });

        log::info!("Scheduler started with {} active monitor(s)", registered);
        Ok(())
    }

    /// Register a monitor. Enabled monitors get their first tick immediately;
    /// disabled ones stay dormant until `set_enabled(true)`.
    pub fn add(&self, m: &Monitor) {
        if !m.enabled {
            return;
        }
        let mut state = self.lock_state();
        Self::register(&mut state, m, Utc::now());
        drop(state);
        self.wakeup.notify_one();
    }

    fn register(state: &mut SchedState, m: &Monitor, first_tick: DateTime<Utc>) {
        let generation = state.next_generation;
        state.next_generation += 1;

        state.queue.push(Reverse(Deadline { at: first_tick, id: m.id }));
        if let Some(exp) = m.expire_at {
            state.queue.push(Reverse(Deadline { at: exp, id: m.id }));
        }
        state.entries.insert(
            m.id,
            Entry {
                testflight_url: m.testflight_url.clone(),
                interval: m.interval,
                expire_at: m.expire_at,
                notify_mode: m.notify_mode,
                prev_status: m.status,
                enabled: true,
                in_flight: false,
                generation,
                next_tick: Some(first_tick),
            },
        );
    }

    /// Deregister a monitor. Any in-flight check finishes but its result is
    /// discarded. Idempotent.
    pub fn remove(&self, id: i64) {
        let mut state = self.lock_state();
        state.entries.remove(&id);
        drop(state);
        self.wakeup.notify_one();
    }

    /// Pause or resume a monitor.
    ///
    /// Resuming arms the first tick one full interval out: a mass resume
    /// must not stampede the upstream page. Pausing cancels the pending tick
    /// but lets an in-flight check complete; its result is still applied,
    /// just not rescheduled.
    pub fn set_enabled(&self, m: &Monitor, enabled: bool) {
        let mut state = self.lock_state();
        if enabled {
            let first_tick = Utc::now() + Duration::seconds(i64::from(m.interval));
            match state.entries.get_mut(&m.id) {
                Some(entry) => {
                    entry.enabled = true;
                    if !entry.in_flight && entry.next_tick.is_none() {
                        entry.next_tick = Some(first_tick);
                        state.queue.push(Reverse(Deadline { at: first_tick, id: m.id }));
                    }
                }
                None => Self::register(&mut state, m, first_tick),
            }
        } else if let Some(entry) = state.entries.get_mut(&m.id) {
            if entry.in_flight {
                entry.enabled = false;
                entry.next_tick = None;
            } else {
                state.entries.remove(&m.id);
            }
        }
        drop(state);
        self.wakeup.notify_one();
    }

    /// Apply updated schedule fields to a registered monitor. An interval
    /// change moves the next tick to `now + new_interval`; the in-flight
    /// check, if any, is unaffected. No-op for unregistered ids.
    pub fn reschedule(&self, id: i64, interval: u32, expire_at: Option<DateTime<Utc>>, notify_mode: NotifyMode) {
        let mut state = self.lock_state();
        if let Some(entry) = state.entries.get_mut(&id) {
            let interval_changed = entry.interval != interval;
            entry.interval = interval;
            entry.expire_at = expire_at;
            entry.notify_mode = notify_mode;

            if interval_changed && entry.enabled && !entry.in_flight {
                let next = Utc::now() + Duration::seconds(i64::from(interval));
                entry.next_tick = Some(next);
                state.queue.push(Reverse(Deadline { at: next, id }));
            }
            if let Some(exp) = expire_at {
                state.queue.push(Reverse(Deadline { at: exp, id }));
            }
        }
        drop(state);
        self.wakeup.notify_one();
    }

    /// Count of monitors the scheduler is actively ticking.
    pub fn active_jobs(&self) -> usize {
        self.lock_state().entries.values().filter(|e| e.enabled).count()
    }

    /// Earliest pending tick across active monitors, if any.
    pub fn next_check_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state()
            .entries
            .values()
            .filter(|e| e.enabled)
            .filter_map(|e| e.next_tick)
            .min()
    }

    /// Coordinating loop: drain due deadlines, dispatch, sleep until the next
    /// one or until a mutation wakes us.
    async fn run(self: Arc<Self>) {
        loop {
            let (due, next_at) = self.collect_due(Utc::now());

            for item in due {
                match item {
                    Due::Expire { id } => self.persist_expiry(id),
                    Due::Check { id, url, generation } => {
                        let scheduler = Arc::clone(&self);
                        tokio::spawn(async move { scheduler.run_check(id, url, generation).await });
                    }
                }
            }

            match next_at {
                Some(at) => {
                    let millis = (at - Utc::now()).num_milliseconds().max(0) as u64;
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(millis)) => {}
                        _ = self.wakeup.notified() => {}
                    }
                }
                None => self.wakeup.notified().await,
            }
        }
    }

    /// Pop everything due at `now` and resolve each deadline against the live
    /// entry. Returns the dispatch list and the next pending wake-up time.
    fn collect_due(&self, now: DateTime<Utc>) -> (Vec<Due>, Option<DateTime<Utc>>) {
        let mut state = self.lock_state();
        let mut due = Vec::new();

        while state.queue.peek().is_some_and(|Reverse(d)| d.at <= now) {
            let Some(Reverse(deadline)) = state.queue.pop() else { break };
            let id = deadline.id;

            let Some(entry) = state.entries.get_mut(&id) else {
                continue; // removed; stale deadline
            };

            if entry.expire_at.is_some_and(|t| t <= now) {
                // Eager expiry, even between ticks and even mid-check: the
                // entry leaves the set now, so an in-flight result is
                // discarded on arrival.
                state.entries.remove(&id);
                due.push(Due::Expire { id });
                continue;
            }

            if !entry.enabled {
                continue;
            }

            if entry.in_flight {
                // Tick overlapped a still-running check: skip it and try
                // again one interval later.
                let retry = now + Duration::seconds(i64::from(entry.interval));
                entry.next_tick = Some(retry);
                state.queue.push(Reverse(Deadline { at: retry, id }));
                continue;
            }

            if entry.next_tick.is_some_and(|t| t <= now) {
                entry.in_flight = true;
                entry.next_tick = None;
                due.push(Due::Check {
                    id,
                    url: entry.testflight_url.clone(),
                    generation: entry.generation,
                });
            }
            // else: superseded deadline, nothing to do
        }

        let next_at = state.queue.peek().map(|Reverse(d)| d.at);
        (due, next_at)
    }

    fn persist_expiry(&self, id: i64) {
        match get_connection(&self.db_pool) {
            Ok(conn) => {
                if let Err(e) = monitors::mark_expired(&conn, id) {
                    log::error!("Failed to persist expiry for monitor {}: {}", id, e);
                } else {
                    log::info!("Monitor {} expired", id);
                }
            }
            Err(e) => log::error!("DB connection error while expiring monitor {}: {}", id, e),
        }
    }

    /// One full check cycle for a monitor: mark checking, fetch, apply.
    async fn run_check(self: Arc<Self>, id: i64, url: String, generation: u64) {
        match get_connection(&self.db_pool) {
            Ok(conn) => {
                if let Err(e) = monitors::mark_checking(&conn, id) {
                    log::warn!("Failed to mark monitor {} as checking: {}", id, e);
                }
            }
            Err(e) => log::error!("DB connection error before check of monitor {}: {}", id, e),
        }

        let proxy = self.settings.proxy_url();
        let result = self.checker.check(&url, proxy.as_deref()).await;
        self.apply_check_result(id, generation, &url, result).await;
    }

    /// Apply a finished check. Three phases: decide under the state lock,
    /// persist and notify outside it, then re-arm under the lock again.
    async fn apply_check_result(&self, id: i64, generation: u64, url: &str, result: AppResult<CheckOutcome>) {
        let now = Utc::now();

        // Phase 1: decide.
        enum Disposition {
            Discard,
            Expired,
            Applied {
                new_status: MonitorStatus,
                should_notify: bool,
                auto_pause: bool,
                removed: bool,
            },
        }

        let disposition = {
            let mut state = self.lock_state();
            match state.entries.get_mut(&id) {
                None => Disposition::Discard,
                Some(entry) if entry.generation != generation => Disposition::Discard,
                Some(entry) => {
                    entry.in_flight = false;

                    if entry.expire_at.is_some_and(|t| t <= now) {
                        state.entries.remove(&id);
                        Disposition::Expired
                    } else {
                        let prev = entry.prev_status;
                        let new_status = match &result {
                            Ok(outcome) if outcome.available => MonitorStatus::Available,
                            Ok(_) => MonitorStatus::Full,
                            Err(_) => MonitorStatus::Error,
                        };
                        entry.prev_status = new_status;

                        // Notify only on the transition into available; a
                        // slot staying open must not re-fire on every tick.
                        let should_notify =
                            new_status == MonitorStatus::Available && prev != MonitorStatus::Available;
                        let auto_pause = should_notify && entry.notify_mode == NotifyMode::Once;

                        let removed = if !entry.enabled {
                            // Paused mid-check: apply the result below, but
                            // this entry stops ticking.
                            state.entries.remove(&id);
                            true
                        } else {
                            false
                        };

                        Disposition::Applied {
                            new_status,
                            should_notify,
                            auto_pause,
                            removed,
                        }
                    }
                }
            }
        };

        // Phase 2: persist.
        match &disposition {
            Disposition::Discard => {
                log::debug!("Discarding check result for deregistered monitor {}", id);
                return;
            }
            Disposition::Expired => {
                self.persist_expiry(id);
                return;
            }
            Disposition::Applied { new_status, .. } => {
                if let Err(e) = self.persist_result(id, *new_status, &result, now) {
                    log::error!("Failed to persist check result for monitor {}: {}", id, e);
                }
            }
        }

        let Disposition::Applied {
            should_notify,
            auto_pause,
            removed,
            ..
        } = disposition
        else {
            return;
        };

        // Phase 3: notify. A failed send is logged and nothing else; it
        // never reverts status, and the once-mode latch only advances on a
        // delivered message.
        let mut paused = false;
        if should_notify {
            let telegram = self.settings.telegram();
            if !telegram.enabled {
                log::debug!("Monitor {} became available but telegram is disabled", id);
            } else if let Ok(outcome) = &result {
                let text = format_alert(&outcome.app_name, &outcome.message, url);
                let proxy = self.settings.proxy_url();
                match self.notifier.send(&telegram, proxy.as_deref(), &text).await {
                    Ok(()) => {
                        log::info!("Notification sent for monitor {}", id);
                        if auto_pause {
                            paused = self.pause_after_notify(id, generation);
                        }
                    }
                    Err(e) => log::warn!("Failed to send notification for monitor {}: {}", id, e),
                }
            }
        }

        // Phase 4: re-arm, unless the monitor left the set meanwhile.
        if !removed && !paused {
            let mut state = self.lock_state();
            if let Some(entry) = state.entries.get_mut(&id) {
                if entry.generation == generation && entry.enabled && !entry.in_flight {
                    let next = Utc::now() + Duration::seconds(i64::from(entry.interval));
                    entry.next_tick = Some(next);
                    state.queue.push(Reverse(Deadline { at: next, id }));
                } else if !entry.enabled {
                    state.entries.remove(&id);
                }
            }
        }

        self.wakeup.notify_one();
    }

    fn persist_result(
        &self,
        id: i64,
        new_status: MonitorStatus,
        result: &AppResult<CheckOutcome>,
        checked_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let conn = get_connection(&self.db_pool)?;
        match result {
            Ok(outcome) => {
                monitors::apply_check_success(&conn, id, new_status, checked_at)?;
                if !outcome.app_name.is_empty() || !outcome.icon_url.is_empty() {
                    monitors::fill_metadata(&conn, id, &outcome.app_name, &outcome.icon_url)?;
                }
            }
            Err(e) => monitors::apply_check_error(&conn, id, &e.to_string(), checked_at)?,
        }
        Ok(())
    }

    /// Once-mode: the monitor pauses itself after its one delivered
    /// notification. Returns true when this incarnation was deregistered.
    fn pause_after_notify(&self, id: i64, generation: u64) -> bool {
        let mut state = self.lock_state();
        let matches_incarnation = state
            .entries
            .get(&id)
            .is_some_and(|e| e.generation == generation);
        if matches_incarnation {
            state.entries.remove(&id);
        }
        drop(state);

        if !matches_incarnation {
            return false;
        }

        match get_connection(&self.db_pool) {
            Ok(conn) => {
                if let Err(e) = monitors::set_enabled(&conn, id, false) {
                    log::error!("Failed to auto-pause monitor {}: {}", id, e);
                } else {
                    log::info!("Monitor {} notified once and auto-paused", id);
                }
            }
            Err(e) => log::error!("DB connection error while auto-pausing monitor {}: {}", id, e),
        }
        true
    }
}
