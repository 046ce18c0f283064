//! Engine facade: the boundary an API layer talks to.
//!
//! Owns the pool, the settings store, and the scheduler, and translates
//! caller intent (create/toggle/update/delete, config changes, status) into
//! store writes plus scheduler mutations. Validation and config errors
//! surface synchronously; check failures never do, those are the
//! scheduler's to record.

use crate::checker::{parse_join_url, AvailabilityChecker, CheckOutcome, TestFlightChecker};
use crate::core::config::monitor::{DEFAULT_INTERVAL_SECS, MIN_INTERVAL_SECS};
use crate::core::config::telegram::TEST_MESSAGE;
use crate::core::error::{AppError, AppResult};
use crate::notify::{format_alert, Notifier, TelegramNotifier};
use crate::scheduler::Scheduler;
use crate::storage::db::{get_connection, DbPool};
use crate::storage::monitors::{self, Monitor, MonitorStatus, NewMonitor, NotifyMode};
use crate::storage::settings::{ProxySettings, SettingsStore, TelegramSettings};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Parameters for a batch monitor creation. `urls` holds one TestFlight
/// link per line; blank lines are skipped.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMonitorsRequest {
    pub urls: String,
    #[serde(default)]
    pub interval: Option<u32>,
    /// Seconds the monitors stay active; 0/absent = unbounded.
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub notify_mode: Option<NotifyMode>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_true() -> bool {
    true
}

/// Batch creation result: the rows that were created plus one message per
/// rejected line ("url: cause").
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedMonitors {
    pub created: Vec<Monitor>,
    pub errors: Vec<String>,
}

/// Partial schedule update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMonitorRequest {
    #[serde(default)]
    pub interval: Option<u32>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub notify_mode: Option<NotifyMode>,
}

/// Live scheduling summary, derived from scheduler state on demand.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub active_jobs: usize,
    pub next_check_at: Option<DateTime<Utc>>,
}

pub struct Engine {
    pool: Arc<DbPool>,
    settings: Arc<SettingsStore>,
    scheduler: Arc<Scheduler>,
    checker: Arc<dyn AvailabilityChecker>,
    notifier: Arc<dyn Notifier>,
}

impl Engine {
    /// Wire up an engine over `pool` with injected checker and notifier.
    ///
    /// Runs startup recovery (rows stuck in `checking` become `error` with
    /// `lastError="interrupted"`) before anything can be scheduled. Call
    /// [`start`](Self::start) to load enabled monitors and begin ticking.
    pub fn new(
        pool: Arc<DbPool>,
        checker: Arc<dyn AvailabilityChecker>,
        notifier: Arc<dyn Notifier>,
    ) -> AppResult<Self> {
        let conn = get_connection(&pool)?;
        let reset = monitors::reset_interrupted(&conn)?;
        if reset > 0 {
            log::warn!("Reset {} monitor(s) interrupted mid-check by the previous run", reset);
        }
        drop(conn);

        let settings = Arc::new(SettingsStore::load(Arc::clone(&pool))?);
        let scheduler = Scheduler::new(
            Arc::clone(&pool),
            Arc::clone(&checker),
            Arc::clone(&notifier),
            Arc::clone(&settings),
        );

        Ok(Self {
            pool,
            settings,
            scheduler,
            checker,
            notifier,
        })
    }

    /// Production wiring: live TestFlight checker, live Telegram notifier.
    pub fn with_defaults(pool: Arc<DbPool>) -> AppResult<Self> {
        Self::new(
            pool,
            Arc::new(TestFlightChecker::new()),
            Arc::new(TelegramNotifier::new()),
        )
    }

    /// Start scheduling all enabled monitors.
    pub fn start(&self) -> AppResult<()> {
        self.scheduler.start()
    }

    // ── monitors ─────────────────────────────────────────────────────────────

    /// Create one monitor per non-empty line of `req.urls`.
    ///
    /// Line-level problems (malformed URL, already-monitored app) reject that
    /// line only; batch-level problems (empty list, zero interval) fail the
    /// whole call. Each accepted URL is probed once, synchronously, to
    /// resolve its metadata and initial status; a failed probe still creates
    /// the row, as `error`. An auto-started monitor whose probe finds the
    /// beta already open alerts right away, exactly as if a scheduled check
    /// had seen the slot open up. Auto-started monitors get their next check
    /// one interval after that probe.
    pub async fn create_monitors(&self, req: &CreateMonitorsRequest) -> AppResult<CreatedMonitors> {
        let interval = normalize_interval(req.interval)?;
        let duration = req.duration.unwrap_or(0);
        let notify_mode = req.notify_mode.unwrap_or(NotifyMode::Once);

        let urls: Vec<&str> = req.urls.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if urls.is_empty() {
            return Err(AppError::Validation("no TestFlight URLs supplied".to_string()));
        }

        let mut created = Vec::new();
        let mut errors = Vec::new();

        for url in urls {
            match self.create_one(url, interval, duration, notify_mode, req.auto_start).await {
                Ok(monitor) => created.push(monitor),
                Err(e) => errors.push(format!("{url}: {e}")),
            }
        }

        Ok(CreatedMonitors { created, errors })
    }

    async fn create_one(
        &self,
        url: &str,
        interval: u32,
        duration: u32,
        notify_mode: NotifyMode,
        auto_start: bool,
    ) -> AppResult<Monitor> {
        let app_id = parse_join_url(url)?;

        {
            let conn = get_connection(&self.pool)?;
            if monitors::find_by_app_id(&conn, &app_id)?.is_some() {
                return Err(AppError::Validation("already monitored".to_string()));
            }
        }

        // Initial probe: resolves metadata and a real starting status so the
        // row is never in a made-up state.
        let proxy = self.settings.proxy_url();
        let probe = self.checker.check(url, proxy.as_deref()).await;

        let now = Utc::now();
        let (status, app_name, icon_url, last_error) = match &probe {
            Ok(outcome) if outcome.available => {
                (MonitorStatus::Available, outcome.app_name.clone(), outcome.icon_url.clone(), None)
            }
            Ok(outcome) => (MonitorStatus::Full, outcome.app_name.clone(), outcome.icon_url.clone(), None),
            Err(e) => (MonitorStatus::Error, String::new(), String::new(), Some(e.to_string())),
        };

        let expire_at = (duration > 0).then(|| now + Duration::seconds(i64::from(duration)));

        let mut monitor = {
            let conn = get_connection(&self.pool)?;
            monitors::insert_monitor(
                &conn,
                &NewMonitor {
                    app_id,
                    app_name,
                    icon_url,
                    testflight_url: url.to_string(),
                    status,
                    interval,
                    duration,
                    notify_mode,
                    enabled: auto_start,
                    last_check: Some(now),
                    last_error,
                    expire_at,
                    created_at: now,
                },
            )?
        };

        if auto_start {
            // A probe that finds the slot already open counts as the
            // transition into available; alert now instead of waiting for an
            // edge the scheduler will never see.
            if let Ok(outcome) = &probe {
                if outcome.available && self.notify_initial_availability(&monitor, outcome).await {
                    monitor = self.get_monitor(monitor.id)?;
                }
            }
            if monitor.enabled {
                // The probe was this monitor's first check; the scheduler
                // picks up one interval later rather than re-fetching
                // immediately. Its baseline is the probed status, so an
                // already-open slot does not re-alert on the next tick.
                self.scheduler.set_enabled(&monitor, true);
            }
        }

        log::info!("Created monitor {} for {}", monitor.id, monitor.testflight_url);
        Ok(monitor)
    }

    /// Alert for a monitor whose creation probe found open slots. Returns
    /// true when a delivered `once`-mode alert auto-paused the monitor; a
    /// failed send keeps it polling, same as in the scheduler.
    async fn notify_initial_availability(&self, monitor: &Monitor, outcome: &CheckOutcome) -> bool {
        let telegram = self.settings.telegram();
        if !telegram.enabled {
            log::debug!("Monitor {} created available but telegram is disabled", monitor.id);
            return false;
        }

        let text = format_alert(&outcome.app_name, &outcome.message, &monitor.testflight_url);
        let proxy = self.settings.proxy_url();
        match self.notifier.send(&telegram, proxy.as_deref(), &text).await {
            Ok(()) => {
                log::info!("Notification sent for monitor {} at creation", monitor.id);
                if monitor.notify_mode == NotifyMode::Once {
                    let paused = get_connection(&self.pool)
                        .map_err(AppError::from)
                        .and_then(|conn| monitors::set_enabled(&conn, monitor.id, false));
                    match paused {
                        Ok(()) => {
                            log::info!("Monitor {} notified once and auto-paused", monitor.id);
                            return true;
                        }
                        Err(e) => log::error!("Failed to auto-pause monitor {}: {}", monitor.id, e),
                    }
                }
            }
            Err(e) => log::warn!("Failed to send notification for monitor {}: {}", monitor.id, e),
        }
        false
    }

    /// All monitors, in creation order.
    pub fn list_monitors(&self) -> AppResult<Vec<Monitor>> {
        let conn = get_connection(&self.pool)?;
        monitors::list_monitors(&conn)
    }

    pub fn get_monitor(&self, id: i64) -> AppResult<Monitor> {
        let conn = get_connection(&self.pool)?;
        monitors::get_monitor(&conn, id)?.ok_or(AppError::NotFound(id))
    }

    /// Flip `enabled` and pause/resume scheduling accordingly. Resuming an
    /// already-expired monitor is allowed; the scheduler retires it again on
    /// its next pass.
    pub fn toggle_monitor(&self, id: i64) -> AppResult<Monitor> {
        let monitor = self.get_monitor(id)?;
        let enabled = !monitor.enabled;

        {
            let conn = get_connection(&self.pool)?;
            monitors::set_enabled(&conn, id, enabled)?;
        }

        let updated = self.get_monitor(id)?;
        self.scheduler.set_enabled(&updated, enabled);

        log::info!("Monitor {} {}", id, if enabled { "resumed" } else { "paused" });
        Ok(updated)
    }

    /// Apply a partial schedule update.
    ///
    /// A duration change recomputes `expireAt` from `createdAt`, not from
    /// now, so extending or shortening the window never depends on when the
    /// edit happens. Toggling alone never touches `expireAt`.
    pub fn update_monitor(&self, id: i64, req: &UpdateMonitorRequest) -> AppResult<Monitor> {
        let monitor = self.get_monitor(id)?;

        let interval = match req.interval {
            Some(value) => normalize_interval(Some(value))?,
            None => monitor.interval,
        };
        let duration = req.duration.unwrap_or(monitor.duration);
        let notify_mode = req.notify_mode.unwrap_or(monitor.notify_mode);

        let expire_at = if duration != monitor.duration {
            (duration > 0).then(|| monitor.created_at + Duration::seconds(i64::from(duration)))
        } else {
            monitor.expire_at
        };

        {
            let conn = get_connection(&self.pool)?;
            monitors::update_schedule(&conn, id, interval, duration, notify_mode, expire_at)?;
        }

        self.scheduler.reschedule(id, interval, expire_at, notify_mode);
        self.get_monitor(id)
    }

    /// Remove a monitor from the scheduler and the store. Returns false when
    /// no such row existed; that is not an error.
    pub fn delete_monitor(&self, id: i64) -> AppResult<bool> {
        self.scheduler.remove(id);
        let conn = get_connection(&self.pool)?;
        let existed = monitors::delete_monitor(&conn, id)?;
        if existed {
            log::info!("Deleted monitor {}", id);
        }
        Ok(existed)
    }

    // ── configuration ────────────────────────────────────────────────────────

    pub fn telegram_config(&self) -> TelegramSettings {
        self.settings.telegram()
    }

    pub fn update_telegram_config(&self, cfg: TelegramSettings) -> AppResult<TelegramSettings> {
        self.settings.set_telegram(cfg)?;
        Ok(self.settings.telegram())
    }

    /// Send the diagnostic message with not-yet-persisted credentials. The
    /// stored config is untouched either way.
    pub async fn test_telegram(&self, bot_token: &str, chat_id: &str) -> AppResult<()> {
        if bot_token.is_empty() || chat_id.is_empty() {
            return Err(AppError::Validation("botToken and chatId are required".to_string()));
        }
        let cfg = TelegramSettings {
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            enabled: true,
        };
        let proxy = self.settings.proxy_url();
        self.notifier.send(&cfg, proxy.as_deref(), TEST_MESSAGE).await
    }

    pub fn proxy_config(&self) -> ProxySettings {
        self.settings.proxy()
    }

    /// Persist new proxy settings. An enabled proxy must carry a parseable
    /// URL; checks already in flight keep the proxy they started with.
    pub fn update_proxy_config(&self, cfg: ProxySettings) -> AppResult<ProxySettings> {
        if cfg.enabled {
            if cfg.url.is_empty() {
                return Err(AppError::Validation("proxy URL is required when the proxy is enabled".to_string()));
            }
            url::Url::parse(&cfg.url)
                .map_err(|e| AppError::Validation(format!("invalid proxy URL: {e}")))?;
        }
        self.settings.set_proxy(cfg)?;
        Ok(self.settings.proxy())
    }

    // ── status ───────────────────────────────────────────────────────────────

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            active_jobs: self.scheduler.active_jobs(),
            next_check_at: self.scheduler.next_check_at(),
        }
    }
}

/// Resolve a requested polling interval: absent means the default, zero is
/// rejected, anything below the floor is clamped up to it.
fn normalize_interval(requested: Option<u32>) -> AppResult<u32> {
    match requested {
        None => Ok(DEFAULT_INTERVAL_SECS),
        Some(0) => Err(AppError::Validation("interval must be a positive number of seconds".to_string())),
        Some(value) => Ok(value.max(MIN_INTERVAL_SECS)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_defaults_and_clamps() {
        assert_eq!(normalize_interval(None).unwrap(), DEFAULT_INTERVAL_SECS);
        assert_eq!(normalize_interval(Some(5)).unwrap(), MIN_INTERVAL_SECS);
        assert_eq!(normalize_interval(Some(60)).unwrap(), 60);
        assert!(normalize_interval(Some(0)).is_err());
    }

    #[test]
    fn create_request_deserializes_with_defaults() {
        let req: CreateMonitorsRequest =
            serde_json::from_str(r#"{"urls": "https://testflight.apple.com/join/abc"}"#).unwrap();
        assert!(req.auto_start, "autoStart defaults to true");
        assert!(req.interval.is_none());
        assert!(req.notify_mode.is_none());
    }

    #[test]
    fn status_response_serializes_camel_case() {
        let status = StatusResponse {
            active_jobs: 2,
            next_check_at: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["activeJobs"], 2);
        assert!(json.get("nextCheckAt").is_some());
    }
}
