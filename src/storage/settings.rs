//! Telegram and proxy settings: JSON blobs in the `settings` table plus a
//! process-wide in-memory store behind read-write locks.
//!
//! Reads are cheap clones taken by every in-flight check; writes persist
//! first and then swap the cached value, so checks already dispatched may
//! still observe the previous configuration.

use crate::core::error::AppResult;
use crate::storage::db::{get_connection, DbPool};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

const TELEGRAM_KEY: &str = "telegram";
const PROXY_KEY: &str = "proxy";

/// Telegram bot credentials and the global notification switch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TelegramSettings {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            enabled: true,
        }
    }
}

/// Outbound proxy used by the checker and the notifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

fn default_true() -> bool {
    true
}

fn get_value<T: serde::de::DeserializeOwned + Default>(conn: &Connection, key: &str) -> AppResult<T> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?;

    match raw {
        Some(json) => match serde_json::from_str(&json) {
            Ok(value) => Ok(value),
            Err(e) => {
                log::warn!("Corrupt settings blob for '{}', falling back to defaults: {}", key, e);
                Ok(T::default())
            }
        },
        None => Ok(T::default()),
    }
}

fn put_value<T: Serialize>(conn: &Connection, key: &str, value: &T) -> AppResult<()> {
    let json = serde_json::to_string(value).map_err(|e| anyhow::anyhow!("serialize settings: {}", e))?;
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = ?2",
        params![key, json],
    )?;
    Ok(())
}

pub fn load_telegram(conn: &Connection) -> AppResult<TelegramSettings> {
    get_value(conn, TELEGRAM_KEY)
}

pub fn save_telegram(conn: &Connection, cfg: &TelegramSettings) -> AppResult<()> {
    put_value(conn, TELEGRAM_KEY, cfg)
}

pub fn load_proxy(conn: &Connection) -> AppResult<ProxySettings> {
    get_value(conn, PROXY_KEY)
}

pub fn save_proxy(conn: &Connection, cfg: &ProxySettings) -> AppResult<()> {
    put_value(conn, PROXY_KEY, cfg)
}

/// Process-wide settings handle shared by the facade, scheduler, and every
/// in-flight check.
pub struct SettingsStore {
    pool: Arc<DbPool>,
    telegram: RwLock<TelegramSettings>,
    proxy: RwLock<ProxySettings>,
}

impl SettingsStore {
    /// Load persisted settings (or defaults) into the in-memory store.
    pub fn load(pool: Arc<DbPool>) -> AppResult<Self> {
        let conn = get_connection(&pool)?;
        let telegram = load_telegram(&conn)?;
        let proxy = load_proxy(&conn)?;
        drop(conn);

        Ok(Self {
            pool,
            telegram: RwLock::new(telegram),
            proxy: RwLock::new(proxy),
        })
    }

    pub fn telegram(&self) -> TelegramSettings {
        self.telegram.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn proxy(&self) -> ProxySettings {
        self.proxy.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// The proxy URL to use for outbound requests, or None when disabled.
    pub fn proxy_url(&self) -> Option<String> {
        let proxy = self.proxy();
        if proxy.enabled && !proxy.url.is_empty() {
            Some(proxy.url)
        } else {
            None
        }
    }

    /// Persist and publish new Telegram settings. Checks already in flight
    /// keep the snapshot they took.
    pub fn set_telegram(&self, cfg: TelegramSettings) -> AppResult<()> {
        let conn = get_connection(&self.pool)?;
        save_telegram(&conn, &cfg)?;
        drop(conn);

        *self.telegram.write().unwrap_or_else(|p| p.into_inner()) = cfg;
        Ok(())
    }

    /// Persist and publish new proxy settings.
    pub fn set_proxy(&self, cfg: ProxySettings) -> AppResult<()> {
        let conn = get_connection(&self.pool)?;
        save_proxy(&conn, &cfg)?;
        drop(conn);

        *self.proxy.write().unwrap_or_else(|p| p.into_inner()) = cfg;
        Ok(())
    }
}
