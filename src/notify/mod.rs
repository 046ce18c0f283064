//! Telegram message delivery.
//!
//! One attempt per call, no retries. A failed notification is the caller's
//! to log, and it never changes monitor state. The trait exists so scheduler
//! tests can swap in a recording fake.

use crate::core::config::telegram::{API_BASE, SEND_TIMEOUT_SECS, TEST_MESSAGE};
use crate::core::error::{AppError, AppResult};
use crate::storage::settings::TelegramSettings;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Delivers a message to the configured Telegram chat.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `text` (Markdown) using `cfg`. Fails with a `Config` error when
    /// notifications are disabled or credentials are missing, and with a
    /// `Notification` error when the Bot API rejects the call.
    async fn send(&self, cfg: &TelegramSettings, proxy: Option<&str>, text: &str) -> AppResult<()>;
}

/// Production notifier posting `sendMessage` to the Bot API.
pub struct TelegramNotifier {
    api_base: String,
    timeout: Duration,
}

impl TelegramNotifier {
    pub fn new() -> Self {
        Self::with_api_base(API_BASE)
    }

    /// Point the notifier at a different Bot API base (used by tests).
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            timeout: Duration::from_secs(SEND_TIMEOUT_SECS),
        }
    }

    /// Connectivity test: send the fixed diagnostic message using explicitly
    /// supplied, not-yet-persisted credentials.
    pub async fn send_test_message(&self, bot_token: &str, chat_id: &str, proxy: Option<&str>) -> AppResult<()> {
        let cfg = TelegramSettings {
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            enabled: true,
        };
        self.send(&cfg, proxy, TEST_MESSAGE).await
    }
}

impl Default for TelegramNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Telegram alert for a beta that just opened up.
pub fn format_alert(app_name: &str, message: &str, url: &str) -> String {
    let name = if app_name.is_empty() { "TestFlight beta" } else { app_name };
    format!("🎉 *TestFlight slot available!*\n\n*{name}*\n{message}\n\n[Join the beta]({url})")
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, cfg: &TelegramSettings, proxy: Option<&str>, text: &str) -> AppResult<()> {
        if !cfg.enabled {
            return Err(AppError::Config("telegram notifications are disabled".to_string()));
        }
        if cfg.bot_token.is_empty() || cfg.chat_id.is_empty() {
            return Err(AppError::Config("telegram bot token and chat id are not set".to_string()));
        }

        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(proxy_url) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        let client = builder.build()?;

        let url = format!("{}/bot{}/sendMessage", self.api_base, cfg.bot_token);
        let resp = client
            .post(&url)
            .json(&json!({
                "chat_id": cfg.chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            // Telegram error bodies carry a human-readable description.
            let description = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("description").and_then(|d| d.as_str()).map(String::from))
                .unwrap_or_default();
            let detail = if description.is_empty() {
                format!("telegram API returned {status}")
            } else {
                format!("telegram API returned {status}: {description}")
            };
            return Err(AppError::Notification(detail));
        }

        Ok(())
    }
}
