//! Durable state: SQLite pool, schema migrations, monitor rows, settings.

pub mod db;
pub mod migrations;
pub mod monitors;
pub mod settings;

pub use db::{create_pool, get_connection, DbConnection, DbPool};
pub use monitors::{Monitor, MonitorStatus, NewMonitor, NotifyMode};
pub use settings::{ProxySettings, SettingsStore, TelegramSettings};
