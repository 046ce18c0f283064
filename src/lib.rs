//! tfwatch - TestFlight slot monitor with Telegram notifications
//!
//! This library provides the scheduling and notification core: it polls
//! TestFlight beta-enrollment links on per-monitor intervals, classifies
//! each join page, and alerts a Telegram chat the moment a slot opens.
//!
//! # Module Structure
//!
//! - `core`: Configuration, errors, and logging
//! - `storage`: SQLite pool, migrations, monitor rows, and settings
//! - `checker`: Join page fetching and availability classification
//! - `notify`: Telegram message delivery
//! - `scheduler`: The tick loop driving all monitors
//! - `engine`: The facade an API layer talks to

pub mod checker;
pub mod core;
pub mod engine;
pub mod notify;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types for convenience
pub use core::{config, AppError, AppResult};
pub use engine::{CreateMonitorsRequest, CreatedMonitors, Engine, StatusResponse, UpdateMonitorRequest};
pub use storage::{create_pool, get_connection, DbConnection, DbPool, Monitor, MonitorStatus, NotifyMode};
