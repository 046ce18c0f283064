use once_cell::sync::Lazy;
use std::env;

/// Database file path
/// Read from DATABASE_PATH environment variable
/// Default: tfwatch.sqlite
pub static DATABASE_PATH: Lazy<String> =
    Lazy::new(|| env::var("DATABASE_PATH").unwrap_or_else(|_| "tfwatch.sqlite".to_string()));

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: tfwatch.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "tfwatch.log".to_string()));

/// Monitor scheduling configuration
pub mod monitor {
    /// Minimum polling interval in seconds. Requested intervals below this
    /// are clamped; TestFlight rate-limits aggressive pollers.
    pub const MIN_INTERVAL_SECS: u32 = 10;

    /// Default polling interval in seconds
    pub const DEFAULT_INTERVAL_SECS: u32 = 30;

    /// Timeout for a single TestFlight page fetch
    pub const CHECK_TIMEOUT_SECS: u64 = 30;

    /// Browser-like User-Agent; the join page serves a stub to unknown clients
    pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
        AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
}

/// Telegram Bot API configuration
pub mod telegram {
    /// Bot API base URL (overridable per-notifier in tests)
    pub const API_BASE: &str = "https://api.telegram.org";

    /// Timeout for a single sendMessage call
    pub const SEND_TIMEOUT_SECS: u64 = 30;

    /// Fixed diagnostic message sent by the connectivity test
    pub const TEST_MESSAGE: &str = "tfwatch: test message. Telegram notifications are working.";
}
