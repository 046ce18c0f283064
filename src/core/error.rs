use thiserror::Error;

/// Centralized error types for the application
///
/// All errors in the application are converted to this enum for consistent error handling.
/// Uses `thiserror` for automatic error conversion and display formatting.
///
/// Scheduled-check failures (`Transport`, `HttpStatus`, `Classification`) are
/// recovered locally, captured into the monitor's `last_error`, and never
/// bubble out of the scheduler. `Config`, `Validation`, and `NotFound` are
/// surfaced synchronously to the facade caller.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database connection pool errors
    #[error("Database pool error: {0}")]
    DatabasePool(#[from] r2d2::Error),

    /// Network errors reaching TestFlight or the Telegram API
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// HTTP status code errors
    #[error("HTTP request failed with status: {0}")]
    HttpStatus(reqwest::StatusCode),

    /// Page fetched but no availability marker recognized
    #[error("Classification error: {0}")]
    Classification(String),

    /// Telegram delivery failures (non-2xx from the Bot API)
    #[error("Notification error: {0}")]
    Notification(String),

    /// Operation attempted with notifications disabled or credentials missing
    #[error("Config error: {0}")]
    Config(String),

    /// Operation on an unknown monitor id
    #[error("Monitor {0} not found")]
    NotFound(i64),

    /// Validation errors (non-positive interval, empty URL list, bad proxy URL)
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anyhow errors (for general error handling)
    #[error("Application error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;
