//! TestFlight join page fetching and availability classification.
//!
//! The checker is behind a trait so the scheduler and the facade can be
//! exercised with scripted fakes; the production implementation fetches the
//! public join page (optionally through a proxy) and pattern-matches the
//! known "beta is full" / join-button markers. The page is an unversioned
//! external document; if Apple rewords it, the markers here need updating.

use crate::core::config::monitor::{CHECK_TIMEOUT_SECS, USER_AGENT};
use crate::core::error::{AppError, AppResult};
use async_trait::async_trait;
use lazy_regex::regex_captures;
use select::document::Document;
use select::predicate::{Name, Or};
use std::time::Duration;

/// Result of classifying one join page.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// True when the beta currently has open slots.
    pub available: bool,
    /// App name resolved from the page meta tags; empty if absent.
    pub app_name: String,
    /// App icon URL from the page meta tags; empty if absent.
    pub icon_url: String,
    /// Short human-readable classification ("Beta is full", ...).
    pub message: String,
}

/// Fetches and classifies a single TestFlight link's current state.
#[async_trait]
pub trait AvailabilityChecker: Send + Sync {
    /// Fetch `testflight_url` (through `proxy` if given) and classify it.
    ///
    /// Transient transport failures and unrecognized pages come back as
    /// errors; the caller records them without stopping the schedule.
    async fn check(&self, testflight_url: &str, proxy: Option<&str>) -> AppResult<CheckOutcome>;
}

/// Extract the app id from a TestFlight join URL.
pub fn parse_join_url(url: &str) -> AppResult<String> {
    match regex_captures!(r"testflight\.apple\.com/join/([a-zA-Z0-9]+)", url) {
        Some((_, app_id)) => Ok(app_id.to_string()),
        None => Err(AppError::Validation(format!("invalid TestFlight URL: {url}"))),
    }
}

/// Production checker hitting the public join page.
pub struct TestFlightChecker {
    timeout: Duration,
}

impl TestFlightChecker {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(CHECK_TIMEOUT_SECS),
        }
    }
}

impl Default for TestFlightChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AvailabilityChecker for TestFlightChecker {
    async fn check(&self, testflight_url: &str, proxy: Option<&str>) -> AppResult<CheckOutcome> {
        // Client built per check so a proxy change applies to every check
        // dispatched after it.
        let mut builder = reqwest::Client::builder().timeout(self.timeout).user_agent(USER_AGENT);
        if let Some(proxy_url) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        let client = builder.build()?;

        let resp = client
            .get(testflight_url)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            )
            .header("Accept-Language", "en-US,en;q=0.5")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AppError::HttpStatus(resp.status()));
        }

        let body = resp.text().await?;
        classify_page(&body)
    }
}

/// Strip the boilerplate around the app name in the page titles:
/// "Join the Foo beta - TestFlight - Apple" → "Foo".
fn clean_title(title: &str) -> String {
    let mut t = title.trim();
    t = t.strip_suffix(" - TestFlight - Apple").unwrap_or(t);
    t = t.strip_prefix("Join the ").unwrap_or(t);
    t = t.strip_suffix(" beta").unwrap_or(t);
    t.trim().to_string()
}

fn meta_content<'a>(doc: &'a Document, attr: &str, value: &str) -> Option<String> {
    doc.find(Name("meta"))
        .find(|n| n.attr(attr) == Some(value))
        .and_then(|n| n.attr("content"))
        .map(|s| s.to_string())
}

/// Classify one join page body. Pure so the marker matching is testable
/// without a server.
pub fn classify_page(html: &str) -> AppResult<CheckOutcome> {
    let doc = Document::from(html);

    let app_name = meta_content(&doc, "property", "og:title")
        .or_else(|| meta_content(&doc, "name", "twitter:title"))
        .or_else(|| doc.find(Name("title")).next().map(|n| n.text()))
        .map(|t| clean_title(&t))
        .unwrap_or_default();

    let icon_url = meta_content(&doc, "property", "og:image")
        .or_else(|| meta_content(&doc, "name", "twitter:image"))
        .unwrap_or_default();

    let text = html.to_lowercase();

    if text.contains("beta is full") {
        return Ok(CheckOutcome {
            available: false,
            app_name,
            icon_url,
            message: "Beta is full".to_string(),
        });
    }

    if text.contains("isn't accepting") || text.contains("not accepting") {
        return Ok(CheckOutcome {
            available: false,
            app_name,
            icon_url,
            message: "Not accepting new testers".to_string(),
        });
    }

    let has_join_button = doc.find(Or(Name("a"), Name("button"))).any(|n| {
        let label = n.text().to_lowercase();
        label.contains("start testing") || label.contains("accept")
    });

    if has_join_button {
        return Ok(CheckOutcome {
            available: true,
            app_name,
            icon_url,
            message: "Beta has open slots".to_string(),
        });
    }

    if text.contains("view in app store") || text.contains("open in testflight") {
        return Ok(CheckOutcome {
            available: true,
            app_name,
            icon_url,
            message: "Beta available".to_string(),
        });
    }

    Err(AppError::Classification(
        "no availability marker found on page".to_string(),
    ))
}
