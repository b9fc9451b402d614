//! Capability abstraction over a controllable browser page.
//!
//! Portal clients only speak to [`BrowserSession`]; the Chromium backend drives a
//! real page over CDP and [`fake::FakeBrowser`] replays scripted sites in tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "chromium")]
pub mod chromium;
#[cfg(any(test, feature = "testing"))]
pub mod fake;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrowserError {
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("no element matches {selector}")]
    ElementNotFound { selector: String },

    #[error("timed out after {waited:?} waiting for {condition}")]
    Timeout { condition: String, waited: Duration },

    #[error("browser protocol error: {0}")]
    Protocol(String),

    #[error("failed to launch browser: {0}")]
    Launch(String),
}

impl BrowserError {
    /// Short name of the browser capability that failed, used to label transient errors
    pub fn operation(&self) -> &'static str {
        match self {
            BrowserError::Navigation { .. } => "navigate",
            BrowserError::ElementNotFound { .. } => "locate element",
            BrowserError::Timeout { .. } => "wait",
            BrowserError::Protocol(_) => "browser command",
            BrowserError::Launch(_) => "launch",
        }
    }
}

/// Something a session can block on. Selectors may be comma-separated CSS groups,
/// in which case any member satisfies the condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    Visible(String),
    Hidden(String),
    UrlContains(String),
}

impl WaitCondition {
    pub fn visible(selector: impl Into<String>) -> Self {
        WaitCondition::Visible(selector.into())
    }

    pub fn hidden(selector: impl Into<String>) -> Self {
        WaitCondition::Hidden(selector.into())
    }

    pub fn url_contains(fragment: impl Into<String>) -> Self {
        WaitCondition::UrlContains(fragment.into())
    }
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::Visible(selector) => write!(f, "visible {}", selector),
            WaitCondition::Hidden(selector) => write!(f, "hidden {}", selector),
            WaitCondition::UrlContains(fragment) => write!(f, "url containing {}", fragment),
        }
    }
}

/// Upper bounds applied to every wait a portal client performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub navigation: Duration,
    pub element: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(30),
            element: Duration::from_secs(12),
        }
    }
}

/// One browser tab. All operations take `&mut self`, so a session is driven by a
/// single task at a time.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    async fn current_url(&mut self) -> Result<String, BrowserError>;

    /// Replace the value of an input, typing it so autocompletes react
    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), BrowserError>;

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError>;

    async fn press_key(&mut self, selector: &str, key: &str) -> Result<(), BrowserError>;

    /// Pick the first `<option>` whose label contains `needle` (case-insensitive).
    /// Returns false when nothing matched.
    async fn select_option(&mut self, selector: &str, needle: &str)
        -> Result<bool, BrowserError>;

    async fn wait_for(
        &mut self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    async fn is_visible(&mut self, selector: &str) -> Result<bool, BrowserError>;

    async fn read_text(&mut self, selector: &str) -> Result<Option<String>, BrowserError>;

    async fn read_value(&mut self, selector: &str) -> Result<Option<String>, BrowserError>;

    async fn read_attribute(
        &mut self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, BrowserError>;

    /// Text of `cell_selectors` (relative to each row) for every row matching `row_selector`
    async fn read_rows(
        &mut self,
        row_selector: &str,
        cell_selectors: &[&str],
    ) -> Result<Vec<Vec<String>>, BrowserError>;
}
