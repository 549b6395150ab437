//! Capability interface over a remote, asynchronously rendering listing page.
//!
//! The crawler only ever sees [`TableSnapshot`] values and issues [`Control`] requests, so the
//! pagination state machine can be driven by a real browser session or by an in-memory fake.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use url::Url;

/// Interval between snapshots while waiting on a condition.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors surfaced by a UI backend. Any of these aborts the crawl for the current filter.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The session could not be created or has gone away.
    #[error("ui session unavailable: {0}")]
    Session(String),
    /// Transport failure talking to the backend.
    #[error("ui backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The backend answered with an error payload or an unexpected shape.
    #[error("ui backend protocol error: {0}")]
    Protocol(String),
    /// The requested control does not exist on the current page.
    #[error("ui control missing: {0}")]
    MissingControl(&'static str),
}

/// One pagination item (`li.page-item`) of the rendered page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageItem {
    /// Marked as the current page.
    pub active: bool,
    /// Marked as not clickable.
    pub disabled: bool,
}

impl PageItem {
    /// Derives the flags from an element class list.
    pub fn from_classes(classes: &str) -> Self {
        let lowered = classes.to_ascii_lowercase();
        Self {
            active: lowered.contains("active"),
            disabled: lowered.contains("disabled"),
        }
    }
}

/// What the crawler can observe about the page at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    /// Outer HTML of the listing table, empty when no table is rendered.
    pub table_html: String,
    /// Value of the pagination index field.
    pub page_index: String,
    /// Pagination items in display order.
    pub page_items: Vec<PageItem>,
    /// Whether the page-size selector is present.
    pub page_size_control: bool,
}

/// UI actions the crawler may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Select a page size in the pagination widget.
    PageSize(usize),
    /// Click the pagination item at this position.
    PageItem(usize),
}

/// A live page the crawler can observe and poke.
#[async_trait]
pub trait TableDriver: Send {
    /// Navigates to the listing URL.
    async fn load(&mut self, url: &Url) -> Result<(), DriverError>;

    /// Captures the current rendered state.
    async fn snapshot(&mut self) -> Result<TableSnapshot, DriverError>;

    /// Performs a UI action.
    async fn invoke(&mut self, control: Control) -> Result<(), DriverError>;

    /// Polls until `predicate` holds or `timeout` elapses; `Ok(false)` means timed out.
    async fn wait_for(
        &mut self,
        predicate: &(dyn for<'s> Fn(&'s TableSnapshot) -> bool + Send + Sync),
        timeout: Duration,
    ) -> Result<bool, DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.snapshot().await?;
            if predicate(&snapshot) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Releases the backend session.
    async fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Opens one driver session per job.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Creates a fresh session.
    async fn connect(&self) -> Result<Box<dyn TableDriver>, DriverError>;
}
