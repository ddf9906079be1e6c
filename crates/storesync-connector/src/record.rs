//! Remote records, result pages, and time windows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record as returned by the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Stable identifier assigned by the remote store.
    pub external_id: String,

    /// Structured key-value payload.
    pub payload: serde_json::Value,

    /// Last modification timestamp, when the store reports one.
    pub modified_at: Option<DateTime<Utc>>,
}

impl RemoteRecord {
    /// Create a record without a modification timestamp.
    pub fn new(external_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            external_id: external_id.into(),
            payload,
            modified_at: None,
        }
    }

    /// Set the modification timestamp.
    #[must_use]
    pub fn with_modified_at(mut self, ts: DateTime<Utc>) -> Self {
        self.modified_at = Some(ts);
        self
    }
}

/// One page of a fetch result.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records on this page, in the store's stable order.
    pub records: Vec<RemoteRecord>,

    /// Cursor for the next page; `None` terminates paging.
    pub next_cursor: Option<String>,
}

impl Page {
    /// Create an empty terminal page.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a terminal page with records.
    #[must_use]
    pub fn with_records(records: Vec<RemoteRecord>) -> Self {
        Self {
            records,
            next_cursor: None,
        }
    }

    /// Set the cursor for the next page.
    pub fn with_next(mut self, cursor: impl Into<String>) -> Self {
        self.next_cursor = Some(cursor.into());
        self
    }

    /// Whether another page follows.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

/// A modification-time window for batch fetches.
///
/// Half-open on either side: a missing `from` means "all time", a missing
/// `to` means "up to now". The same window can be re-fetched safely; the
/// import engine is idempotent over it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,

    /// Inclusive upper bound.
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// The unbounded window.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Window from a lower bound to now-unbounded.
    #[must_use]
    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    /// Window with both bounds.
    #[must_use]
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// Window from the beginning of time up to a bound.
    #[must_use]
    pub fn until(to: DateTime<Utc>) -> Self {
        Self {
            from: None,
            to: Some(to),
        }
    }

    /// Check whether a timestamp falls inside the window.
    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        if let Some(from) = self.from {
            if ts < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if ts > to {
                return false;
            }
        }
        true
    }
}
