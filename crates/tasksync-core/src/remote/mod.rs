//! Remote service boundary: adapter trait, wire types and the rate-limited
//! client every outbound call goes through.

mod client;
mod error;
mod http;
#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::models::Fields;
use crate::util::parse_timestamp;

pub use client::{CallOptions, RateLimitedClient, RetryPolicy};
pub use error::{ErrorKind, RemoteError};
pub use http::HttpRemoteAdapter;

/// A record as the remote service reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    #[serde(rename = "id")]
    pub remote_id: String,
    #[serde(rename = "unique_id", default)]
    pub unique_external_id: Option<String>,
    #[serde(default)]
    pub fields: Fields,
    /// Last edit on the remote side (Unix ms)
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_edited: i64,
    /// Archived / in the remote trash
    #[serde(default)]
    pub archived: bool,
}

/// Edit-time window for a page query. `edited_since` is inclusive,
/// `edited_before` exclusive; `None` leaves that side open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageFilter {
    pub edited_since: Option<i64>,
    pub edited_before: Option<i64>,
}

impl PageFilter {
    pub const fn contains(&self, last_edited: i64) -> bool {
        let after_start = match self.edited_since {
            Some(since) => last_edited >= since,
            None => true,
        };
        let before_end = match self.edited_before {
            Some(before) => last_edited < before,
            None => true,
        };
        after_start && before_end
    }
}

/// One page of a newest-first query.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub records: Vec<RemoteRecord>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Operations the remote service offers for one entity kind.
///
/// Implementations classify failures into [`RemoteError`] themselves; the
/// engine never inspects transport details.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Fetch one page of records edited inside `filter`, newest first.
    async fn fetch_page(
        &self,
        filter: &PageFilter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page, RemoteError>;

    /// Create a record and return it as stored remotely.
    async fn create(&self, payload: &Fields) -> Result<RemoteRecord, RemoteError>;

    /// Apply `payload` to an existing record.
    async fn update(&self, remote_id: &str, payload: &Fields)
        -> Result<RemoteRecord, RemoteError>;

    /// Delete (archive) a record.
    async fn delete(&self, remote_id: &str) -> Result<(), RemoteError>;
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Millis(i64),
        Text(String),
    }

    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Millis(ms) => Ok(ms),
        RawTimestamp::Text(text) => parse_timestamp(&text).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid timestamp: {text}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_record_accepts_millis_and_rfc3339() {
        let from_ms: RemoteRecord =
            serde_json::from_str(r#"{"id": "r1", "last_edited": 1700000000000}"#).unwrap();
        assert_eq!(from_ms.last_edited, 1_700_000_000_000);
        assert!(from_ms.fields.is_empty());
        assert!(!from_ms.archived);

        let from_text: RemoteRecord = serde_json::from_str(
            r#"{"id": "r2", "unique_id": "TASK-7", "last_edited": "1970-01-01T00:01:00Z",
                "fields": {"title": "x"}, "archived": true}"#,
        )
        .unwrap();
        assert_eq!(from_text.last_edited, 60_000);
        assert_eq!(from_text.unique_external_id.as_deref(), Some("TASK-7"));
        assert!(from_text.archived);
    }

    #[test]
    fn page_filter_bounds() {
        let filter = PageFilter {
            edited_since: Some(100),
            edited_before: Some(200),
        };
        assert!(filter.contains(100));
        assert!(filter.contains(199));
        assert!(!filter.contains(200));
        assert!(!filter.contains(99));
        assert!(PageFilter::default().contains(i64::MIN));
    }
}
