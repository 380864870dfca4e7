//! JSON-over-HTTP adapter for one remote collection.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Page, PageFilter, RemoteAdapter, RemoteError, RemoteRecord};
use crate::models::Fields;
use crate::util::{compact_text, is_http_url, normalize_text_option};

#[derive(Clone)]
pub struct HttpRemoteAdapter {
    base_url: String,
    token: String,
    collection: String,
    client: reqwest::Client,
}

impl fmt::Debug for HttpRemoteAdapter {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HttpRemoteAdapter")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteAdapter {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        collection: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .filter(|url| is_http_url(url))
            .ok_or_else(|| {
                RemoteError::validation("base URL must include http:// or https://")
            })?;
        let token = normalize_text_option(Some(token.into()))
            .ok_or_else(|| RemoteError::auth("API token must not be empty"))?;
        let collection = normalize_text_option(Some(collection.into()))
            .ok_or_else(|| RemoteError::validation("collection name must not be empty"))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| RemoteError::unknown(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            collection,
            client,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn records_url(&self) -> String {
        format!(
            "{}/collections/{}/records",
            self.base_url,
            urlencoding::encode(&self.collection)
        )
    }

    fn record_url(&self, remote_id: &str) -> String {
        format!("{}/{}", self.records_url(), urlencoding::encode(remote_id))
    }
}

#[derive(Debug, Serialize)]
struct RecordBody<'a> {
    fields: &'a Fields,
}

#[async_trait]
impl RemoteAdapter for HttpRemoteAdapter {
    async fn fetch_page(
        &self,
        filter: &PageFilter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page, RemoteError> {
        let mut query = vec![("page_size", page_size.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        if let Some(since) = filter.edited_since {
            query.push(("edited_since", since.to_string()));
        }
        if let Some(before) = filter.edited_before {
            query.push(("edited_before", before.to_string()));
        }

        let response = self
            .client
            .get(self.records_url())
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .query(&query)
            .send()
            .await
            .map_err(classify_transport)?;
        read_json(response).await
    }

    async fn create(&self, payload: &Fields) -> Result<RemoteRecord, RemoteError> {
        let response = self
            .client
            .post(self.records_url())
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .json(&RecordBody { fields: payload })
            .send()
            .await
            .map_err(classify_transport)?;
        read_json(response).await
    }

    async fn update(
        &self,
        remote_id: &str,
        payload: &Fields,
    ) -> Result<RemoteRecord, RemoteError> {
        let response = self
            .client
            .patch(self.record_url(remote_id))
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .json(&RecordBody { fields: payload })
            .send()
            .await
            .map_err(classify_transport)?;
        read_json(response).await
    }

    async fn delete(&self, remote_id: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.record_url(remote_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(classify_transport)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    response.json::<T>().await.map_err(classify_transport)
}

async fn error_from_response(response: Response) -> RemoteError {
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    RemoteError::from_status(status.as_u16(), parse_api_error(status, &body))
        .with_retry_after(retry_after)
}

fn classify_transport(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::timeout(error.to_string())
    } else if error.is_decode() {
        RemoteError::unknown(format!("invalid response body: {error}"))
    } else if let Some(status) = error.status() {
        RemoteError::from_status(status.as_u16(), error.to_string())
    } else {
        // connect, request and body failures all mean the service was unreachable
        RemoteError::network(error.to_string())
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;
    use crate::remote::ErrorKind;

    fn adapter() -> HttpRemoteAdapter {
        HttpRemoteAdapter::new(
            "https://api.example.com/v1/",
            "secret-token",
            "time entries",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn urls_encode_collection_and_id() {
        let adapter = adapter();
        assert_eq!(
            adapter.records_url(),
            "https://api.example.com/v1/collections/time%20entries/records"
        );
        assert_eq!(
            adapter.record_url("a/b"),
            "https://api.example.com/v1/collections/time%20entries/records/a%2Fb"
        );
    }

    #[test]
    fn constructor_rejects_bad_settings() {
        let timeout = Duration::from_secs(5);
        assert!(HttpRemoteAdapter::new("api.example.com", "t", "tasks", timeout).is_err());
        let err = HttpRemoteAdapter::new("https://api.example.com", " ", "tasks", timeout)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
        assert!(HttpRemoteAdapter::new("https://api.example.com", "t", "", timeout).is_err());
    }

    #[test]
    fn debug_redacts_token() {
        let debug = format!("{:?}", adapter());
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn api_error_prefers_message_field() {
        assert_eq!(
            parse_api_error(StatusCode::UNPROCESSABLE_ENTITY, r#"{"message": " title required "}"#),
            "title required (422)"
        );
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, "  upstream down  "),
            "upstream down (502)"
        );
        assert_eq!(parse_api_error(StatusCode::NOT_FOUND, ""), "HTTP 404");
    }

    #[test]
    fn retry_after_accepts_delta_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }
}
