//! Helpdesk API transport + processed-conversation ledger for beacon-sync.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

mod ledger;

pub use ledger::{LedgerStore, MemoryLedgerStore, SqlLedgerStore, LEDGER_TABLE};
pub use reqwest::Method;

pub const CRATE_NAME: &str = "beacon-storage";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Where the ticketing API lives and who we authenticate as.
#[derive(Debug, Clone)]
pub struct HelpdeskConfig {
    pub base_url: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response from {path} carries neither `items` nor `item`")]
    MissingPayload { path: String },
    #[error("expected {expected} in response from {path}")]
    UnexpectedShape { path: String, expected: &'static str },
}

/// Decoded API response: a collection (`items`) or a single record (`item`).
#[derive(Debug, Clone, PartialEq)]
pub enum ApiPayload {
    Items(Vec<JsonValue>),
    Item(JsonValue),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    items: Option<Vec<JsonValue>>,
    #[serde(default)]
    item: Option<JsonValue>,
}

impl ApiPayload {
    /// `items` wins when both are present.
    pub fn from_slice(path: &str, bytes: &[u8]) -> Result<Self, TransportError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|source| TransportError::Decode {
                path: path.to_string(),
                source,
            })?;
        match (envelope.items, envelope.item) {
            (Some(items), _) => Ok(Self::Items(items)),
            (None, Some(item)) => Ok(Self::Item(item)),
            (None, None) => Err(TransportError::MissingPayload {
                path: path.to_string(),
            }),
        }
    }

    pub fn into_items<T: DeserializeOwned>(self, path: &str) -> Result<Vec<T>, TransportError> {
        let Self::Items(items) = self else {
            return Err(TransportError::UnexpectedShape {
                path: path.to_string(),
                expected: "an `items` list",
            });
        };
        items
            .into_iter()
            .map(|item| decode_value(path, item))
            .collect()
    }

    pub fn into_item<T: DeserializeOwned>(self, path: &str) -> Result<T, TransportError> {
        let Self::Item(item) = self else {
            return Err(TransportError::UnexpectedShape {
                path: path.to_string(),
                expected: "a single `item`",
            });
        };
        decode_value(path, item)
    }
}

fn decode_value<T: DeserializeOwned>(path: &str, value: JsonValue) -> Result<T, TransportError> {
    serde_json::from_value(value).map_err(|source| TransportError::Decode {
        path: path.to_string(),
        source,
    })
}

/// Basic-auth JSON client for the ticketing API. No retries are attempted.
#[derive(Debug, Clone)]
pub struct HelpdeskClient {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl HelpdeskClient {
    pub fn new(config: HelpdeskConfig, http: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = http.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &http.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
            user: config.user,
            password: config.password,
        })
    }

    /// Joins by plain concatenation so query strings pass through untouched.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Issues the call and decodes the `items`/`item` envelope.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&str>,
    ) -> Result<ApiPayload, TransportError> {
        let bytes = self.execute(method, path, body).await?;
        ApiPayload::from_slice(path, &bytes)
    }

    /// Issues the call and checks the status only; update endpoints answer with an empty body.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&str>,
    ) -> Result<(), TransportError> {
        self.execute(method, path, body).await.map(|_| ())
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&str>,
    ) -> Result<Vec<u8>, TransportError> {
        let url = self.url_for(path);
        debug!(%method, %url, "helpdesk request");

        let mut req = self
            .client
            .request(method, &url)
            .basic_auth(&self.user, Some(&self.password))
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(ACCEPT, JSON_CONTENT_TYPE);
        if let Some(body) = body {
            req = req.body(body.to_string());
        }

        let resp = req.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{Conversation, ConversationSummary};

    fn client(base_url: &str) -> HelpdeskClient {
        HelpdeskClient::new(
            HelpdeskConfig {
                base_url: base_url.to_string(),
                user: "api-key".to_string(),
                password: "X".to_string(),
            },
            HttpClientConfig::default(),
        )
        .expect("client")
    }

    #[test]
    fn items_envelope_decodes_to_list() {
        let payload =
            ApiPayload::from_slice("search", br#"{"page":1,"items":[{"id":1},{"id":2}]}"#).unwrap();
        let rows: Vec<ConversationSummary> = payload.into_items("search").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].id.as_str(), "2");
    }

    #[test]
    fn item_envelope_decodes_to_single_record() {
        let payload = ApiPayload::from_slice("c", br#"{"item":{"id":9,"threads":[]}}"#).unwrap();
        let convo: Conversation = payload.into_item("c").unwrap();
        assert_eq!(convo.id.as_str(), "9");
        assert_eq!(convo.threads, Some(vec![]));
    }

    #[test]
    fn items_takes_precedence_over_item() {
        let payload = ApiPayload::from_slice("x", br#"{"items":[],"item":{"id":1}}"#).unwrap();
        assert_eq!(payload, ApiPayload::Items(vec![]));
    }

    #[test]
    fn envelope_without_items_or_item_is_an_error() {
        let err = ApiPayload::from_slice("conversations/1.json", br#"{"error":"nope"}"#).unwrap_err();
        assert!(matches!(err, TransportError::MissingPayload { ref path } if path == "conversations/1.json"));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let err = ApiPayload::from_slice("x", b"<html>gateway</html>").unwrap_err();
        assert!(matches!(err, TransportError::Decode { .. }));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let payload = ApiPayload::Item(serde_json::json!({"id": 1}));
        let err = payload.into_items::<ConversationSummary>("x").unwrap_err();
        assert!(matches!(err, TransportError::UnexpectedShape { .. }));
    }

    #[test]
    fn url_join_keeps_raw_query() {
        let c = client("https://api.example.test/v1/");
        assert_eq!(
            c.url_for("search/conversations.json?query=(status:active)"),
            "https://api.example.test/v1/search/conversations.json?query=(status:active)"
        );
        let c = client("https://api.example.test/v1");
        assert_eq!(
            c.url_for("/conversations/5.json"),
            "https://api.example.test/v1/conversations/5.json"
        );
    }
}
