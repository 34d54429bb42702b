//! REST client for a Home-Assistant-style platform.

use async_trait::async_trait;
use chrono::SecondsFormat;
use clawbridge_core::{EntityState, UpstreamEvent};
use clawbridge_error::{UpstreamError, UpstreamErrorKind};
use clawbridge_security::{HistoryQuery, Upstream};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

/// Error bodies are cut to this many characters.
const MAX_ERROR_BODY_CHARS: usize = 200;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Deserialize)]
struct ServiceDomain {
    domain: String,
    #[serde(default)]
    services: Map<String, Value>,
}

fn http_error(err: reqwest::Error) -> UpstreamError {
    UpstreamError::new(UpstreamErrorKind::Http(err.to_string()))
}

fn decode_error(err: reqwest::Error) -> UpstreamError {
    UpstreamError::new(UpstreamErrorKind::Decode(err.to_string()))
}

/// Turn a non-success response into a `Status` error carrying a short body.
async fn require_success(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::new(UpstreamErrorKind::Status {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    }))
}

/// Platform client over the REST API.
///
/// State changes arrive separately through the
/// [`EventListener`](crate::EventListener), which publishes into the channel
/// this client hands out from [`subscribe_events`](Upstream::subscribe_events).
#[derive(Debug, Clone)]
pub struct HomeAssistantClient {
    http: Client,
    base_url: String,
    events: broadcast::Sender<UpstreamEvent>,
}

impl HomeAssistantClient {
    /// Client for `base_url` (without `/api`).
    ///
    /// # Errors
    ///
    /// `Auth` when the token is not a valid header value, `Http` when the
    /// HTTP client cannot be built.
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                UpstreamError::new(UpstreamErrorKind::Auth(
                    "token is not a valid header value".to_string(),
                ))
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        let http = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(http_error)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            events,
        })
    }

    /// Sender the event listener publishes into.
    pub fn event_sender(&self) -> broadcast::Sender<UpstreamEvent> {
        self.events.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }
}

#[async_trait]
impl Upstream for HomeAssistantClient {
    #[instrument(skip(self))]
    async fn query_all_states(&self) -> Result<Vec<EntityState>, UpstreamError> {
        let response = self.http.get(self.url("states")).send().await.map_err(http_error)?;
        let states: Vec<EntityState> = require_success(response).await?.json().await.map_err(decode_error)?;
        debug!(count = states.len(), "Fetched states");
        Ok(states)
    }

    #[instrument(skip(self))]
    async fn query_state(&self, entity_id: &str) -> Result<Option<EntityState>, UpstreamError> {
        let response = self
            .http
            .get(self.url(&format!("states/{}", entity_id)))
            .send()
            .await
            .map_err(http_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let state = require_success(response).await?.json().await.map_err(decode_error)?;
        Ok(Some(state))
    }

    #[instrument(skip(self))]
    async fn list_services(&self) -> Result<BTreeMap<String, Vec<String>>, UpstreamError> {
        let response = self.http.get(self.url("services")).send().await.map_err(http_error)?;
        let domains: Vec<ServiceDomain> = require_success(response).await?.json().await.map_err(decode_error)?;
        Ok(domains
            .into_iter()
            .map(|d| (d.domain, d.services.into_iter().map(|(name, _)| name).collect()))
            .collect())
    }

    #[instrument(skip(self, body))]
    async fn invoke_service(
        &self,
        domain: &str,
        service: &str,
        body: Map<String, Value>,
        return_response: bool,
    ) -> Result<Value, UpstreamError> {
        let mut url = self.url(&format!("services/{}/{}", domain, service));
        if return_response {
            url.push_str("?return_response");
        }
        let response = self
            .http
            .post(url)
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(http_error)?;
        let response = require_success(response).await.inspect_err(|e| {
            warn!(domain, service, error = %e, "Service call failed");
        })?;
        let text = response.text().await.map_err(decode_error)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| UpstreamError::new(UpstreamErrorKind::Decode(e.to_string())))
    }

    #[instrument(skip(self, query), fields(entities = query.entity_ids().len()))]
    async fn query_history(&self, query: &HistoryQuery) -> Result<Value, UpstreamError> {
        let start = query.start().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut params = vec![
            ("filter_entity_id", query.entity_ids().join(",")),
            ("minimal_response", "true".to_string()),
        ];
        if let Some(end) = query.end() {
            params.push(("end_time", end.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        let response = self
            .http
            .get(self.url(&format!("history/period/{}", start)))
            .query(&params)
            .send()
            .await
            .map_err(http_error)?;
        require_success(response).await?.json().await.map_err(decode_error)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.events.subscribe()
    }
}
