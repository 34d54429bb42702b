//! Client-facing data plane.

use crate::{ApiError, ApiResult, AppState};
use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use clawbridge_core::{ClientIdentity, EntityState, PendingAction};
use clawbridge_error::{MediationError, MediationErrorKind};
use clawbridge_security::{CallOutcome, EntityOutcome, SensorSummary};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, instrument};

/// Header listing the parameters clamped on a forwarded call.
pub const CLAMPED_HEADER: &str = "x-clawbridge-clamped";

/// Routes of the data plane.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/states", get(list_states))
        .route("/api/states/:entity_id", get(get_state))
        .route("/api/ai-sensors", get(sensor_summary))
        .route("/api/services", get(list_services))
        .route("/api/services/:domain/:service", post(call_service))
        .route("/api/actions/:action_id", get(action_status))
        .route("/api/history/period/:start", get(history))
        .route("/api/websocket", get(crate::ws::websocket))
        .route("/health", get(health))
}

/// Bearer token from an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim())
    } else {
        None
    }
}

/// Source address of the connection, IPv4-mapped addresses unwrapped.
pub fn source_ip(parts: &Parts) -> IpAddr {
    match parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().to_canonical(),
        None => {
            debug!("No connection info; attributing request to the unspecified address");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

/// Authenticated caller of a data-plane route.
#[derive(Debug, Clone)]
pub struct Client(pub ClientIdentity);

#[async_trait]
impl FromRequestParts<AppState> for Client {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let ip = source_ip(parts);
        let identity = state.mediator.authenticate(bearer_token(&parts.headers), ip)?;
        Ok(Client(identity))
    }
}

#[track_caller]
fn bad_request(message: impl Into<String>) -> ApiError {
    MediationError::new(MediationErrorKind::BadRequest(message.into())).into()
}

#[instrument(skip_all)]
async fn list_states(State(state): State<AppState>, Client(identity): Client) -> ApiResult<Json<Vec<EntityState>>> {
    Ok(Json(state.mediator.read_states(&identity).await?))
}

#[instrument(skip_all, fields(entity_id = %entity_id))]
async fn get_state(
    State(state): State<AppState>,
    Client(identity): Client,
    Path(entity_id): Path<String>,
) -> ApiResult<Json<EntityState>> {
    Ok(Json(state.mediator.read_state(&identity, &entity_id).await?))
}

#[instrument(skip_all)]
async fn sensor_summary(State(state): State<AppState>, Client(identity): Client) -> ApiResult<Response> {
    let summary: SensorSummary = state.mediator.sensor_summary(&identity).await?;
    Ok(([(header::CACHE_CONTROL, "no-cache")], Json(summary)).into_response())
}

#[instrument(skip_all)]
async fn list_services(
    State(state): State<AppState>,
    Client(identity): Client,
) -> ApiResult<Json<BTreeMap<String, Vec<String>>>> {
    Ok(Json(state.mediator.list_services(&identity).await?))
}

fn pending_body(entity_id: &str, action: &PendingAction) -> Value {
    json!({
        "entity_id": entity_id,
        "action_id": action.id(),
        "status": action.status(),
        "expires_at": action.expires_at(),
    })
}

fn outcome_body(outcome: &EntityOutcome) -> Value {
    match outcome.outcome() {
        Ok(CallOutcome::Completed { response, clamped }) => json!({
            "entity_id": outcome.entity_id(),
            "status": "completed",
            "response": response,
            "clamped": clamped,
        }),
        Ok(CallOutcome::Pending { action, .. }) => pending_body(outcome.entity_id(), action),
        Err(err) => json!({
            "entity_id": outcome.entity_id(),
            "status": "error",
            "error": err.kind.client_message(),
            "reason": err.kind.reason_code(),
        }),
    }
}

/// Status of an aggregated multi-target response: 202 when anything is
/// pending, 200 when anything completed, otherwise the first refusal.
fn aggregate_status(outcomes: &[EntityOutcome]) -> StatusCode {
    if outcomes
        .iter()
        .any(|o| matches!(o.outcome(), Ok(CallOutcome::Pending { .. })))
    {
        return StatusCode::ACCEPTED;
    }
    if outcomes.iter().any(|o| o.outcome().is_ok()) {
        return StatusCode::OK;
    }
    outcomes
        .iter()
        .find_map(|o| o.outcome().as_ref().err())
        .and_then(|err| StatusCode::from_u16(err.kind.http_status()).ok())
        .unwrap_or(StatusCode::BAD_REQUEST)
}

fn single_response(outcome: EntityOutcome) -> ApiResult<Response> {
    let entity_id = outcome.entity_id().clone();
    match outcome.into_outcome()? {
        CallOutcome::Completed { response, clamped } => {
            let mut reply = (StatusCode::OK, Json(response)).into_response();
            if !clamped.is_empty() {
                let names = clamped.iter().map(|c| c.param.as_str()).collect::<Vec<_>>().join(",");
                if let Ok(value) = HeaderValue::from_str(&names) {
                    reply.headers_mut().insert(CLAMPED_HEADER, value);
                }
            }
            Ok(reply)
        }
        CallOutcome::Pending { action, .. } => {
            Ok((StatusCode::ACCEPTED, Json(pending_body(&entity_id, &action))).into_response())
        }
    }
}

#[instrument(skip_all, fields(domain = %domain, service = %service))]
async fn call_service(
    State(state): State<AppState>,
    Client(identity): Client,
    Path((domain, service)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Response> {
    let body: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid JSON body: {}", e)))?
    };
    let mut outcomes = state.mediator.invoke(&identity, &domain, &service, body).await?;
    if outcomes.len() == 1 {
        if let Some(outcome) = outcomes.pop() {
            return single_response(outcome);
        }
    }
    let status = aggregate_status(&outcomes);
    let results: Vec<Value> = outcomes.iter().map(outcome_body).collect();
    Ok((status, Json(json!({ "results": results }))).into_response())
}

#[instrument(skip_all, fields(action_id = %action_id))]
async fn action_status(
    State(state): State<AppState>,
    Client(identity): Client,
    Path(action_id): Path<String>,
) -> ApiResult<Json<PendingAction>> {
    Ok(Json(state.mediator.action_status(&identity, &action_id)?))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    filter_entity_id: Option<String>,
    end_time: Option<String>,
}

fn parse_instant(field: &str, text: &str) -> Result<DateTime<Utc>, ApiError> {
    // An unescaped `+` in a query string arrives as a space.
    DateTime::parse_from_rfc3339(&text.replace(' ', "+"))
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| bad_request(format!("{} is not an RFC 3339 timestamp: {}", field, e)))
}

#[instrument(skip_all)]
async fn history(
    State(state): State<AppState>,
    Client(identity): Client,
    Path(start): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Value>> {
    let start = parse_instant("start", &start)?;
    let end = params
        .end_time
        .as_deref()
        .map(|text| parse_instant("end_time", text))
        .transpose()?;
    let entity_ids: Vec<String> = params
        .filter_entity_id
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();
    Ok(Json(state.mediator.history(&identity, start, end, entity_ids).await?))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "healthy", "uptime_secs": state.uptime_secs() })),
    )
}
