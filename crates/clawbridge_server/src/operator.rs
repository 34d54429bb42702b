//! Operator surface, mounted under `/operator`.
//!
//! Trusted: it is expected to sit behind the platform's own authenticated
//! proxy. When `operator_token` is configured every request must also carry it
//! as a bearer token.

use crate::api::bearer_token;
use crate::{ApiError, ApiResult, AppState};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use clawbridge_core::{
    AccessLevel, ActionStatus, ApiKeySummary, AuditQuery, AuditRecord, AuditStats, EntityGroup,
    EntityPolicy, PendingAction, Schedule, entity_domain,
};
use clawbridge_error::{MediationError, MediationErrorKind};
use clawbridge_security::{
    GroupUpdate, IssuedKey, MediatorSettings, NewGroup, NewSchedule, OPERATOR_SOURCE, PolicyView,
    ScheduleUpdate,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

/// Routes of the operator surface, guarded by the operator token when one is set.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/entities", get(list_entities))
        .route("/policies", get(list_policies).put(bulk_set_policies))
        .route(
            "/policies/:entity_id",
            get(get_policy).put(set_policy).delete(delete_policy),
        )
        .route("/policies/:entity_id/schedule", put(assign_schedule))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/schedules/:schedule_id",
            put(update_schedule).delete(delete_schedule),
        )
        .route("/keys", get(list_keys).post(issue_key))
        .route("/keys/:key_id", delete(revoke_key))
        .route("/groups", get(list_groups).post(create_group))
        .route("/groups/:group_id", put(update_group).delete(delete_group))
        .route("/groups/:group_id/access", put(set_group_access))
        .route("/audit", get(query_audit).delete(clear_audit))
        .route("/audit/stats", get(audit_stats))
        .route("/actions", get(list_actions))
        .route("/actions/:action_id/approve", post(approve_action))
        .route("/actions/:action_id/deny", post(deny_action))
        .route("/settings", get(get_settings).put(update_settings))
        .route("/health", get(health))
        .route_layer(middleware::from_fn_with_state(state, require_operator))
}

async fn require_operator(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = state.operator_token.0.as_deref() {
        let presented = bearer_token(request.headers()).unwrap_or_default();
        if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            warn!(path = %request.uri().path(), "Operator request without a valid token");
            return ApiError::from(MediationError::new(MediationErrorKind::Unauthorized(
                "operator token required".to_string(),
            )))
            .into_response();
        }
    }
    next.run(request).await
}

#[track_caller]
fn not_found(what: String) -> ApiError {
    MediationError::new(MediationErrorKind::NotFound(what)).into()
}

// Entities and policies

#[derive(Debug, Serialize)]
struct EntitySummary {
    entity_id: String,
    state: String,
    friendly_name: String,
    access_level: AccessLevel,
    max_level: AccessLevel,
}

/// Every upstream entity grouped by domain, with its current exposure.
#[instrument(skip_all)]
async fn list_entities(State(state): State<AppState>) -> ApiResult<Json<BTreeMap<String, Vec<EntitySummary>>>> {
    let states = state
        .mediator
        .upstream()
        .query_all_states()
        .await?;
    let registry = state.mediator.registry();
    let snapshot = registry.snapshot();
    let mut domains: BTreeMap<String, Vec<EntitySummary>> = BTreeMap::new();
    for entity in states {
        let Some(domain) = entity_domain(entity.entity_id()) else {
            continue;
        };
        domains.entry(domain.to_string()).or_default().push(EntitySummary {
            entity_id: entity.entity_id().clone(),
            state: entity.state().clone(),
            friendly_name: entity.friendly_name().to_string(),
            access_level: snapshot.access_level(entity.entity_id()),
            max_level: registry.tables().max_level_for(entity.entity_id()),
        });
    }
    Ok(Json(domains))
}

async fn list_policies(State(state): State<AppState>) -> Json<Vec<PolicyView>> {
    Json(state.mediator.registry().list_policies())
}

fn policy_view(state: &AppState, entity_id: String) -> PolicyView {
    let snapshot = state.mediator.registry().snapshot();
    PolicyView {
        policy: snapshot.policy(&entity_id).cloned().unwrap_or_default(),
        groups: snapshot.groups_of(&entity_id),
        entity_id,
    }
}

/// Absent policies read as `off`.
async fn get_policy(State(state): State<AppState>, Path(entity_id): Path<String>) -> Json<PolicyView> {
    Json(policy_view(&state, entity_id))
}

#[instrument(skip(state, policy))]
async fn set_policy(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Json(policy): Json<EntityPolicy>,
) -> ApiResult<Json<PolicyView>> {
    state.mediator.registry().set(&entity_id, policy)?;
    Ok(Json(policy_view(&state, entity_id)))
}

#[instrument(skip_all, fields(count = policies.len()))]
async fn bulk_set_policies(
    State(state): State<AppState>,
    Json(policies): Json<BTreeMap<String, EntityPolicy>>,
) -> ApiResult<Json<Value>> {
    let count = policies.len();
    state.mediator.registry().bulk_set(policies)?;
    Ok(Json(json!({ "status": "ok", "count": count })))
}

#[instrument(skip(state))]
async fn delete_policy(State(state): State<AppState>, Path(entity_id): Path<String>) -> ApiResult<Json<Value>> {
    let deleted = state.mediator.registry().delete(&entity_id)?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
struct ScheduleAssignment {
    #[serde(default)]
    schedule_id: Option<String>,
}

#[instrument(skip(state, body))]
async fn assign_schedule(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Json(body): Json<ScheduleAssignment>,
) -> ApiResult<Json<PolicyView>> {
    state
        .mediator
        .registry()
        .assign_schedule(&entity_id, body.schedule_id.as_deref())?;
    Ok(Json(policy_view(&state, entity_id)))
}

// Schedules

async fn list_schedules(State(state): State<AppState>) -> Json<Vec<Schedule>> {
    Json(state.mediator.registry().list_schedules())
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(draft): Json<NewSchedule>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    let schedule = state.mediator.registry().create_schedule(draft)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
    Json(update): Json<ScheduleUpdate>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(state.mediator.registry().update_schedule(&schedule_id, update)?))
}

async fn delete_schedule(State(state): State<AppState>, Path(schedule_id): Path<String>) -> ApiResult<Json<Value>> {
    let cleared = state.mediator.registry().delete_schedule(&schedule_id)?;
    Ok(Json(json!({ "status": "ok", "cleared_references": cleared })))
}

// API keys

#[derive(Debug, Deserialize)]
struct IssueKey {
    name: String,
    #[serde(default)]
    entity_scope: Option<BTreeSet<String>>,
    #[serde(default)]
    rate_limit_per_minute: Option<u32>,
}

async fn list_keys(State(state): State<AppState>) -> Json<Vec<ApiKeySummary>> {
    Json(state.mediator.keys().list())
}

/// The raw secret is in this response and nowhere else.
#[instrument(skip_all, fields(name = %body.name))]
async fn issue_key(State(state): State<AppState>, Json(body): Json<IssueKey>) -> ApiResult<(StatusCode, Json<IssuedKey>)> {
    let keys = state.mediator.keys();
    let was_open = keys.is_open_mode();
    let issued = keys.issue(&body.name, body.entity_scope, body.rate_limit_per_minute)?;
    if was_open {
        state.hub.disconnect_anonymous();
    }
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn revoke_key(State(state): State<AppState>, Path(key_id): Path<String>) -> ApiResult<StatusCode> {
    if state.mediator.keys().revoke(&key_id)? {
        state.hub.disconnect_key(&key_id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("key {}", key_id)))
    }
}

// Groups

#[derive(Debug, Deserialize)]
struct GroupAccess {
    access_level: AccessLevel,
}

async fn list_groups(State(state): State<AppState>) -> Json<Vec<EntityGroup>> {
    Json(state.mediator.registry().list_groups())
}

async fn create_group(
    State(state): State<AppState>,
    Json(draft): Json<NewGroup>,
) -> ApiResult<(StatusCode, Json<EntityGroup>)> {
    let group = state.mediator.registry().create_group(draft)?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn update_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(update): Json<GroupUpdate>,
) -> ApiResult<Json<EntityGroup>> {
    Ok(Json(state.mediator.registry().update_group(&group_id, update)?))
}

async fn delete_group(State(state): State<AppState>, Path(group_id): Path<String>) -> ApiResult<StatusCode> {
    state.mediator.registry().delete_group(&group_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, body))]
async fn set_group_access(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(body): Json<GroupAccess>,
) -> ApiResult<Json<Value>> {
    let updated = state
        .mediator
        .registry()
        .set_group_access(&group_id, body.access_level)?;
    Ok(Json(json!({ "status": "ok", "updated": updated })))
}

// Audit

async fn query_audit(State(state): State<AppState>, Query(query): Query<AuditQuery>) -> ApiResult<Json<Vec<AuditRecord>>> {
    Ok(Json(state.mediator.audit().query(&query)?))
}

async fn clear_audit(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.mediator.audit().clear()?;
    info!("Audit log cleared by operator");
    Ok(StatusCode::NO_CONTENT)
}

async fn audit_stats(State(state): State<AppState>) -> ApiResult<Json<AuditStats>> {
    Ok(Json(state.mediator.audit().stats()?))
}

// Confirmations

#[derive(Debug, Deserialize)]
struct ActionFilter {
    #[serde(default)]
    status: Option<ActionStatus>,
}

async fn list_actions(State(state): State<AppState>, Query(filter): Query<ActionFilter>) -> Json<Vec<PendingAction>> {
    Json(state.mediator.list_actions(filter.status))
}

#[instrument(skip(state))]
async fn approve_action(State(state): State<AppState>, Path(action_id): Path<String>) -> ApiResult<Json<PendingAction>> {
    Ok(Json(state.mediator.approve(&action_id, OPERATOR_SOURCE).await?))
}

#[instrument(skip(state))]
async fn deny_action(State(state): State<AppState>, Path(action_id): Path<String>) -> ApiResult<Json<PendingAction>> {
    Ok(Json(state.mediator.deny(&action_id, OPERATOR_SOURCE).await?))
}

// Settings and health

/// Runtime-tunable settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSettings {
    /// Mediator settings
    #[serde(flatten)]
    pub mediator: MediatorSettings,
    /// Persist audit records
    pub audit_enabled: bool,
    /// Global per-minute budget
    pub rate_limit_per_minute: u32,
    /// Confirmation window
    pub confirm_timeout_seconds: u64,
}

fn current_settings(state: &AppState) -> OperatorSettings {
    let mediator = &state.mediator;
    OperatorSettings {
        mediator: mediator.settings(),
        audit_enabled: mediator.audit().is_enabled(),
        rate_limit_per_minute: mediator.limiter().default_limit(),
        confirm_timeout_seconds: mediator.queue().timeout_secs(),
    }
}

async fn get_settings(State(state): State<AppState>) -> Json<OperatorSettings> {
    Json(current_settings(&state))
}

#[instrument(skip_all)]
async fn update_settings(State(state): State<AppState>, Json(settings): Json<OperatorSettings>) -> Json<OperatorSettings> {
    let mediator = &state.mediator;
    mediator.update_settings(settings.mediator);
    mediator.audit().set_enabled(settings.audit_enabled);
    mediator
        .limiter()
        .set_default_limit(settings.rate_limit_per_minute.clamp(1, 600));
    mediator.queue().set_timeout_secs(settings.confirm_timeout_seconds);
    Json(current_settings(&state))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mediator = &state.mediator;
    Json(json!({
        "status": "healthy",
        "uptime_secs": state.uptime_secs(),
        "registry_version": mediator.registry().version(),
        "open_mode": mediator.keys().is_open_mode(),
        "pending_actions": mediator.list_actions(Some(ActionStatus::Pending)).len(),
        "audit_enabled": mediator.audit().is_enabled(),
        "audit_write_failures": mediator.audit().write_failures(),
        "audit_skipped_records": mediator.audit().skipped_records(),
        "websocket_connections": state.hub.connection_count(),
        "dropped_connections": state.hub.dropped_connections(),
    }))
}
