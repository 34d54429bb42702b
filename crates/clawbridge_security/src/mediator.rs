//! The request mediator.
//!
//! Every client operation passes through [`RequestMediator`]. Service calls run
//! an ordered pipeline that stops at the first refusal:
//!
//! 1. the entity must be exposed (absent and `off` look the same)
//! 2. the path domain must match the entity domain
//! 3. a scoped key must include the entity
//! 4. `read` entities only accept read-safe services
//! 5. `confirm`/`control` entities must be inside their schedule
//! 6. the rate limiter must admit the call
//! 7. constrained parameters are clamped
//! 8. `confirm` entities queue every call for a human
//! 9. everything else is forwarded upstream
//!
//! and every outcome is written to the audit log.

use crate::{
    ApiKeyStore, ApprovalNotice, AuditLog, ConfirmationQueue, ExposureRegistry, HistoryQuery,
    NoopNotifier, NotificationDecision, Notifier, RegistrySnapshot, ScheduleEvaluator, SensorEntry,
    SensorSummary, Upstream, parse_notification_action,
};
use chrono::{DateTime, Duration, Utc};
use clawbridge_core::{
    AccessLevel, ActionStatus, AuditRecord, AuditResult, ClampedParam, ClientIdentity, Clock, EntityPolicy,
    EntityState, PendingAction, ServiceCall, ServiceRequest, StateChange, clamp_params, entity_domain,
};
use clawbridge_error::{MediationError, MediationErrorKind, MediationResult, UpstreamError};
use clawbridge_rate_limit::RequestLimiter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// How long the upstream service catalogue is reused.
const SERVICE_CATALOGUE_TTL_SECS: i64 = 300;
/// Audit attribution for operator decisions.
pub const OPERATOR_SOURCE: &str = "operator";
/// Audit attribution for decisions taken from a notification button.
pub const NOTIFICATION_SOURCE: &str = "notification";

/// Settings the operator can change while the gateway runs.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    derive_getters::Getters,
    derive_setters::Setters,
)]
#[setters(prefix = "with_")]
pub struct MediatorSettings {
    /// Source addresses admitted to the data plane; empty admits all
    #[serde(default)]
    allowed_ips: Vec<IpAddr>,
    /// Omit `unavailable` and `unknown` entities from state listings
    #[serde(default = "default_true")]
    filter_unavailable: bool,
    /// Sensor summaries carry only entity id and state
    #[serde(default)]
    compact_mode: bool,
    /// Display name of the agent in approval prompts
    #[setters(into)]
    #[serde(default = "default_agent_name")]
    agent_name: String,
}

fn default_true() -> bool {
    true
}

fn default_agent_name() -> String {
    "AI".to_string()
}

impl Default for MediatorSettings {
    fn default() -> Self {
        Self {
            allowed_ips: Vec::new(),
            filter_unavailable: true,
            compact_mode: false,
            agent_name: default_agent_name(),
        }
    }
}

/// Result of one per-entity call that passed the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    /// Forwarded upstream; the response is carried verbatim
    Completed {
        /// Upstream response
        response: Value,
        /// Parameters that were clamped before forwarding
        #[serde(skip_serializing_if = "Vec::is_empty")]
        clamped: Vec<ClampedParam>,
    },
    /// Held for human approval
    Pending {
        /// The queued action
        action: PendingAction,
        /// Parameters that were clamped before queueing
        #[serde(skip_serializing_if = "Vec::is_empty")]
        clamped: Vec<ClampedParam>,
    },
}

/// Outcome for one target of an invocation.
#[derive(Debug, Clone, derive_getters::Getters)]
pub struct EntityOutcome {
    /// Target entity
    entity_id: String,
    /// What the pipeline decided
    outcome: MediationResult<CallOutcome>,
}

impl EntityOutcome {
    /// Take the decision out.
    pub fn into_outcome(self) -> MediationResult<CallOutcome> {
        self.outcome
    }
}

#[derive(Debug, Clone)]
struct ServiceCatalogue {
    registry_version: u64,
    fetched_at: DateTime<Utc>,
    services: Arc<BTreeMap<String, Vec<String>>>,
}

/// Mediates every data-plane operation.
///
/// Build one with [`RequestMediatorBuilder`]; `build` also routes confirmation
/// expiries into the audit log.
#[derive(derive_builder::Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_unwired"))]
pub struct RequestMediator {
    /// Exposure registry
    registry: Arc<ExposureRegistry>,
    /// API keys
    keys: Arc<ApiKeyStore>,
    /// IP and key request budgets
    limiter: Arc<RequestLimiter>,
    /// Schedule gate
    schedules: ScheduleEvaluator,
    /// Pending human approvals
    queue: Arc<ConfirmationQueue>,
    /// Audit log
    audit: Arc<AuditLog>,
    /// The protected platform
    upstream: Arc<dyn Upstream>,
    /// Approval prompt delivery
    #[builder(default = "Arc::new(NoopNotifier) as Arc<dyn Notifier>")]
    notifier: Arc<dyn Notifier>,
    /// Time source
    clock: Arc<dyn Clock>,
    /// Runtime settings
    #[builder(default, setter(custom))]
    settings: Arc<RwLock<MediatorSettings>>,
    #[builder(setter(skip))]
    catalogue: Mutex<Option<ServiceCatalogue>>,
    /// State each entity held before its latest change
    #[builder(setter(skip))]
    previous_states: RwLock<HashMap<String, String>>,
}

impl RequestMediatorBuilder {
    /// Initial runtime settings.
    pub fn settings(mut self, settings: MediatorSettings) -> Self {
        self.settings = Some(Arc::new(RwLock::new(settings)));
        self
    }

    /// Build the mediator and route confirmation expiries into the audit log.
    ///
    /// # Errors
    ///
    /// Fails when a required component was not supplied.
    pub fn build(self) -> Result<RequestMediator, RequestMediatorBuilderError> {
        let mediator = self.build_unwired()?;
        let audit = mediator.audit.clone();
        mediator.queue.set_expiry_hook(Arc::new(move |action: &PendingAction| {
            let call = action.call();
            let record = AuditRecord::new(
                audit.now(),
                call.entity_id().clone(),
                AuditResult::Expired,
                action.requested_by().clone(),
            )
            .with_domain(call.domain().clone())
            .with_service(call.service().clone())
            .with_reason("expired");
            audit.record(&record);
        }));
        Ok(mediator)
    }
}

impl std::fmt::Debug for RequestMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMediator")
            .field("registry_version", &self.registry.version())
            .field("upstream", &self.upstream)
            .field("settings", &*self.settings.read())
            .finish_non_exhaustive()
    }
}

#[track_caller]
fn refuse(kind: MediationErrorKind) -> MediationError {
    MediationError::new(kind)
}

#[track_caller]
fn upstream_failure(err: UpstreamError) -> MediationError {
    MediationError::new(MediationErrorKind::UpstreamError(err.kind.to_string()))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl RequestMediator {
    /// Exposure registry.
    pub fn registry(&self) -> &Arc<ExposureRegistry> {
        &self.registry
    }

    /// API key store.
    pub fn keys(&self) -> &Arc<ApiKeyStore> {
        &self.keys
    }

    /// Request limiter.
    pub fn limiter(&self) -> &Arc<RequestLimiter> {
        &self.limiter
    }

    /// Confirmation queue.
    pub fn queue(&self) -> &Arc<ConfirmationQueue> {
        &self.queue
    }

    /// Audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Upstream platform.
    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    /// Current runtime settings.
    pub fn settings(&self) -> MediatorSettings {
        self.settings.read().clone()
    }

    /// Replace the runtime settings.
    pub fn update_settings(&self, settings: MediatorSettings) {
        info!(
            allowed_ips = settings.allowed_ips().len(),
            filter_unavailable = settings.filter_unavailable(),
            "Mediator settings updated"
        );
        *self.settings.write() = settings;
    }

    /// Resolve the identity of a data-plane request.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when the source address is not on a non-empty allowlist,
    /// or when keys exist and the bearer token is missing or unknown.
    pub fn authenticate(&self, bearer: Option<&str>, source_ip: IpAddr) -> MediationResult<ClientIdentity> {
        let allowed = {
            let settings = self.settings.read();
            settings.allowed_ips.is_empty() || settings.allowed_ips.contains(&source_ip)
        };
        if !allowed {
            warn!(%source_ip, "Source address not on the allowlist");
            return Err(refuse(MediationErrorKind::Unauthorized(
                "source address not allowed".to_string(),
            )));
        }
        self.keys.authenticate(bearer, source_ip)
    }

    /// Policy of an entity if this identity may see it.
    fn visible_policy<'s>(
        snapshot: &'s RegistrySnapshot,
        identity: &ClientIdentity,
        entity_id: &str,
    ) -> Option<&'s EntityPolicy> {
        snapshot
            .exposed_policy(entity_id)
            .filter(|_| identity.in_scope(entity_id))
    }

    /// Every state the identity may see, annotated with its policy.
    ///
    /// # Errors
    ///
    /// `UpstreamError` when the platform cannot be queried.
    #[instrument(skip(self, identity), fields(identity = %identity.label()))]
    pub async fn read_states(&self, identity: &ClientIdentity) -> MediationResult<Vec<EntityState>> {
        let snapshot = self.registry.snapshot();
        let filter_unavailable = *self.settings.read().filter_unavailable();
        let states = self
            .upstream
            .query_all_states()
            .await
            .map_err(upstream_failure)?;
        let visible: Vec<EntityState> = states
            .into_iter()
            .filter(|state| !(filter_unavailable && state.is_unavailable()))
            .filter_map(|state| {
                Self::visible_policy(&snapshot, identity, state.entity_id())
                    .cloned()
                    .map(|policy| state.with_policy(&policy))
            })
            .collect();
        debug!(count = visible.len(), "States read");
        Ok(visible)
    }

    /// Summary of every entity [`read_states`](Self::read_states) would return.
    ///
    /// Entries are compact while `compact_mode` is set.
    #[instrument(skip(self, identity), fields(identity = %identity.label()))]
    pub async fn sensor_summary(&self, identity: &ClientIdentity) -> MediationResult<SensorSummary> {
        let states = self.read_states(identity).await?;
        let compact = *self.settings.read().compact_mode();
        let now = self.clock.now();
        let previous = self.previous_states.read();
        let sensors = states
            .iter()
            .map(|state| {
                if compact {
                    SensorEntry::compact(state)
                } else {
                    let last = previous.get(state.entity_id()).map(String::as_str);
                    SensorEntry::full(state, last, now)
                }
            })
            .collect();
        Ok(SensorSummary::new(sensors, now))
    }

    /// Remember the state an entity left, for sensor summaries.
    pub fn observe_change(&self, change: &StateChange) {
        match (change.old_state(), change.new_state()) {
            (Some(old), Some(new)) if old.state() != new.state() => {
                self.previous_states
                    .write()
                    .insert(change.entity_id().clone(), old.state().clone());
            }
            (_, None) => {
                self.previous_states.write().remove(change.entity_id());
            }
            _ => {}
        }
    }

    /// One entity state.
    ///
    /// # Errors
    ///
    /// `NotExposed` when the entity is `off`, unknown, outside the key scope or
    /// unknown upstream. All four look the same to the caller.
    #[instrument(skip(self, identity), fields(identity = %identity.label()))]
    pub async fn read_state(&self, identity: &ClientIdentity, entity_id: &str) -> MediationResult<EntityState> {
        let snapshot = self.registry.snapshot();
        let Some(policy) = Self::visible_policy(&snapshot, identity, entity_id).cloned() else {
            debug!("Entity not exposed");
            return Err(refuse(MediationErrorKind::NotExposed(entity_id.to_string())));
        };
        match self
            .upstream
            .query_state(entity_id)
            .await
            .map_err(upstream_failure)?
        {
            Some(state) => Ok(state.with_policy(&policy)),
            None => Err(refuse(MediationErrorKind::NotExposed(entity_id.to_string()))),
        }
    }

    async fn service_catalogue(&self) -> MediationResult<Arc<BTreeMap<String, Vec<String>>>> {
        let version = self.registry.version();
        let now = self.clock.now();
        let cached = self.catalogue.lock().clone();
        if let Some(cached) = cached {
            let fresh = now - cached.fetched_at < Duration::seconds(SERVICE_CATALOGUE_TTL_SECS);
            if fresh && cached.registry_version == version {
                return Ok(cached.services);
            }
        }
        let services = Arc::new(self.upstream.list_services().await.map_err(upstream_failure)?);
        *self.catalogue.lock() = Some(ServiceCatalogue {
            registry_version: version,
            fetched_at: now,
            services: services.clone(),
        });
        debug!(domains = services.len(), "Service catalogue refreshed");
        Ok(services)
    }

    /// Services the identity may invoke, by domain.
    ///
    /// A domain with a `confirm` or `control` entity lists every upstream
    /// service of that domain; a domain with only `read` entities lists its
    /// read-safe services.
    ///
    /// # Errors
    ///
    /// `UpstreamError` when the catalogue cannot be fetched.
    #[instrument(skip(self, identity), fields(identity = %identity.label()))]
    pub async fn list_services(&self, identity: &ClientIdentity) -> MediationResult<BTreeMap<String, Vec<String>>> {
        let snapshot = self.registry.snapshot();
        let catalogue = self.service_catalogue().await?;
        let tables = self.registry.tables();

        let mut levels: BTreeMap<&str, AccessLevel> = BTreeMap::new();
        for (entity_id, policy) in snapshot.exposed() {
            if !identity.in_scope(entity_id) {
                continue;
            }
            if let Some(domain) = entity_domain(entity_id) {
                let level = levels.entry(domain).or_default();
                *level = (*level).max(*policy.access_level());
            }
        }

        let mut allowed = BTreeMap::new();
        for (domain, level) in levels {
            let Some(upstream_services) = catalogue.get(domain) else {
                continue;
            };
            let services: BTreeSet<String> = if level.can_invoke() {
                upstream_services.iter().cloned().collect()
            } else {
                tables
                    .read_safe_services_for(domain)
                    .filter(|service| upstream_services.iter().any(|s| s.as_str() == *service))
                    .map(String::from)
                    .collect()
            };
            if !services.is_empty() {
                allowed.insert(domain.to_string(), services.into_iter().collect());
            }
        }
        Ok(allowed)
    }

    /// Mediate a service invocation.
    ///
    /// Targets named in the body are mediated one by one. A body naming no
    /// target is never widened to the whole domain: it resolves to the entities
    /// this identity may invoke the service on, each of which is mediated on
    /// its own.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a malformed body, or when no target was named and no
    /// entity qualifies. Per-entity refusals are reported inside the outcomes.
    #[instrument(skip(self, identity, body), fields(identity = %identity.label()))]
    pub async fn invoke(
        &self,
        identity: &ClientIdentity,
        domain: &str,
        service: &str,
        body: Value,
    ) -> MediationResult<Vec<EntityOutcome>> {
        let request = ServiceRequest::from_body(domain, service, body).inspect_err(|e| {
            warn!(reason = e.kind.reason_code(), "Malformed service request");
        })?;
        let snapshot = self.registry.snapshot();

        let targets = if request.targets().is_empty() {
            let implicit = self.implicit_targets(identity, &snapshot, &request);
            if implicit.is_empty() {
                return Err(refuse(MediationErrorKind::BadRequest(format!(
                    "no entity_id given and no exposed entity accepts {}.{}",
                    domain, service
                ))));
            }
            debug!(count = implicit.len(), "Resolved implicit targets");
            implicit
        } else {
            request.targets().clone()
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for call in request.calls_for(&targets) {
            let entity_id = call.entity_id().clone();
            let outcome = self.mediate_call(identity, &snapshot, call).await;
            outcomes.push(EntityOutcome { entity_id, outcome });
        }
        Ok(outcomes)
    }

    fn implicit_targets(
        &self,
        identity: &ClientIdentity,
        snapshot: &RegistrySnapshot,
        request: &ServiceRequest,
    ) -> Vec<String> {
        let tables = self.registry.tables();
        let read_safe = tables.is_read_safe(request.domain(), request.service());
        snapshot
            .exposed()
            .filter(|(entity_id, policy)| {
                entity_domain(entity_id) == Some(request.domain().as_str())
                    && identity.in_scope(entity_id)
                    && (policy.access_level().can_invoke() || read_safe)
            })
            .map(|(entity_id, _)| entity_id.clone())
            .collect()
    }

    /// Pipeline steps 1 to 6.
    fn authorize<'s>(
        &self,
        identity: &ClientIdentity,
        snapshot: &'s RegistrySnapshot,
        call: &ServiceCall,
    ) -> MediationResult<&'s EntityPolicy> {
        let entity_id = call.entity_id();
        let Some(policy) = snapshot.exposed_policy(entity_id) else {
            return Err(refuse(MediationErrorKind::NotExposed(entity_id.clone())));
        };

        let entity_domain = entity_domain(entity_id).unwrap_or_default();
        if entity_domain != call.domain() {
            return Err(refuse(MediationErrorKind::DomainMismatch {
                requested: call.domain().clone(),
                entity: entity_domain.to_string(),
            }));
        }

        if !identity.in_scope(entity_id) {
            return Err(refuse(MediationErrorKind::OutOfScope(entity_id.clone())));
        }

        let level = *policy.access_level();
        let read_safe = self.registry.tables().is_read_safe(call.domain(), call.service());
        if level == AccessLevel::Read && !read_safe {
            return Err(refuse(MediationErrorKind::ReadOnly(entity_id.clone())));
        }

        if level.can_invoke()
            && !self
                .schedules
                .is_allowed_now(snapshot, policy.schedule_id().as_deref())
        {
            return Err(refuse(MediationErrorKind::OutsideSchedule(entity_id.clone())));
        }

        if let Err(e) = self.limiter.check(identity, 1) {
            debug!(error = %e, "Rate limiter refused");
            return Err(refuse(MediationErrorKind::RateLimited(identity.label())));
        }
        Ok(policy)
    }

    async fn mediate_call(
        &self,
        identity: &ClientIdentity,
        snapshot: &RegistrySnapshot,
        mut call: ServiceCall,
    ) -> MediationResult<CallOutcome> {
        let started = Instant::now();
        let source = identity.label();

        let policy = match self.authorize(identity, snapshot, &call) {
            Ok(policy) => policy,
            Err(err) => {
                let result = match err.kind {
                    MediationErrorKind::RateLimited(_) => AuditResult::RateLimited,
                    _ => AuditResult::Denied,
                };
                warn!(
                    entity_id = %call.entity_id(),
                    reason = err.kind.reason_code(),
                    "Service call refused"
                );
                self.audit_call(&call, result, &source, started, Some(err.kind.reason_code()), false)
                    .await;
                return Err(err);
            }
        };

        let clamped = clamp_params(call.params_mut(), policy.constraints());
        for param in &clamped {
            debug!(param = %param.param, from = %param.value, to = %param.clamped_to, "Parameter clamped");
        }
        let read_safe = self.registry.tables().is_read_safe(call.domain(), call.service());

        if *policy.access_level() == AccessLevel::Confirm {
            let action = self.queue.enqueue(call.clone(), identity.key_id().clone(), source.clone());
            self.audit_call(&call, AuditResult::Pending, &source, started, None, true)
                .await;
            self.dispatch_notice(&action);
            return Ok(CallOutcome::Pending { action, clamped });
        }

        match self
            .upstream
            .invoke_service(call.domain(), call.service(), call.upstream_body(), read_safe)
            .await
        {
            Ok(response) => {
                let result = if clamped.is_empty() {
                    AuditResult::Success
                } else {
                    AuditResult::Clamped
                };
                self.audit_call(&call, result, &source, started, None, true)
                    .await;
                info!(entity_id = %call.entity_id(), %result, "Service call forwarded");
                Ok(CallOutcome::Completed { response, clamped })
            }
            Err(e) => {
                warn!(entity_id = %call.entity_id(), error = %e, "Upstream rejected service call");
                self.audit_call(&call, AuditResult::Error, &source, started, Some("upstream_error"), true)
                    .await;
                Err(upstream_failure(e))
            }
        }
    }

    async fn audit_call(
        &self,
        call: &ServiceCall,
        result: AuditResult,
        source: &str,
        started: Instant,
        reason: Option<&str>,
        with_params: bool,
    ) {
        let mut record = AuditRecord::new(self.clock.now(), call.entity_id().clone(), result, source)
            .with_domain(call.domain().clone())
            .with_service(call.service().clone())
            .with_latency_ms(elapsed_ms(started));
        if let Some(reason) = reason {
            record = record.with_reason(reason);
        }
        if with_params && !call.params().is_empty() {
            record = record.with_params(call.params().clone());
        }
        self.audit.write(record).await;
    }

    /// Send the approval prompt in the background.
    fn dispatch_notice(&self, action: &PendingAction) {
        let upstream = self.upstream.clone();
        let notifier = self.notifier.clone();
        let agent_name = self.settings.read().agent_name().clone();
        let action = action.clone();
        tokio::spawn(async move {
            let entity_id = action.call().entity_id();
            let friendly_name = match upstream.query_state(entity_id).await {
                Ok(Some(state)) => state.friendly_name().to_string(),
                _ => entity_id.clone(),
            };
            let notice = ApprovalNotice::for_action(&action, friendly_name, agent_name);
            if let Err(e) = notifier.notify_approval(&notice).await {
                warn!(action_id = %action.id(), error = %e, "Approval notification failed");
            }
        });
    }

    /// Status of an action requested by this identity.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id or an action another key requested.
    pub fn action_status(&self, identity: &ClientIdentity, action_id: &str) -> MediationResult<PendingAction> {
        let action = self.queue.status(action_id)?;
        if action.key_id() != identity.key_id() {
            return Err(refuse(MediationErrorKind::NotFound(format!("action {}", action_id))));
        }
        Ok(action)
    }

    /// Approve a pending action and forward its call.
    ///
    /// Exactly one concurrent caller wins the transition; everyone else gets
    /// `Conflict` and upstream is invoked once.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Conflict`, or `UpstreamError` when the forwarded call fails
    /// (the action stays `approved` with the error recorded).
    #[instrument(skip(self))]
    pub async fn approve(&self, action_id: &str, approver: &str) -> MediationResult<PendingAction> {
        let started = Instant::now();
        let action = self.queue.begin_approve(action_id)?;
        let call = action.call();
        let reason = format!("approved via {}", approver);
        let read_safe = self.registry.tables().is_read_safe(call.domain(), call.service());
        match self
            .upstream
            .invoke_service(call.domain(), call.service(), call.upstream_body(), read_safe)
            .await
        {
            Ok(response) => {
                self.queue.complete(action_id, Ok(response));
                self.audit_call(call, AuditResult::Approved, action.requested_by(), started, Some(&reason), true)
                    .await;
                info!(entity_id = %call.entity_id(), approver, "Approved action forwarded");
                self.queue.status(action_id)
            }
            Err(e) => {
                warn!(error = %e, "Approved action failed upstream");
                self.queue.complete(action_id, Err(e.kind.to_string()));
                self.audit_call(call, AuditResult::Error, action.requested_by(), started, Some("upstream_error"), true)
                    .await;
                Err(upstream_failure(e))
            }
        }
    }

    /// Deny a pending action.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Conflict`.
    #[instrument(skip(self))]
    pub async fn deny(&self, action_id: &str, approver: &str) -> MediationResult<PendingAction> {
        let started = Instant::now();
        let action = self.queue.deny(action_id)?;
        let reason = format!("denied via {}", approver);
        self.audit_call(action.call(), AuditResult::DeniedByHuman, action.requested_by(), started, Some(&reason), false)
            .await;
        info!(entity_id = %action.call().entity_id(), approver, "Action denied");
        Ok(action)
    }

    /// Expire overdue actions. Expiries are audited by the queue hook.
    pub fn sweep_expired(&self) -> usize {
        self.queue.sweep().len()
    }

    /// Actions in the queue, optionally filtered by status, after expiring
    /// anything past its deadline.
    pub fn list_actions(&self, status: Option<ActionStatus>) -> Vec<PendingAction> {
        self.sweep_expired();
        self.queue.list(status)
    }

    /// Apply a tapped notification button.
    ///
    /// Returns `None` when the action string does not belong to the gateway.
    pub async fn resolve_notification_action(&self, action: &str) -> Option<MediationResult<PendingAction>> {
        let (decision, action_id) = parse_notification_action(action)?;
        debug!(%decision, action_id, "Notification action received");
        Some(match decision {
            NotificationDecision::Approve => self.approve(action_id, NOTIFICATION_SOURCE).await,
            NotificationDecision::Deny => self.deny(action_id, NOTIFICATION_SOURCE).await,
        })
    }

    /// State history for explicitly named entities.
    ///
    /// Consumes rate-limit budget like a service call.
    ///
    /// # Errors
    ///
    /// `BadRequest` without an entity filter, `NotExposed` for any entity the
    /// identity cannot see, `RateLimited`, or `UpstreamError`.
    #[instrument(skip(self, identity), fields(identity = %identity.label()))]
    pub async fn history(
        &self,
        identity: &ClientIdentity,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        entity_ids: Vec<String>,
    ) -> MediationResult<Value> {
        if entity_ids.is_empty() {
            return Err(refuse(MediationErrorKind::BadRequest(
                "filter_entity_id is required".to_string(),
            )));
        }
        let snapshot = self.registry.snapshot();
        if let Some(hidden) = entity_ids
            .iter()
            .find(|id| Self::visible_policy(&snapshot, identity, id).is_none())
        {
            return Err(refuse(MediationErrorKind::NotExposed(hidden.clone())));
        }
        if self.limiter.check(identity, 1).is_err() {
            let record = AuditRecord::new(
                self.clock.now(),
                entity_ids.join(","),
                AuditResult::RateLimited,
                identity.label(),
            )
            .with_domain("history")
            .with_reason("rate_limited");
            self.audit.write(record).await;
            return Err(refuse(MediationErrorKind::RateLimited(identity.label())));
        }
        self.upstream
            .query_history(&HistoryQuery::new(start, end, entity_ids))
            .await
            .map_err(upstream_failure)
    }
}
