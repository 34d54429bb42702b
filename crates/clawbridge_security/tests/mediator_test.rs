use chrono::{DateTime, Duration, Utc};
use clawbridge_core::{
    AccessLevel, ActionStatus, AuditQuery, AuditResult, ClientIdentity, Clock, DomainTables,
    EntityPolicy, EntityState, ManualClock, ParamConstraint, StateChange,
};
use clawbridge_error::MediationResult;
use clawbridge_rate_limit::RequestLimiter;
use clawbridge_security::testing::{InMemoryUpstream, RecordingNotifier};
use clawbridge_security::{
    ApiKeyStore, AuditLog, CallOutcome, ConfirmationQueue, EntityOutcome, ExposureRegistry,
    JsonStore, MediatorSettings, NewSchedule, RequestMediator, RequestMediatorBuilder,
    ScheduleEvaluator,
};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

struct Gateway {
    _dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
    upstream: Arc<InMemoryUpstream>,
    notifier: Arc<RecordingNotifier>,
    mediator: Arc<RequestMediator>,
}

fn start() -> DateTime<Utc> {
    "2026-03-02T12:00:00Z".parse().unwrap()
}

fn gateway(rate_limit: u32) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(start()));
    let shared: Arc<dyn Clock> = clock.clone();
    let upstream = Arc::new(
        InMemoryUpstream::new()
            .with_entity("light.office", "on", "Office Light")
            .with_entity("light.porch", "off", "Porch Light")
            .with_entity("light.hidden", "on", "Hidden Light")
            .with_entity("lock.front_door", "locked", "Front Door")
            .with_entity("switch.kitchen", "off", "Kitchen Switch")
            .with_entity("weather.home", "sunny", "Home")
            .with_entity("sensor.broken", "unavailable", "Broken Sensor")
            .with_entity("todo.shopping", "3", "Shopping List")
            .with_services("light", &["turn_on", "turn_off", "toggle"])
            .with_services("lock", &["lock", "unlock"])
            .with_services("switch", &["turn_on", "turn_off"])
            .with_services("weather", &["get_forecasts"])
            .with_services("todo", &["get_items", "add_item"]),
    );
    let notifier = Arc::new(RecordingNotifier::default());

    let registry = ExposureRegistry::open(
        JsonStore::new(dir.path().join("registry.json")),
        DomainTables::default(),
    )
    .unwrap();
    let keys = ApiKeyStore::open(JsonStore::new(dir.path().join("api_keys.json")), shared.clone()).unwrap();

    let mediator = RequestMediatorBuilder::default()
        .registry(Arc::new(registry))
        .keys(Arc::new(keys))
        .limiter(Arc::new(RequestLimiter::new(rate_limit, shared.clone())))
        .schedules(ScheduleEvaluator::new("utc".parse().unwrap(), shared.clone()))
        .queue(Arc::new(ConfirmationQueue::new(120, shared.clone())))
        .audit(Arc::new(AuditLog::new(dir.path().join("audit.jsonl"), true, shared.clone())))
        .upstream(upstream.clone())
        .notifier(notifier.clone())
        .clock(shared)
        .settings(MediatorSettings::default().with_agent_name("Claw"))
        .build()
        .unwrap();

    Gateway {
        _dir: dir,
        clock,
        upstream,
        notifier,
        mediator: Arc::new(mediator),
    }
}

impl Gateway {
    fn expose(&self, entity_id: &str, policy: EntityPolicy) {
        self.mediator.registry().set(entity_id, policy).unwrap();
    }

    async fn call(&self, identity: &ClientIdentity, domain: &str, service: &str, body: Value) -> MediationResult<CallOutcome> {
        let outcomes = self.mediator.invoke(identity, domain, service, body).await?;
        assert_eq!(outcomes.len(), 1);
        outcomes.into_iter().next().unwrap().into_outcome()
    }

    fn last_audit(&self) -> AuditResult {
        let records = self.mediator.audit().query(&AuditQuery::default()).unwrap();
        *records[0].result()
    }
}

fn anonymous() -> ClientIdentity {
    ClientIdentity::anonymous(IP)
}

fn reason<T: std::fmt::Debug>(result: MediationResult<T>) -> &'static str {
    result.unwrap_err().kind.reason_code()
}

#[tokio::test]
async fn test_off_and_absent_entities_are_indistinguishable() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));
    gw.expose("light.hidden", EntityPolicy::new(AccessLevel::Off));

    let states = gw.mediator.read_states(&anonymous()).await.unwrap();
    let ids: Vec<&str> = states.iter().map(|s| s.entity_id().as_str()).collect();
    assert_eq!(ids, vec!["light.office"]);

    let off = gw.mediator.read_state(&anonymous(), "light.hidden").await.unwrap_err();
    let absent = gw.mediator.read_state(&anonymous(), "lock.front_door").await.unwrap_err();
    let unknown = gw.mediator.read_state(&anonymous(), "light.nowhere").await.unwrap_err();
    for err in [&off, &absent, &unknown] {
        assert_eq!(err.kind.reason_code(), "not_exposed");
        assert_eq!(err.kind.client_message(), "Entity not found");
        assert_eq!(err.kind.http_status(), 404);
    }

    let off_call = gw.call(&anonymous(), "light", "turn_on", json!({"entity_id": "light.hidden"})).await;
    let absent_call = gw.call(&anonymous(), "lock", "unlock", json!({"entity_id": "lock.front_door"})).await;
    assert_eq!(reason(off_call), "not_exposed");
    assert_eq!(reason(absent_call), "not_exposed");
    assert_eq!(gw.upstream.invocation_count(), 0);
}

#[tokio::test]
async fn test_state_reads_carry_policy_and_skip_unavailable() {
    let gw = gateway(60);
    gw.expose(
        "light.office",
        EntityPolicy::new(AccessLevel::Control)
            .with_annotation("Desk lamp".to_string())
            .with_constraint("brightness", ParamConstraint::new(Some(1.0), Some(200.0))),
    );
    gw.expose("sensor.broken", EntityPolicy::new(AccessLevel::Read));

    let states = gw.mediator.read_states(&anonymous()).await.unwrap();
    assert_eq!(states.len(), 1);
    let attributes = states[0].attributes();
    assert_eq!(attributes["clawbridge_access_level"], json!("control"));
    assert_eq!(attributes["clawbridge_annotation"], json!("Desk lamp"));
    assert_eq!(attributes["clawbridge_constraints"]["brightness"]["max"], json!(200.0));

    gw.mediator.update_settings(MediatorSettings::default().with_filter_unavailable(false));
    assert_eq!(gw.mediator.read_states(&anonymous()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_read_level_refuses_all_but_read_safe_services() {
    let gw = gateway(60);
    gw.expose("light.porch", EntityPolicy::new(AccessLevel::Read));
    gw.expose("weather.home", EntityPolicy::new(AccessLevel::Read));

    for service in ["turn_on", "turn_off", "toggle"] {
        let result = gw
            .call(&anonymous(), "light", service, json!({"entity_id": "light.porch", "brightness": 10}))
            .await;
        assert_eq!(reason(result), "read_only");
    }
    assert_eq!(gw.last_audit(), AuditResult::Denied);

    let forecast = gw
        .call(&anonymous(), "weather", "get_forecasts", json!({"entity_id": "weather.home", "type": "daily"}))
        .await
        .unwrap();
    assert!(matches!(forecast, CallOutcome::Completed { .. }));
    let invoked = gw.upstream.invocations();
    assert_eq!(invoked.len(), 1);
    assert!(invoked[0].return_response);
}

#[tokio::test]
async fn test_confirm_level_returns_pending_handle() {
    let gw = gateway(60);
    gw.expose("lock.front_door", EntityPolicy::new(AccessLevel::Confirm));

    let outcome = gw
        .call(&anonymous(), "lock", "unlock", json!({"entity_id": "lock.front_door"}))
        .await
        .unwrap();
    let CallOutcome::Pending { action, .. } = outcome else {
        panic!("expected a pending action, got {:?}", outcome);
    };
    assert_eq!(gw.upstream.invocation_count(), 0);
    assert_eq!(gw.last_audit(), AuditResult::Pending);

    let polled = gw.mediator.action_status(&anonymous(), action.id()).unwrap();
    assert_eq!(*polled.status(), ActionStatus::Pending);
    assert_eq!(*polled.expires_at(), start() + Duration::seconds(120));

    let notices = gw.notifier.wait_for(1).await;
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].friendly_name(), "Front Door");
    assert_eq!(notices[0].approve_action(), &format!("CLAWBRIDGE_APPROVE_{}", action.id()));
    assert_eq!(notices[0].title(), "Claw requests action");
}

#[tokio::test]
async fn test_approve_forwards_exactly_once() {
    let gw = gateway(60);
    gw.expose("lock.front_door", EntityPolicy::new(AccessLevel::Confirm));
    let CallOutcome::Pending { action, .. } = gw
        .call(&anonymous(), "lock", "unlock", json!({"entity_id": "lock.front_door"}))
        .await
        .unwrap()
    else {
        panic!("expected a pending action");
    };

    let approved = gw.mediator.approve(action.id(), "operator").await.unwrap();
    assert_eq!(*approved.status(), ActionStatus::Approved);
    assert!(approved.result().is_some());
    assert_eq!(gw.upstream.invocation_count(), 1);
    assert_eq!(gw.last_audit(), AuditResult::Approved);

    assert_eq!(reason(gw.mediator.approve(action.id(), "operator").await), "conflict");
    assert_eq!(reason(gw.mediator.deny(action.id(), "operator").await), "conflict");
    assert_eq!(gw.upstream.invocation_count(), 1);
}

#[tokio::test]
async fn test_concurrent_decisions_settle_once() {
    let gw = gateway(60);
    gw.expose("lock.front_door", EntityPolicy::new(AccessLevel::Confirm));
    let CallOutcome::Pending { action, .. } = gw
        .call(&anonymous(), "lock", "unlock", json!({"entity_id": "lock.front_door"}))
        .await
        .unwrap()
    else {
        panic!("expected a pending action");
    };

    let mut handles = Vec::new();
    for i in 0..8 {
        let mediator = gw.mediator.clone();
        let id = action.id().clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                mediator.approve(&id, "operator").await.is_ok()
            } else {
                mediator.deny(&id, "operator").await.is_ok()
            }
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(gw.upstream.invocation_count() <= 1);
    let status = *gw.mediator.queue().status(action.id()).unwrap().status();
    assert!(matches!(status, ActionStatus::Approved | ActionStatus::Denied));
}

#[tokio::test]
async fn test_expired_action_cannot_be_approved() {
    let gw = gateway(60);
    gw.expose("lock.front_door", EntityPolicy::new(AccessLevel::Confirm));
    let CallOutcome::Pending { action, .. } = gw
        .call(&anonymous(), "lock", "unlock", json!({"entity_id": "lock.front_door"}))
        .await
        .unwrap()
    else {
        panic!("expected a pending action");
    };

    gw.clock.advance(Duration::seconds(121));
    assert_eq!(gw.mediator.sweep_expired(), 1);
    let status = gw.mediator.action_status(&anonymous(), action.id()).unwrap();
    assert_eq!(*status.status(), ActionStatus::Expired);
    assert_eq!(reason(gw.mediator.approve(action.id(), "operator").await), "conflict");
    assert_eq!(gw.upstream.invocation_count(), 0);

    let expired = gw
        .mediator
        .audit()
        .query(&AuditQuery::default().with_result(AuditResult::Expired))
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].entity_id(), "lock.front_door");
}

#[tokio::test]
async fn test_out_of_range_brightness_is_clamped() {
    let gw = gateway(60);
    gw.expose(
        "light.office",
        EntityPolicy::new(AccessLevel::Control)
            .with_constraint("brightness", ParamConstraint::new(Some(1.0), Some(200.0))),
    );

    let outcome = gw
        .call(&anonymous(), "light", "turn_on", json!({"entity_id": "light.office", "brightness": 255}))
        .await
        .unwrap();
    let CallOutcome::Completed { clamped, .. } = outcome else {
        panic!("expected a forwarded call");
    };
    assert_eq!(clamped.len(), 1);
    assert_eq!(clamped[0].clamped_to, json!(200));

    let invoked = gw.upstream.invocations();
    assert_eq!(invoked[0].body["brightness"], json!(200));
    assert_eq!(invoked[0].body["entity_id"], json!("light.office"));
    assert_eq!(gw.last_audit(), AuditResult::Clamped);
}

#[tokio::test]
async fn test_rate_limit_rejects_and_recovers() {
    let gw = gateway(3);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));
    let body = json!({"entity_id": "light.office"});

    for _ in 0..3 {
        gw.call(&anonymous(), "light", "toggle", body.clone()).await.unwrap();
    }
    assert_eq!(reason(gw.call(&anonymous(), "light", "toggle", body.clone()).await), "rate_limited");
    assert_eq!(gw.last_audit(), AuditResult::RateLimited);
    assert_eq!(gw.upstream.invocation_count(), 3);

    // State reads are never limited.
    gw.mediator.read_states(&anonymous()).await.unwrap();

    gw.clock.advance(Duration::seconds(61));
    gw.call(&anonymous(), "light", "toggle", body).await.unwrap();
}

#[tokio::test]
async fn test_schedule_window_wrapping_midnight() {
    let gw = gateway(60);
    let schedule = gw
        .mediator
        .registry()
        .create_schedule(NewSchedule {
            name: "Night".to_string(),
            start: "22:00".to_string(),
            end: "06:00".to_string(),
            days: Vec::new(),
        })
        .unwrap();
    gw.expose(
        "light.porch",
        EntityPolicy::new(AccessLevel::Control).with_schedule_id(schedule.id().clone()),
    );
    let body = json!({"entity_id": "light.porch"});

    gw.clock.set("2026-03-02T23:30:00Z".parse().unwrap());
    gw.call(&anonymous(), "light", "turn_on", body.clone()).await.unwrap();
    gw.clock.set("2026-03-03T02:00:00Z".parse().unwrap());
    gw.call(&anonymous(), "light", "turn_off", body.clone()).await.unwrap();
    gw.clock.set("2026-03-03T12:00:00Z".parse().unwrap());
    assert_eq!(reason(gw.call(&anonymous(), "light", "turn_on", body).await), "outside_schedule");
}

#[tokio::test]
async fn test_scoped_key_cannot_reach_other_entities() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));
    gw.expose("switch.kitchen", EntityPolicy::new(AccessLevel::Control));
    let issued = gw
        .mediator
        .keys()
        .issue("Assistant", Some(BTreeSet::from(["light.office".to_string()])), None)
        .unwrap();
    let identity = gw.mediator.authenticate(Some(&issued.secret), IP).unwrap();

    let result = gw
        .call(&identity, "switch", "turn_on", json!({"entity_id": "switch.kitchen"}))
        .await;
    assert_eq!(reason(result), "out_of_scope");
    gw.call(&identity, "light", "turn_on", json!({"entity_id": "light.office"}))
        .await
        .unwrap();

    let visible = gw.mediator.read_states(&identity).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert!(gw.mediator.authenticate(None, IP).is_err());
}

#[tokio::test]
async fn test_domain_mismatch() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));
    let result = gw
        .call(&anonymous(), "switch", "turn_on", json!({"entity_id": "light.office"}))
        .await;
    assert_eq!(reason(result), "domain_mismatch");
}

#[tokio::test]
async fn test_missing_target_is_never_broadened() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));
    gw.expose("light.porch", EntityPolicy::new(AccessLevel::Read));
    gw.expose("light.hidden", EntityPolicy::new(AccessLevel::Off));

    let outcomes = gw
        .mediator
        .invoke(&anonymous(), "light", "turn_off", Value::Null)
        .await
        .unwrap();
    let targets: Vec<&str> = outcomes.iter().map(|o| o.entity_id().as_str()).collect();
    assert_eq!(targets, vec!["light.office"]);
    assert_eq!(gw.upstream.invocation_count(), 1);

    let err = gw
        .mediator
        .invoke(&anonymous(), "switch", "turn_off", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind.reason_code(), "bad_request");
}

#[tokio::test]
async fn test_multiple_targets_are_mediated_individually() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));
    gw.expose("light.porch", EntityPolicy::new(AccessLevel::Read));

    let outcomes: Vec<EntityOutcome> = gw
        .mediator
        .invoke(
            &anonymous(),
            "light",
            "turn_on",
            json!({"target": {"entity_id": ["light.office", "light.porch"]}}),
        )
        .await
        .unwrap();
    assert!(outcomes[0].outcome().is_ok());
    assert_eq!(
        outcomes[1].outcome().as_ref().unwrap_err().kind.reason_code(),
        "read_only"
    );
    assert_eq!(gw.upstream.invocation_count(), 1);
}

#[tokio::test]
async fn test_upstream_failure_is_surfaced_and_audited() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));
    gw.upstream.fail_invocations(true);
    let result = gw
        .call(&anonymous(), "light", "turn_on", json!({"entity_id": "light.office"}))
        .await;
    let err = result.unwrap_err();
    assert_eq!(err.kind.reason_code(), "upstream_error");
    assert_eq!(err.kind.http_status(), 502);
    assert_eq!(gw.last_audit(), AuditResult::Error);
}

#[tokio::test]
async fn test_notification_button_resolves_action() {
    let gw = gateway(60);
    gw.expose("lock.front_door", EntityPolicy::new(AccessLevel::Confirm));
    let CallOutcome::Pending { action, .. } = gw
        .call(&anonymous(), "lock", "unlock", json!({"entity_id": "lock.front_door"}))
        .await
        .unwrap()
    else {
        panic!("expected a pending action");
    };

    assert!(gw.mediator.resolve_notification_action("OTHER_ACTION").await.is_none());
    let denied = gw
        .mediator
        .resolve_notification_action(&format!("CLAWBRIDGE_DENY_{}", action.id()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*denied.status(), ActionStatus::Denied);
    assert_eq!(gw.last_audit(), AuditResult::DeniedByHuman);
    assert_eq!(gw.upstream.invocation_count(), 0);
}

#[tokio::test]
async fn test_actions_are_private_to_their_key() {
    let gw = gateway(60);
    gw.expose("lock.front_door", EntityPolicy::new(AccessLevel::Confirm));
    let keys = gw.mediator.keys();
    let owner = keys.issue("Owner", None, None).unwrap();
    let other = keys.issue("Other", None, None).unwrap();
    let owner_id = gw.mediator.authenticate(Some(&owner.secret), IP).unwrap();
    let other_id = gw.mediator.authenticate(Some(&other.secret), IP).unwrap();

    let CallOutcome::Pending { action, .. } = gw
        .call(&owner_id, "lock", "unlock", json!({"entity_id": "lock.front_door"}))
        .await
        .unwrap()
    else {
        panic!("expected a pending action");
    };
    assert!(gw.mediator.action_status(&owner_id, action.id()).is_ok());
    assert_eq!(reason(gw.mediator.action_status(&other_id, action.id())), "not_found");
}

#[tokio::test]
async fn test_source_allowlist() {
    let gw = gateway(60);
    gw.mediator.update_settings(
        MediatorSettings::default().with_allowed_ips(vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))]),
    );
    assert_eq!(reason(gw.mediator.authenticate(None, IP)), "unauthorized");
    assert!(gw
        .mediator
        .authenticate(None, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)))
        .is_ok());
}

#[tokio::test]
async fn test_service_discovery_follows_registry() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));
    gw.expose("weather.home", EntityPolicy::new(AccessLevel::Read));
    gw.expose("sensor.broken", EntityPolicy::new(AccessLevel::Read));

    let services = gw.mediator.list_services(&anonymous()).await.unwrap();
    assert_eq!(services["light"], vec!["toggle", "turn_off", "turn_on"]);
    assert_eq!(services["weather"], vec!["get_forecasts"]);
    assert!(!services.contains_key("sensor"));
    assert!(!services.contains_key("lock"));

    gw.expose("light.office", EntityPolicy::new(AccessLevel::Off));
    let services = gw.mediator.list_services(&anonymous()).await.unwrap();
    assert!(!services.contains_key("light"));
}

#[tokio::test]
async fn test_history_needs_explicit_visible_entities() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Read));

    let err = gw
        .mediator
        .history(&anonymous(), start(), None, Vec::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind.reason_code(), "bad_request");

    let err = gw
        .mediator
        .history(&anonymous(), start(), None, vec!["light.office".into(), "lock.front_door".into()])
        .await
        .unwrap_err();
    assert_eq!(err.kind.reason_code(), "not_exposed");

    let history = gw
        .mediator
        .history(&anonymous(), start(), None, vec!["light.office".into()])
        .await
        .unwrap();
    assert_eq!(history.as_array().map(Vec::len), Some(1));
    assert_eq!(gw.upstream.history_queries().len(), 1);
}

#[tokio::test]
async fn test_confirm_level_holds_read_safe_services_too() {
    let gw = gateway(60);
    gw.expose("todo.shopping", EntityPolicy::new(AccessLevel::Confirm));

    let outcome = gw
        .call(&anonymous(), "todo", "get_items", json!({"entity_id": "todo.shopping"}))
        .await
        .unwrap();
    let CallOutcome::Pending { action, .. } = outcome else {
        panic!("expected a pending action, got {:?}", outcome);
    };
    assert_eq!(gw.upstream.invocation_count(), 0);

    gw.mediator.approve(action.id(), "operator").await.unwrap();
    let invoked = gw.upstream.invocations();
    assert_eq!(invoked.len(), 1);
    assert!(invoked[0].return_response);
}

#[tokio::test]
async fn test_area_and_device_targets_never_reach_upstream() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));

    for body in [
        json!({"entity_id": "light.office", "area_id": "whole_house", "device_id": "dev1"}),
        json!({"target": {"entity_id": "light.office", "label_id": "every_light"}}),
        json!({"entity_id": "light.office", "data": {"floor_id": "ground"}}),
    ] {
        let result = gw.mediator.invoke(&anonymous(), "light", "turn_on", body).await;
        assert_eq!(reason(result), "bad_request");
    }
    assert_eq!(gw.upstream.invocation_count(), 0);

    gw.call(&anonymous(), "light", "turn_on", json!({"entity_id": "light.office"}))
        .await
        .unwrap();
    let invoked = gw.upstream.invocations();
    assert_eq!(invoked.len(), 1);
    assert_eq!(invoked[0].body.keys().collect::<Vec<_>>(), vec!["entity_id"]);
}

#[tokio::test]
async fn test_failed_audit_write_does_not_fail_the_call() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));
    std::fs::create_dir(gw.mediator.audit().path()).unwrap();

    let outcome = gw
        .call(&anonymous(), "light", "turn_on", json!({"entity_id": "light.office"}))
        .await
        .unwrap();
    assert!(matches!(outcome, CallOutcome::Completed { .. }));
    assert_eq!(gw.upstream.invocation_count(), 1);
    assert_eq!(gw.mediator.audit().write_failures(), 1);
}

#[tokio::test]
async fn test_listing_actions_expires_overdue_ones() {
    let gw = gateway(60);
    gw.expose("lock.front_door", EntityPolicy::new(AccessLevel::Confirm));
    gw.call(&anonymous(), "lock", "unlock", json!({"entity_id": "lock.front_door"}))
        .await
        .unwrap();
    assert_eq!(gw.mediator.list_actions(Some(ActionStatus::Pending)).len(), 1);

    gw.clock.advance(Duration::seconds(121));
    assert!(gw.mediator.list_actions(Some(ActionStatus::Pending)).is_empty());
    let expired = gw.mediator.list_actions(Some(ActionStatus::Expired));
    assert_eq!(expired.len(), 1);
}

#[tokio::test]
async fn test_sensor_summary_reports_previous_state() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Read));
    gw.expose("switch.kitchen", EntityPolicy::new(AccessLevel::Control));
    gw.mediator.observe_change(&StateChange::new(
        "light.office",
        Some(EntityState::new("light.office", "off", Map::new())),
        Some(EntityState::new("light.office", "on", Map::new())),
    ));

    let summary = gw.mediator.sensor_summary(&anonymous()).await.unwrap();
    assert_eq!(*summary.total_sensors(), 2);
    let body = serde_json::to_value(&summary).unwrap();
    let office = body["sensors"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["entity_id"] == "light.office")
        .unwrap();
    assert_eq!(office["state"], "on");
    assert_eq!(office["last_state"], "off");
    assert_eq!(office["friendly_name"], "Office Light");
    let kitchen = body["sensors"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["entity_id"] == "switch.kitchen")
        .unwrap();
    assert_eq!(kitchen["last_state"], "off");
    assert_eq!(*summary.last_updated(), start());
}

#[tokio::test]
async fn test_compact_summary_follows_scope_and_settings() {
    let gw = gateway(60);
    gw.expose("light.office", EntityPolicy::new(AccessLevel::Control));
    gw.expose("switch.kitchen", EntityPolicy::new(AccessLevel::Control));
    gw.expose("sensor.broken", EntityPolicy::new(AccessLevel::Read));
    gw.mediator.update_settings(MediatorSettings::default().with_compact_mode(true));
    let issued = gw
        .mediator
        .keys()
        .issue("Assistant", Some(BTreeSet::from(["light.office".to_string()])), None)
        .unwrap();
    let identity = gw.mediator.authenticate(Some(&issued.secret), IP).unwrap();

    let summary = gw.mediator.sensor_summary(&identity).await.unwrap();
    let body = serde_json::to_value(&summary).unwrap();
    assert_eq!(body["sensors"], json!([{"entity_id": "light.office", "state": "on"}]));
    assert_eq!(body["total_sensors"], 1);
}
