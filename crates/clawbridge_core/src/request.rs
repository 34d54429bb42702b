//! Canonical service-call representation.
//!
//! Clients may name targets several equivalent ways (`entity_id` as a string or
//! a list, or nested under `target.entity_id`). Everything is normalized here
//! so the mediation pipeline has a single code path.
//!
//! Targeting keys other than `entity_id` (`area_id`, `device_id`, `floor_id`,
//! `label_id`) expand upstream to entities the registry never saw, so they are
//! refused wherever they appear: top level, under `target`, or under `data`.

use clawbridge_error::{MediationError, MediationErrorKind, MediationResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Targeting keys the upstream platform expands to many entities.
pub const EXPANDING_TARGET_KEYS: [&str; 4] = ["area_id", "device_id", "floor_id", "label_id"];

/// One service call against one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters, derive_new::new)]
pub struct ServiceCall {
    /// Service domain from the request path
    #[new(into)]
    domain: String,
    /// Service name from the request path
    #[new(into)]
    service: String,
    /// Target entity
    #[new(into)]
    entity_id: String,
    /// Service data with targeting keys removed
    params: Map<String, Value>,
}

impl ServiceCall {
    /// Mutable access to the parameters, for clamping.
    pub fn params_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.params
    }

    /// Body to send upstream: the parameters plus `entity_id`.
    pub fn upstream_body(&self) -> Map<String, Value> {
        let mut body = self.params.clone();
        body.insert("entity_id".to_string(), Value::String(self.entity_id.clone()));
        body
    }
}

/// A normalized inbound invocation, possibly naming several targets.
#[derive(Debug, Clone, PartialEq, derive_getters::Getters)]
pub struct ServiceRequest {
    /// Service domain
    domain: String,
    /// Service name
    service: String,
    /// Explicit targets; empty when the client named none
    targets: Vec<String>,
    /// Service data with targeting keys removed
    params: Map<String, Value>,
}

impl ServiceRequest {
    /// Normalize a request body.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` when the path segments are malformed, the body is not
    /// a JSON object, or a target is not a string.
    pub fn from_body(domain: &str, service: &str, body: Value) -> MediationResult<Self> {
        if !is_identifier(domain) || !is_identifier(service) {
            return Err(MediationError::new(MediationErrorKind::BadRequest(format!(
                "invalid service path {}/{}",
                domain, service
            ))));
        }
        let mut params = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(MediationError::new(MediationErrorKind::BadRequest(
                    "service data must be a JSON object".to_string(),
                )));
            }
        };

        reject_expanding_targets(&params)?;
        if let Some(Value::Object(data)) = params.get("data") {
            reject_expanding_targets(data)?;
        }

        let mut targets = Vec::new();
        if let Some(value) = params.remove("entity_id") {
            collect_targets(value, &mut targets)?;
        }
        if let Some(target) = params.remove("target") {
            match target {
                Value::Object(mut target) => {
                    reject_expanding_targets(&target)?;
                    if let Some(value) = target.remove("entity_id") {
                        collect_targets(value, &mut targets)?;
                    }
                }
                Value::Null => {}
                _ => {
                    return Err(MediationError::new(MediationErrorKind::BadRequest(
                        "target must be an object".to_string(),
                    )));
                }
            }
        }

        Ok(Self {
            domain: domain.to_string(),
            service: service.to_string(),
            targets,
            params,
        })
    }

    /// Build the per-entity calls for the given targets.
    pub fn calls_for<'a>(&'a self, targets: &'a [String]) -> impl Iterator<Item = ServiceCall> + 'a {
        targets.iter().map(move |entity_id| {
            ServiceCall::new(
                self.domain.clone(),
                self.service.clone(),
                entity_id.clone(),
                self.params.clone(),
            )
        })
    }
}

fn reject_expanding_targets(map: &Map<String, Value>) -> MediationResult<()> {
    match EXPANDING_TARGET_KEYS.iter().find(|key| map.contains_key(**key)) {
        Some(key) => Err(MediationError::new(MediationErrorKind::BadRequest(format!(
            "{} targeting is not supported; name entities with entity_id",
            key
        )))),
        None => Ok(()),
    }
}

fn collect_targets(value: Value, targets: &mut Vec<String>) -> MediationResult<()> {
    match value {
        Value::String(id) => push_target(id, targets),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(id) => push_target(id, targets)?,
                    _ => {
                        return Err(MediationError::new(MediationErrorKind::BadRequest(
                            "entity_id entries must be strings".to_string(),
                        )));
                    }
                }
            }
            Ok(())
        }
        Value::Null => Ok(()),
        _ => Err(MediationError::new(MediationErrorKind::BadRequest(
            "entity_id must be a string or list of strings".to_string(),
        ))),
    }
}

fn push_target(id: String, targets: &mut Vec<String>) -> MediationResult<()> {
    let id = id.trim().to_string();
    if id.is_empty() || id.eq_ignore_ascii_case("all") {
        // "all" is the upstream wildcard; it must never reach the pipeline.
        return Err(MediationError::new(MediationErrorKind::BadRequest(format!(
            "invalid entity_id '{}'",
            id
        ))));
    }
    if !targets.contains(&id) {
        targets.push(id);
    }
    Ok(())
}

fn is_identifier(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
