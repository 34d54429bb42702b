//! Entity access policies and parameter constraints.

use crate::AccessLevel;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Maximum stored annotation length in characters.
pub const MAX_ANNOTATION_CHARS: usize = 500;

/// Numeric bounds for one service parameter.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, derive_new::new)]
pub struct ParamConstraint {
    /// Inclusive lower bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ParamConstraint {
    /// Clamp a value into `[min, max]`.
    ///
    /// In-range values come back unchanged; out-of-range values come back as
    /// the nearest bound.
    pub fn clamp(&self, value: f64) -> f64 {
        let mut clamped = value;
        if let Some(min) = self.min {
            clamped = clamped.max(min);
        }
        if let Some(max) = self.max {
            clamped = clamped.min(max);
        }
        clamped
    }

    /// Whether the bounds are coherent.
    pub fn is_valid(&self) -> bool {
        match (self.min, self.max) {
            (Some(min), Some(max)) => min.is_finite() && max.is_finite() && min <= max,
            (Some(bound), None) | (None, Some(bound)) => bound.is_finite(),
            (None, None) => true,
        }
    }
}

/// Record of one parameter that was clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClampedParam {
    /// Parameter name
    pub param: String,
    /// Value the client sent
    pub value: Value,
    /// Value forwarded upstream
    pub clamped_to: Value,
    /// Constraint applied
    #[serde(flatten)]
    pub constraint: ParamConstraint,
}

/// Clamp every numeric parameter that has a constraint.
///
/// Parameters without a constraint and non-numeric values pass through.
/// Integers stay integers when the bound they were clamped to is integral.
pub fn clamp_params(
    params: &mut Map<String, Value>,
    constraints: &BTreeMap<String, ParamConstraint>,
) -> Vec<ClampedParam> {
    let mut clamped = Vec::new();
    for (param, constraint) in constraints {
        let Some(value) = params.get_mut(param) else {
            continue;
        };
        let Some(number) = value.as_f64() else {
            continue;
        };
        let bounded = constraint.clamp(number);
        if bounded == number {
            continue;
        }
        let replacement = if (value.is_i64() || value.is_u64()) && bounded.fract() == 0.0 {
            Value::Number(Number::from(bounded as i64))
        } else {
            match Number::from_f64(bounded) {
                Some(n) => Value::Number(n),
                None => continue,
            }
        };
        clamped.push(ClampedParam {
            param: param.clone(),
            value: value.clone(),
            clamped_to: replacement.clone(),
            constraint: *constraint,
        });
        *value = replacement;
    }
    clamped
}

/// Access policy for one entity.
///
/// Absence from the registry is equivalent to `access_level = off`.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Default,
    Serialize,
    Deserialize,
    derive_getters::Getters,
    derive_setters::Setters,
)]
#[setters(prefix = "with_")]
pub struct EntityPolicy {
    /// Trust tier
    #[serde(default)]
    access_level: AccessLevel,
    /// Operator note shown to clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[setters(strip_option)]
    annotation: Option<String>,
    /// Parameter bounds enforced on service calls
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    constraints: BTreeMap<String, ParamConstraint>,
    /// Schedule gating confirm/control calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[setters(strip_option)]
    schedule_id: Option<String>,
}

impl EntityPolicy {
    /// Policy with the given level and nothing else.
    pub fn new(access_level: AccessLevel) -> Self {
        Self {
            access_level,
            ..Self::default()
        }
    }

    /// Add one parameter constraint.
    pub fn with_constraint(mut self, param: impl Into<String>, constraint: ParamConstraint) -> Self {
        self.constraints.insert(param.into(), constraint);
        self
    }

    /// Drop the schedule reference.
    pub fn clear_schedule(&mut self) {
        self.schedule_id = None;
    }

    /// Set the trust tier in place.
    pub fn set_access_level(&mut self, level: AccessLevel) {
        self.access_level = level;
    }

    /// Trim the annotation, cap its length and drop it when empty.
    pub fn normalize_annotation(&mut self) {
        self.annotation = self
            .annotation
            .take()
            .map(|text| text.trim().chars().take(MAX_ANNOTATION_CHARS).collect::<String>())
            .filter(|text| !text.is_empty());
    }
}
