//! Audit record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Outcome recorded for one mediated operation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditResult {
    /// Forwarded and answered by upstream
    Success,
    /// Refused by policy
    Denied,
    /// Upstream failed
    Error,
    /// Refused by the rate limiter
    RateLimited,
    /// Forwarded with at least one parameter clamped
    Clamped,
    /// Held for human confirmation
    Pending,
    /// Approved by a human and forwarded
    Approved,
    /// Denied by a human
    DeniedByHuman,
    /// Confirmation timed out
    Expired,
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters, derive_setters::Setters)]
#[setters(prefix = "with_")]
pub struct AuditRecord {
    /// When the outcome was reached
    #[setters(skip)]
    timestamp: DateTime<Utc>,
    /// Target entity
    #[setters(skip)]
    entity_id: String,
    /// Service domain, if a service was involved
    #[setters(strip_option, into)]
    domain: Option<String>,
    /// Service name, if a service was involved
    #[setters(strip_option, into)]
    service: Option<String>,
    /// Outcome
    #[setters(skip)]
    result: AuditResult,
    /// Attribution (`key_id@ip`, `ip`, or `operator`)
    #[setters(skip)]
    source_identity: String,
    /// Time spent on the operation
    latency_ms: u64,
    /// Reason code or message for non-success outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[setters(strip_option, into)]
    reason: Option<String>,
    /// Parameters as forwarded (after clamping)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[setters(strip_option)]
    params: Option<Map<String, Value>>,
}

impl AuditRecord {
    /// Start a record; optional fields are attached with the `with_` setters.
    pub fn new(
        timestamp: DateTime<Utc>,
        entity_id: impl Into<String>,
        result: AuditResult,
        source_identity: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            entity_id: entity_id.into(),
            domain: None,
            service: None,
            result,
            source_identity: source_identity.into(),
            latency_ms: 0,
            reason: None,
            params: None,
        }
    }
}

/// Filter for audit queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, derive_setters::Setters)]
#[setters(prefix = "with_", strip_option)]
pub struct AuditQuery {
    /// Only this entity
    #[setters(into)]
    pub entity_id: Option<String>,
    /// Only this outcome
    pub result: Option<AuditResult>,
    /// Records at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Records at or before this instant
    pub until: Option<DateTime<Utc>>,
    /// Maximum records to return (capped at [`AuditQuery::MAX_LIMIT`])
    pub limit: Option<usize>,
}

impl AuditQuery {
    /// Default number of records returned.
    pub const DEFAULT_LIMIT: usize = 100;
    /// Hard cap on records returned.
    pub const MAX_LIMIT: usize = 500;

    /// Effective limit after defaults and the cap.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    /// Whether a record passes the filter.
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.entity_id
            .as_ref()
            .is_none_or(|id| id == record.entity_id())
            && self.result.is_none_or(|r| r == *record.result())
            && self.since.is_none_or(|s| *record.timestamp() >= s)
            && self.until.is_none_or(|u| *record.timestamp() <= u)
    }
}

/// Aggregate counts over the retained audit log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStats {
    /// Total records retained
    pub total: usize,
    /// Records in the last 24 hours
    pub last_24h: usize,
    /// Records in the last 7 days
    pub last_7d: usize,
    /// Records per outcome
    pub by_result: BTreeMap<AuditResult, usize>,
    /// Records per outcome in the last 24 hours
    pub by_result_24h: BTreeMap<AuditResult, usize>,
    /// Most frequently touched entities, busiest first
    pub top_entities: Vec<(String, usize)>,
    /// Entities with the most refusals, busiest first
    pub top_denied: Vec<(String, usize)>,
    /// Most active source identities, busiest first
    pub top_identities: Vec<(String, usize)>,
    /// Records per hour over the last 24 hours; index 0 is the most recent hour
    pub hourly: [usize; 24],
    /// Mean latency over all records
    pub average_latency_ms: f64,
    /// Percentage of last-24h records that reached upstream successfully
    pub success_rate_24h: Option<f64>,
    /// Records whose write failed since startup
    pub write_failures: u64,
}

impl AuditResult {
    /// Whether the call reached upstream successfully.
    pub fn is_forwarded(self) -> bool {
        matches!(self, Self::Success | Self::Clamped | Self::Approved)
    }

    /// Whether the call was refused by policy, limiter or a human.
    pub fn is_refusal(self) -> bool {
        matches!(self, Self::Denied | Self::RateLimited | Self::DeniedByHuman)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_result_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(AuditResult::DeniedByHuman).unwrap(),
            "denied_by_human"
        );
        assert_eq!(AuditResult::RateLimited.to_string(), "rate_limited");
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let record = AuditRecord::new(Utc::now(), "light.office", AuditResult::Success, "10.0.0.1")
            .with_domain("light")
            .with_service("turn_on")
            .with_latency_ms(12);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["result"], "success");
        assert!(json.get("reason").is_none());
        assert_eq!(json["latency_ms"], 12);
    }

    #[test]
    fn test_query_filters() {
        let now = Utc::now();
        let record = AuditRecord::new(now, "lock.front_door", AuditResult::Denied, "10.0.0.1");
        assert!(AuditQuery::default().matches(&record));
        assert!(AuditQuery::default().with_entity_id("lock.front_door").matches(&record));
        assert!(!AuditQuery::default().with_result(AuditResult::Success).matches(&record));
        assert!(!AuditQuery::default()
            .with_since(now + Duration::seconds(1))
            .matches(&record));
        assert_eq!(AuditQuery::default().with_limit(10_000).effective_limit(), 500);
    }
}
