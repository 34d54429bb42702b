//! Out-of-band approval prompts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clawbridge_core::PendingAction;
use clawbridge_error::UpstreamError;
use serde::Serialize;

/// Prefix of the notification action that approves a pending action.
pub const APPROVE_ACTION_PREFIX: &str = "CLAWBRIDGE_APPROVE_";
/// Prefix of the notification action that denies a pending action.
pub const DENY_ACTION_PREFIX: &str = "CLAWBRIDGE_DENY_";

/// Decision carried by a tapped notification button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum NotificationDecision {
    /// Approve button
    Approve,
    /// Deny button
    Deny,
}

/// Split a notification action string into a decision and an action id.
///
/// ```
/// use clawbridge_security::{NotificationDecision, parse_notification_action};
///
/// assert_eq!(
///     parse_notification_action("CLAWBRIDGE_DENY_abc"),
///     Some((NotificationDecision::Deny, "abc"))
/// );
/// assert_eq!(parse_notification_action("OTHER_APP_abc"), None);
/// ```
pub fn parse_notification_action(action: &str) -> Option<(NotificationDecision, &str)> {
    let (decision, id) = if let Some(id) = action.strip_prefix(APPROVE_ACTION_PREFIX) {
        (NotificationDecision::Approve, id)
    } else if let Some(id) = action.strip_prefix(DENY_ACTION_PREFIX) {
        (NotificationDecision::Deny, id)
    } else {
        return None;
    };
    (!id.is_empty()).then_some((decision, id))
}

/// Everything a notifier needs to render an approval prompt.
#[derive(Debug, Clone, PartialEq, Serialize, derive_getters::Getters)]
pub struct ApprovalNotice {
    /// Pending action id
    action_id: String,
    /// Target entity
    entity_id: String,
    /// Display name of the entity
    friendly_name: String,
    /// Service domain
    domain: String,
    /// Service name
    service: String,
    /// Attribution of the requester
    requested_by: String,
    /// Decision deadline
    expires_at: DateTime<Utc>,
    /// Action string for the approve button
    approve_action: String,
    /// Action string for the deny button
    deny_action: String,
    /// Display name of the requesting agent
    agent_name: String,
}

impl ApprovalNotice {
    /// Notice for a pending action.
    pub fn for_action(
        action: &PendingAction,
        friendly_name: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            action_id: action.id().clone(),
            entity_id: action.call().entity_id().clone(),
            friendly_name: friendly_name.into(),
            domain: action.call().domain().clone(),
            service: action.call().service().clone(),
            requested_by: action.requested_by().clone(),
            expires_at: *action.expires_at(),
            approve_action: format!("{}{}", APPROVE_ACTION_PREFIX, action.id()),
            deny_action: format!("{}{}", DENY_ACTION_PREFIX, action.id()),
            agent_name: agent_name.into(),
        }
    }

    /// Prompt title.
    pub fn title(&self) -> String {
        format!("{} requests action", self.agent_name)
    }

    /// Prompt body.
    pub fn message(&self) -> String {
        format!(
            "{}: {}.{} (requested by {})",
            self.friendly_name, self.domain, self.service, self.requested_by
        )
    }
}

/// Delivers approval prompts to a human.
///
/// Delivery is best effort: a failed notification never fails the request
/// that queued the action.
#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug {
    /// Send a prompt for one pending action.
    async fn notify_approval(&self, notice: &ApprovalNotice) -> Result<(), UpstreamError>;
}

/// Notifier for deployments without a notify target.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_approval(&self, _notice: &ApprovalNotice) -> Result<(), UpstreamError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawbridge_core::ServiceCall;
    use serde_json::Map;

    #[test]
    fn test_notice_carries_both_actions() {
        let now = Utc::now();
        let call = ServiceCall::new("lock", "unlock", "lock.front_door", Map::new());
        let action = PendingAction::new("a1b2", call, None, "cbk_x@10.0.0.2", now, now);
        let notice = ApprovalNotice::for_action(&action, "Front Door", "Claw");
        assert_eq!(notice.approve_action(), "CLAWBRIDGE_APPROVE_a1b2");
        assert_eq!(notice.deny_action(), "CLAWBRIDGE_DENY_a1b2");
        assert_eq!(notice.title(), "Claw requests action");
        assert_eq!(notice.message(), "Front Door: lock.unlock (requested by cbk_x@10.0.0.2)");
    }

    #[test]
    fn test_empty_action_id_is_ignored() {
        assert_eq!(parse_notification_action("CLAWBRIDGE_APPROVE_"), None);
        assert_eq!(
            parse_notification_action("CLAWBRIDGE_APPROVE_x1"),
            Some((NotificationDecision::Approve, "x1"))
        );
    }
}
