//! Approval prompts delivered through the platform's `notify` services.

use async_trait::async_trait;
use clawbridge_error::UpstreamError;
use clawbridge_security::{ApprovalNotice, Notifier, Upstream};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{info, instrument};

/// Sends approval prompts with approve/deny buttons via `notify.<target>`.
#[derive(Debug, Clone, derive_new::new)]
pub struct NotifyServiceNotifier {
    upstream: Arc<dyn Upstream>,
    /// Notify target, e.g. `mobile_app_phone`
    #[new(into)]
    target: String,
}

impl NotifyServiceNotifier {
    /// Service body for one notice.
    pub fn body(notice: &ApprovalNotice) -> Map<String, Value> {
        let body = json!({
            "title": notice.title(),
            "message": notice.message(),
            "data": {
                "tag": notice.action_id(),
                "actions": [
                    { "action": notice.approve_action(), "title": "Approve" },
                    { "action": notice.deny_action(), "title": "Deny" }
                ]
            }
        });
        match body {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

#[async_trait]
impl Notifier for NotifyServiceNotifier {
    #[instrument(skip(self, notice), fields(target = %self.target, action_id = %notice.action_id()))]
    async fn notify_approval(&self, notice: &ApprovalNotice) -> Result<(), UpstreamError> {
        self.upstream
            .invoke_service("notify", &self.target, Self::body(notice), false)
            .await?;
        info!("Approval prompt sent");
        Ok(())
    }
}
