//! Upstream event stream listener.
//!
//! Holds one WebSocket session to the platform: waits for `auth_required`,
//! authenticates, subscribes to state changes and notification actions, and
//! republishes them on a broadcast channel. Lost sessions are re-established
//! after a fixed delay.

use clawbridge_core::{EntityState, StateChange, UpstreamEvent};
use clawbridge_error::{UpstreamError, UpstreamErrorKind};
use futures::{SinkExt, Stream, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, instrument, warn};

/// Delay before reconnecting a lost session.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIPTIONS: [(u64, &str); 2] = [(1, "state_changed"), (2, "mobile_app_notification_action")];

fn ws_error(err: tungstenite::Error) -> UpstreamError {
    UpstreamError::new(UpstreamErrorKind::WebSocket(err.to_string()))
}

fn state_field(data: &Value, key: &str) -> Option<EntityState> {
    data.get(key)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Decode one event-stream frame.
///
/// Returns `None` for results, pings and event types the gateway ignores.
pub fn parse_event(frame: &Value) -> Option<UpstreamEvent> {
    if frame.get("type")?.as_str()? != "event" {
        return None;
    }
    let event = frame.get("event")?;
    let data = event.get("data")?;
    match event.get("event_type")?.as_str()? {
        "state_changed" => {
            let entity_id = data.get("entity_id")?.as_str()?;
            Some(UpstreamEvent::StateChanged(StateChange::new(
                entity_id,
                state_field(data, "old_state"),
                state_field(data, "new_state"),
            )))
        }
        "mobile_app_notification_action" => Some(UpstreamEvent::NotificationAction {
            action: data.get("action")?.as_str()?.to_string(),
        }),
        _ => None,
    }
}

async fn next_json<S>(stream: &mut S) -> Result<Value, UpstreamError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message.map_err(ws_error)? {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|e| UpstreamError::new(UpstreamErrorKind::Decode(e.to_string())));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(UpstreamError::new(UpstreamErrorKind::WebSocket(
        "connection closed during handshake".to_string(),
    )))
}

/// Keeps the platform event stream flowing into a broadcast channel.
#[derive(Debug, Clone)]
pub struct EventListener {
    url: String,
    token: Option<String>,
    events: broadcast::Sender<UpstreamEvent>,
    reconnect_delay: Duration,
}

impl EventListener {
    /// Listener for `url` publishing into `events`.
    pub fn new(url: impl Into<String>, token: Option<String>, events: broadcast::Sender<UpstreamEvent>) -> Self {
        Self {
            url: url.into(),
            token,
            events,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    /// Override the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Run sessions forever.
    pub async fn run(self) {
        loop {
            match self.session().await {
                Ok(()) => info!("Upstream event stream closed"),
                Err(e) => warn!(error = %e, "Upstream event stream lost"),
            }
            debug!(delay_secs = self.reconnect_delay.as_secs(), "Reconnecting to upstream event stream");
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// One session: handshake, subscribe, then forward events until the
    /// connection ends.
    ///
    /// # Errors
    ///
    /// `WebSocket` for transport failures, `Auth` when the platform rejects
    /// the token.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn session(&self) -> Result<(), UpstreamError> {
        let (mut ws, _) = connect_async(self.url.as_str()).await.map_err(ws_error)?;
        debug!("Upstream event stream connected");

        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.authenticate(&mut ws))
            .await
            .map_err(|_| UpstreamError::new(UpstreamErrorKind::WebSocket("handshake timed out".to_string())))??;
        info!("Upstream event stream authenticated");

        for (id, event_type) in SUBSCRIPTIONS {
            let request = json!({ "id": id, "type": "subscribe_events", "event_type": event_type });
            ws.send(Message::text(request.to_string())).await.map_err(ws_error)?;
        }

        while let Some(message) = ws.next().await {
            match message.map_err(ws_error)? {
                Message::Text(text) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    if let Some(event) = parse_event(&frame) {
                        // No receivers is normal before the first client connects.
                        let _ = self.events.send(event);
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }

    async fn authenticate<S>(&self, ws: &mut S) -> Result<(), UpstreamError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + futures::Sink<Message, Error = tungstenite::Error>
            + Unpin,
    {
        let greeting = next_json(ws).await?;
        if greeting.get("type").and_then(Value::as_str) != Some("auth_required") {
            return Ok(());
        }
        let token = self.token.as_deref().ok_or_else(|| {
            UpstreamError::new(UpstreamErrorKind::Auth("no upstream token configured".to_string()))
        })?;
        let auth = json!({ "type": "auth", "access_token": token });
        ws.send(Message::text(auth.to_string())).await.map_err(ws_error)?;
        let reply = next_json(ws).await?;
        match reply.get("type").and_then(Value::as_str) {
            Some("auth_ok") => Ok(()),
            other => Err(UpstreamError::new(UpstreamErrorKind::Auth(format!(
                "platform answered {}",
                other.unwrap_or("nothing")
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_changed_frame() {
        let frame = json!({
            "id": 1,
            "type": "event",
            "event": {
                "event_type": "state_changed",
                "data": {
                    "entity_id": "light.office",
                    "old_state": null,
                    "new_state": {"entity_id": "light.office", "state": "on", "attributes": {}}
                }
            }
        });
        let Some(UpstreamEvent::StateChanged(change)) = parse_event(&frame) else {
            panic!("expected a state change");
        };
        assert_eq!(change.entity_id(), "light.office");
        assert!(change.old_state().is_none());
        assert_eq!(change.new_state().as_ref().unwrap().state(), "on");
    }

    #[test]
    fn test_notification_action_frame() {
        let frame = json!({
            "type": "event",
            "event": {
                "event_type": "mobile_app_notification_action",
                "data": {"action": "CLAWBRIDGE_DENY_abc"}
            }
        });
        assert_eq!(
            parse_event(&frame),
            Some(UpstreamEvent::NotificationAction {
                action: "CLAWBRIDGE_DENY_abc".to_string()
            })
        );
    }

    #[test]
    fn test_results_are_ignored() {
        assert_eq!(parse_event(&json!({"id": 1, "type": "result", "success": true})), None);
    }
}
