//! HTTP and WebSocket front end of the ClawBridge gateway.
//!
//! Serves the client data plane (`/api/...`), the operator surface
//! (`/operator/...`) and the state broadcast channel, and connects to the
//! upstream platform over REST and its event stream.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod api;
mod config;
mod events;
mod gateway;
mod ha_client;
mod hub;
mod notifier;
mod operator;
mod response;
mod state;
mod tasks;
mod ws;

pub use api::{CLAMPED_HEADER, Client, bearer_token};
pub use config::{DomainConfig, GatewayConfig, TOKEN_ENV_VARS, UpstreamConfig, resolve_token};
pub use events::{EventListener, RECONNECT_DELAY, parse_event};
pub use gateway::Gateway;
pub use ha_client::HomeAssistantClient;
pub use hub::{BroadcastHub, ConnectionId};
pub use notifier::NotifyServiceNotifier;
pub use operator::OperatorSettings;
pub use response::{ApiError, ApiResult};
pub use state::{AppState, OperatorToken};
pub use tasks::{
    BackgroundTasks, spawn_audit_prune, spawn_event_dispatch, spawn_expiry_sweep,
    spawn_limiter_prune,
};
