//! Assembly of the gateway from its configuration.

use crate::{
    AppState, BackgroundTasks, BroadcastHub, EventListener, GatewayConfig, HomeAssistantClient,
    NotifyServiceNotifier, api, operator, tasks,
};
use axum::Router;
use clawbridge_core::{Clock, SystemClock};
use clawbridge_error::{ClawbridgeResult, ConfigError, StorageError};
use clawbridge_rate_limit::RequestLimiter;
use clawbridge_security::{
    ApiKeyStore, AuditLog, ConfirmationQueue, ExposureRegistry, JsonStore, NoopNotifier, Notifier,
    RequestMediator, RequestMediatorBuilder, ScheduleEvaluator, Upstream,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// A fully wired gateway, ready to serve.
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    state: AppState,
    listener: Option<EventListener>,
}

impl Gateway {
    /// Build against the configured upstream platform.
    ///
    /// # Errors
    ///
    /// Storage errors for unreadable state files, configuration errors for
    /// invalid settings, upstream errors when the HTTP client cannot be built.
    #[instrument(skip_all)]
    pub fn from_config(config: GatewayConfig) -> ClawbridgeResult<Self> {
        let token = config.upstream_token();
        let client = HomeAssistantClient::new(
            config.upstream().base_url(),
            token.as_deref(),
            Duration::from_secs(*config.upstream().request_timeout_seconds()),
        )?;
        let listener = EventListener::new(
            config.upstream().websocket_url().clone(),
            token,
            client.event_sender(),
        );
        let mut gateway = Self::assemble(config, Arc::new(client), Arc::new(SystemClock))?;
        gateway.listener = Some(listener);
        Ok(gateway)
    }

    /// Build against any upstream and clock.
    ///
    /// # Errors
    ///
    /// Storage errors for unreadable state files, configuration errors for
    /// invalid settings.
    pub fn assemble(config: GatewayConfig, upstream: Arc<dyn Upstream>, clock: Arc<dyn Clock>) -> ClawbridgeResult<Self> {
        let data_dir = config.data_dir().clone();
        std::fs::create_dir_all(&data_dir).map_err(StorageError::from)?;

        let registry = Arc::new(ExposureRegistry::open(
            JsonStore::new(data_dir.join("registry.json")),
            config.domain_tables(),
        )?);
        let keys = Arc::new(ApiKeyStore::open(
            JsonStore::new(data_dir.join("api_keys.json")),
            clock.clone(),
        )?);
        let notifier: Arc<dyn Notifier> = match config.notify_target() {
            Some(target) => Arc::new(NotifyServiceNotifier::new(upstream.clone(), target)),
            None => Arc::new(NoopNotifier),
        };

        let mediator = RequestMediatorBuilder::default()
            .registry(registry.clone())
            .keys(keys.clone())
            .limiter(Arc::new(RequestLimiter::new(
                *config.rate_limit_per_minute(),
                clock.clone(),
            )))
            .schedules(ScheduleEvaluator::new(config.timezone()?, clock.clone()))
            .queue(Arc::new(ConfirmationQueue::new(
                *config.confirm_timeout_seconds(),
                clock.clone(),
            )))
            .audit(Arc::new(AuditLog::new(
                data_dir.join("audit.jsonl"),
                *config.audit_enabled(),
                clock.clone(),
            )))
            .upstream(upstream)
            .notifier(notifier)
            .clock(clock)
            .settings(config.mediator_settings())
            .build()
            .map_err(|e| ConfigError::new(format!("Failed to assemble mediator: {}", e)))?;

        let hub = Arc::new(BroadcastHub::new(registry, keys, *config.broadcast_buffer()));
        let state = AppState::new(Arc::new(mediator), hub, config.operator_token().clone());
        info!(data_dir = %data_dir.display(), "Gateway assembled");
        Ok(Self {
            config,
            state,
            listener: None,
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The request mediator.
    pub fn mediator(&self) -> &Arc<RequestMediator> {
        &self.state.mediator
    }

    /// Data plane at `/`, operator surface at `/operator`.
    pub fn router(&self) -> Router {
        Router::new()
            .merge(api::router())
            .nest("/operator", operator::router(self.state.clone()))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start sweeps, retention, event dispatch and the upstream listener.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let mediator = self.state.mediator.clone();
        let mut background = BackgroundTasks::default();
        background.push(tasks::spawn_expiry_sweep(
            mediator.clone(),
            Duration::from_secs(*self.config.sweep_interval_seconds()),
        ));
        background.push(tasks::spawn_audit_prune(
            mediator.clone(),
            *self.config.audit_retention_days(),
        ));
        background.push(tasks::spawn_limiter_prune(mediator.clone()));
        background.push(tasks::spawn_event_dispatch(
            mediator.clone(),
            self.state.hub.clone(),
            mediator.upstream().subscribe_events(),
        ));
        if let Some(listener) = self.listener.clone() {
            background.push(tokio::spawn(listener.run()));
        }
        background
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// A configuration error when the address cannot be bound, otherwise as
    /// [`serve_on`](Self::serve_on).
    pub async fn serve<F>(self, shutdown: F) -> ClawbridgeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ConfigError::new(format!("Cannot bind {}: {}", addr, e)))?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// A storage (I/O) error when the server fails.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> ClawbridgeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "ClawBridge listening");
        }

        let background = self.spawn_background();
        let served = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        self.state.hub.close_all();
        background.shutdown();
        served.map_err(StorageError::from)?;
        info!("ClawBridge stopped");
        Ok(())
    }
}
