//! Shared harness: a real gateway on an ephemeral port backed by an in-memory upstream.

#![allow(dead_code)]

use clawbridge_core::{EntityPolicy, SystemClock};
use clawbridge_security::testing::InMemoryUpstream;
use clawbridge_server::{AppState, Gateway, GatewayConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub struct TestServer {
    _dir: tempfile::TempDir,
    pub addr: SocketAddr,
    pub upstream: Arc<InMemoryUpstream>,
    pub state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
}

pub fn upstream() -> InMemoryUpstream {
    InMemoryUpstream::new()
        .with_entity("light.office", "on", "Office Light")
        .with_entity("light.porch", "off", "Porch Light")
        .with_entity("light.hidden", "on", "Hidden Light")
        .with_entity("lock.front_door", "locked", "Front Door")
        .with_entity("sensor.temperature", "21.5", "Temperature")
        .with_services("light", &["turn_on", "turn_off", "toggle"])
        .with_services("lock", &["lock", "unlock"])
}

/// Start a gateway with the default harness upstream.
pub async fn start(configure: impl FnOnce(GatewayConfig) -> GatewayConfig) -> TestServer {
    start_with(upstream(), configure).await
}

/// Start a gateway against a specific upstream.
pub async fn start_with(
    upstream: InMemoryUpstream,
    configure: impl FnOnce(GatewayConfig) -> GatewayConfig,
) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = configure(
        GatewayConfig::default()
            .with_data_dir(dir.path())
            .with_timezone("utc")
            .with_sweep_interval_seconds(1),
    );
    let upstream = Arc::new(upstream);
    let gateway = Gateway::assemble(config, upstream.clone(), Arc::new(SystemClock)).unwrap();
    let state = gateway.state().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(gateway.serve_on(listener, async move {
        let _ = rx.await;
    }));

    TestServer {
        _dir: dir,
        addr,
        upstream,
        state,
        shutdown: Some(tx),
    }
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/websocket", self.addr)
    }

    pub fn expose(&self, entity_id: &str, policy: EntityPolicy) {
        self.state.mediator.registry().set(entity_id, policy).unwrap();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
