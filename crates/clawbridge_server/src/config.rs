//! Gateway configuration.
//!
//! Loaded from an optional TOML file overlaid with `CLAWBRIDGE_*` environment
//! variables (`__` separates nested keys, e.g. `CLAWBRIDGE_UPSTREAM__BASE_URL`).
//! Out-of-range values are clamped rather than rejected.

use clawbridge_core::{DomainTables, GatewayTimezone};
use clawbridge_error::ConfigError;
use clawbridge_security::{MAX_CONFIRM_TIMEOUT_SECS, MIN_CONFIRM_TIMEOUT_SECS, MediatorSettings};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MAX_AGENT_NAME_CHARS: usize = 50;
/// Environment variables consulted for the upstream token, in order.
pub const TOKEN_ENV_VARS: [&str; 2] = ["SUPERVISOR_TOKEN", "HASSIO_TOKEN"];

/// Connection to the protected platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_getters::Getters)]
pub struct UpstreamConfig {
    /// REST base, without the `/api` suffix
    #[serde(default = "UpstreamConfig::default_base_url")]
    base_url: String,
    /// Event stream endpoint
    #[serde(default = "UpstreamConfig::default_websocket_url")]
    websocket_url: String,
    /// Access token; falls back to the supervisor environment
    #[serde(default, skip_serializing)]
    token: Option<String>,
    /// Per-request timeout
    #[serde(default = "UpstreamConfig::default_timeout")]
    request_timeout_seconds: u64,
}

impl UpstreamConfig {
    fn default_base_url() -> String {
        "http://supervisor/core".to_string()
    }

    fn default_websocket_url() -> String {
        "ws://supervisor/core/websocket".to_string()
    }

    fn default_timeout() -> u64 {
        10
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            websocket_url: Self::default_websocket_url(),
            token: None,
            request_timeout_seconds: Self::default_timeout(),
        }
    }
}

/// Domain lookup tables as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_getters::Getters)]
#[serde(default)]
pub struct DomainConfig {
    /// Domains whose entities never go above `read`
    read_only: Vec<String>,
    /// `domain.service` pairs allowed at `read`
    read_safe_services: Vec<String>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        let tables = DomainTables::default();
        Self {
            read_only: tables.read_only().iter().cloned().collect(),
            read_safe_services: tables.read_safe_services().iter().cloned().collect(),
        }
    }
}

/// Complete gateway configuration.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Serialize,
    Deserialize,
    derive_getters::Getters,
    derive_setters::Setters,
)]
#[setters(prefix = "with_")]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address for both planes
    #[setters(into)]
    bind_address: String,
    /// Directory holding registry, keys and audit log
    #[setters(into)]
    data_dir: PathBuf,
    /// Upstream platform connection
    upstream: UpstreamConfig,
    /// Global per-minute budget for service calls
    rate_limit_per_minute: u32,
    /// How long a confirmation stays open
    confirm_timeout_seconds: u64,
    /// `notify.<target>` used for approval prompts; empty disables them
    #[setters(into)]
    confirm_notify_service: String,
    /// Agent display name in approval prompts
    #[setters(into)]
    agent_name: String,
    /// Persist audit records
    audit_enabled: bool,
    /// Days of audit history kept
    audit_retention_days: u32,
    /// Data-plane source allowlist; empty admits all
    allowed_ips: Vec<IpAddr>,
    /// Omit unavailable entities from state listings
    filter_unavailable: bool,
    /// Sensor summaries carry only entity id and state
    compact_mode: bool,
    /// `local`, `utc` or a fixed offset such as `+02:00`
    #[getter(skip)]
    #[setters(into)]
    timezone: String,
    /// Per-connection event queue capacity
    broadcast_buffer: usize,
    /// Confirmation expiry sweep period
    sweep_interval_seconds: u64,
    /// Bearer token for the operator surface; unset leaves it to the proxy in front
    #[serde(skip_serializing)]
    #[setters(strip_option, into)]
    operator_token: Option<String>,
    /// Emit logs as JSON lines
    json_logs: bool,
    /// Domain lookup tables
    domains: DomainConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8099".to_string(),
            data_dir: PathBuf::from("./data"),
            upstream: UpstreamConfig::default(),
            rate_limit_per_minute: 60,
            confirm_timeout_seconds: 120,
            confirm_notify_service: String::new(),
            agent_name: "AI".to_string(),
            audit_enabled: true,
            audit_retention_days: 30,
            allowed_ips: Vec::new(),
            filter_unavailable: true,
            compact_mode: false,
            timezone: "local".to_string(),
            broadcast_buffer: 256,
            sweep_interval_seconds: 15,
            operator_token: None,
            json_logs: false,
            domains: DomainConfig::default(),
        }
    }
}

fn config_error(context: &str, err: config::ConfigError) -> ConfigError {
    ConfigError::new(format!("{}: {}", context, err))
}

impl GatewayConfig {
    /// Load from an optional TOML file and the `CLAWBRIDGE_*` environment.
    ///
    /// A path that is given but missing is an error; no path means defaults
    /// plus environment.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for unreadable files, unparsable values, an
    /// invalid timezone or bind address.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::new(format!(
                    "Configuration file {} not found",
                    path.display()
                )));
            }
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix("CLAWBRIDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("allowed_ips")
                .with_list_parse_key("domains.read_only")
                .with_list_parse_key("domains.read_safe_services"),
        );
        let config: GatewayConfig = builder
            .build()
            .map_err(|e| config_error("Failed to build configuration", e))?
            .try_deserialize()
            .map_err(|e| config_error("Failed to deserialize configuration", e))?;
        config.normalized()
    }

    /// Parse a TOML document without consulting the environment.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .map_err(|e| config_error("Failed to parse configuration", e))?
            .try_deserialize()
            .map_err(|e| config_error("Failed to deserialize configuration", e))?;
        config.normalized()
    }

    /// Clamp ranges and validate the fields that must parse.
    fn normalized(mut self) -> Result<Self, ConfigError> {
        self.rate_limit_per_minute = self.rate_limit_per_minute.clamp(1, 600);
        self.confirm_timeout_seconds = self
            .confirm_timeout_seconds
            .clamp(MIN_CONFIRM_TIMEOUT_SECS, MAX_CONFIRM_TIMEOUT_SECS);
        self.audit_retention_days = self.audit_retention_days.clamp(1, 365);
        self.broadcast_buffer = self.broadcast_buffer.max(1);
        self.sweep_interval_seconds = self.sweep_interval_seconds.max(1);
        self.upstream.request_timeout_seconds = self.upstream.request_timeout_seconds.max(1);

        let agent_name: String = self
            .agent_name
            .trim()
            .chars()
            .take(MAX_AGENT_NAME_CHARS)
            .collect();
        self.agent_name = if agent_name.is_empty() {
            "AI".to_string()
        } else {
            agent_name
        };
        self.confirm_notify_service = self.confirm_notify_service.trim().to_string();
        self.operator_token = self
            .operator_token
            .take()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        self.timezone()?;
        self.bind_addr()?;
        debug!(
            rate_limit = self.rate_limit_per_minute,
            confirm_timeout = self.confirm_timeout_seconds,
            "Configuration normalized"
        );
        Ok(self)
    }

    /// Parsed listen address.
    ///
    /// # Errors
    ///
    /// `ConfigError` when `bind_address` is not `ip:port`.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_address
            .parse()
            .map_err(|e| ConfigError::new(format!("Invalid bind_address '{}': {}", self.bind_address, e)))
    }

    /// Parsed schedule timezone.
    ///
    /// # Errors
    ///
    /// `ConfigError` for anything but `local`, `utc` or a `±HH:MM` offset.
    pub fn timezone(&self) -> Result<GatewayTimezone, ConfigError> {
        self.timezone.parse()
    }

    /// Domain lookup tables for the registry and mediator.
    pub fn domain_tables(&self) -> DomainTables {
        DomainTables::new(
            self.domains.read_only.iter().cloned().collect(),
            self.domains.read_safe_services.iter().cloned().collect(),
        )
    }

    /// Runtime settings handed to the mediator.
    pub fn mediator_settings(&self) -> MediatorSettings {
        MediatorSettings::default()
            .with_allowed_ips(self.allowed_ips.clone())
            .with_filter_unavailable(self.filter_unavailable)
            .with_compact_mode(self.compact_mode)
            .with_agent_name(self.agent_name.clone())
    }

    /// Upstream token from the configuration or the supervisor environment.
    pub fn upstream_token(&self) -> Option<String> {
        resolve_token(self.upstream.token.as_deref(), |name| std::env::var(name).ok())
    }

    /// Notify target without the `notify.` prefix, if prompts are enabled.
    pub fn notify_target(&self) -> Option<&str> {
        let service = self.confirm_notify_service.as_str();
        let target = service.strip_prefix("notify.").unwrap_or(service);
        if target.is_empty() {
            None
        } else {
            Some(target)
        }
    }

    /// Render as TOML, secrets omitted.
    ///
    /// # Errors
    ///
    /// `ConfigError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::new(format!("Failed to render configuration: {}", e)))
    }
}

/// Pick the configured token, else the first non-empty supervisor variable.
pub fn resolve_token(configured: Option<&str>, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(token) = configured.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    let token = TOKEN_ENV_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|t| t.trim().to_string())
        .find(|t| !t.is_empty());
    if token.is_none() {
        warn!("No upstream token configured");
    }
    token
}
