//! Configuration types for probe-dns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::ProbeError;
use crate::location::{Location, SiteInfo};
use crate::resolver::ResolverEndpoint;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Reconciliation controller settings.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Resolver transport settings.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Per-actor settings.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Fleet registry store.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Desired-location feed.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Country/subdivision to location mapping.
    #[serde(default)]
    pub regions: RegionsConfig,

    /// Site directory: fine location code -> country/subdivision.
    #[serde(default)]
    pub sites: HashMap<String, SiteInfo>,

    /// Resolver endpoints seeded into the registry.
    #[serde(default)]
    pub resolvers: ResolversConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Check cross-field constraints the deserializer cannot express.
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.controller.operation_budget == 0 {
            return Err(ProbeError::Config(
                "controller.operation_budget must be at least 1".into(),
            ));
        }
        if self.controller.interval_secs == 0 {
            return Err(ProbeError::Config(
                "controller.interval_secs must be at least 1".into(),
            ));
        }
        if self.resolver.timeout_ms == 0 {
            return Err(ProbeError::Config("resolver.timeout_ms must be at least 1".into()));
        }
        for endpoint in self.resolvers.all() {
            endpoint
                .parse::<ResolverEndpoint>()
                .map_err(|e| ProbeError::Config(e.to_string()))?;
        }
        Ok(())
    }
}

/// Reconciliation controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Seconds between reconciliation cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Platform operation ceiling per cycle, shared by all missing locations.
    #[serde(default = "default_operation_budget")]
    pub operation_budget: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            operation_budget: default_operation_budget(),
        }
    }
}

/// Resolver transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Deadline for one resolution in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// User-Agent sent on HTTPS requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

/// Per-actor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Self-vantage trace endpoint.
    #[serde(default = "default_trace_url")]
    pub trace_url: String,

    /// Field of the trace blob holding the fine location code.
    #[serde(default = "default_trace_field")]
    pub trace_field: String,

    /// Seconds a trace result is reused before refetching.
    #[serde(default = "default_trace_memo_secs")]
    pub trace_memo_secs: u64,

    /// Upper bound on cached resolutions across all partitions.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            trace_url: default_trace_url(),
            trace_field: default_trace_field(),
            trace_memo_secs: default_trace_memo_secs(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

/// Registry store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// SQLite database path.
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

/// Desired-location feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// URL returning the JSON list of live locations.
    #[serde(default = "default_discovery_url")]
    pub url: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: default_discovery_url(),
        }
    }
}

/// Region mapping configuration.
///
/// When `service_url` is set the HTTP mapper is used; otherwise the static
/// tables. Table keys are matched case-insensitively.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionsConfig {
    /// External region-mapping service.
    #[serde(default)]
    pub service_url: Option<String>,

    /// ISO country -> location.
    #[serde(default)]
    pub countries: HashMap<String, Location>,

    /// ISO subdivision -> location, checked before `countries`.
    #[serde(default)]
    pub subdivisions: HashMap<String, Location>,
}

/// Resolver endpoints seeded into the registry at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolversConfig {
    /// Endpoints every probe queries.
    #[serde(default)]
    pub global: Vec<String>,

    /// Endpoints specific to a location.
    #[serde(default)]
    pub per_location: HashMap<Location, Vec<String>>,
}

impl ResolversConfig {
    fn all(&self) -> impl Iterator<Item = &String> {
        self.global
            .iter()
            .chain(self.per_location.values().flatten())
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "probe_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "probe-dns".to_string()
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_operation_budget() -> u32 {
    1000
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_user_agent() -> String {
    concat!("probe-dns/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_trace_url() -> String {
    "https://cloudflare.com/cdn-cgi/trace".to_string()
}

fn default_trace_field() -> String {
    "colo".to_string()
}

fn default_trace_memo_secs() -> u64 {
    30
}

fn default_cache_max_entries() -> u64 {
    10_000
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("probe-dns.sqlite")
}

fn default_discovery_url() -> String {
    "https://speed.cloudflare.com/locations".to_string()
}
