use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::duration::ConfigDuration;

/// Configuration of one named handler
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandlerConfig {
    /// Handler type name ("ReverseProxy", "Redirect" or a registered type)
    pub r#type: String,
    /// Metrics spec for the auditing wrapper (comma separated tokens)
    #[serde(default)]
    pub metrics: Option<String>,
    /// Opaque subtree parsed by the handler type
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Config subtree for the "ReverseProxy" handler type
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub transport: Option<TransportConfig>,
    /// Module definitions by name
    #[serde(default)]
    pub modules: HashMap<String, ModuleConfig>,
    /// Execution order of the modules above
    #[serde(default)]
    pub module_order: Vec<String>,
    /// Cross-request cache shared with the modules; absent means NullCache
    #[serde(default)]
    pub cache: Option<CacheConfig>,
}

/// Configures the HTTP transport the proxy roundtrips through.
///
/// Type "Virtual" enables the virtual transport, which resolves the URI
/// scheme `vt://<name>` to a named cluster of backend hosts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransportConfig {
    /// "Default" or "Virtual"
    #[serde(default)]
    pub r#type: Option<String>,
    /// Virtual transport settings (required when Type is "Virtual")
    #[serde(default)]
    pub config: Option<VirtualTransportConfig>,
    /// Close idle upstream connections after this long without traffic
    #[serde(rename = "IOActivityTimeout", default)]
    pub io_activity_timeout: ConfigDuration,
    #[serde(default)]
    pub response_header_timeout: ConfigDuration,
    #[serde(default)]
    pub disable_keep_alives: bool,
}

/// Settings for a virtual round-robin transport.
///
/// Requests go to the hosts of an upstream in rotation. A request carrying
/// the routing-key header is pinned to one backend for the BackendPin
/// duration so backend-local caches stay warm. A host failing MaxFails
/// times is quarantined and traffic routes around it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualTransportConfig {
    /// Only "RoundRobin" is defined
    pub r#type: String,
    /// Total attempts per request, bounded below by one
    #[serde(default)]
    pub retries: u32,
    /// Upstream name to backend URL list
    #[serde(default)]
    pub upstreams: HashMap<String, Vec<String>>,
    /// Failures before a backend enters quarantine
    #[serde(default)]
    pub max_fails: u32,
    /// How long a quarantined backend is excluded from selection
    #[serde(default)]
    pub quarantine: ConfigDuration,
    /// TTL of routing-key pins
    #[serde(default)]
    pub backend_pin: ConfigDuration,
    /// Failures within this window of the previous one do not count:
    /// they are in-flight requests that hit the same broken backend
    #[serde(default)]
    pub burst_fail_grace: ConfigDuration,
    /// Header whose value pins requests to one backend
    #[serde(default)]
    pub routing_key_header: Option<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

/// Active health probing of the backends of one upstream
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheckConfig {
    /// Delay between probes of one backend
    pub interval: ConfigDuration,
    /// Path probed on each backend (scheme and host come from the backend)
    #[serde(rename = "URIPath")]
    pub uri_path: String,
    /// Per-probe timeout; zero disables probing entirely
    pub timeout: ConfigDuration,
    /// Status code a healthy backend answers with
    pub expect: u16,
}

/// One pipeline module: its type and the opaque config that type parses
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleConfig {
    pub r#type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Cache backing a ReverseProxy handler
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheConfig {
    /// "Memory" is the only built-in type
    pub r#type: String,
    #[serde(default)]
    pub config: Option<MemoryCacheConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemoryCacheConfig {
    #[serde(default = "default_max_items")]
    pub max_items_count: usize,
    #[serde(default = "default_max_item_size")]
    pub max_item_size: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_items_count: default_max_items(),
            max_item_size: default_max_item_size(),
        }
    }
}

fn default_max_items() -> usize {
    64000
}

fn default_max_item_size() -> usize {
    1024
}

/// Config subtree for the "Redirect" handler type
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RedirectHandlerConfig {
    #[serde(rename = "URL")]
    pub url: String,
    pub code: u16,
}
