//! Configuration document handling.
//!
//! The document is JSON with `//` line comments permitted. The top level
//! declares HTTP servers (listeners plus a handler reference) and a map of
//! named handler definitions that the registry resolves lazily. Durations
//! are strings like "60s"; an absent duration is zero and zero disables the
//! feature it guards.

pub mod duration;
pub mod handlers;
pub mod metrics;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{VgateError, VgateResult};

pub use duration::ConfigDuration;
pub use handlers::{
    CacheConfig, HandlerConfig, HealthCheckConfig, MemoryCacheConfig, ModuleConfig, ProxyConfig,
    RedirectHandlerConfig, TransportConfig, VirtualTransportConfig,
};
pub use metrics::{parse_metrics_spec, Meter};

/// Top-level configuration document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// HTTP servers by name
    #[serde(rename = "HTTP", default)]
    pub http: HashMap<String, ServerConfig>,
    /// Named handler definitions resolved lazily by the registry
    #[serde(default)]
    pub handlers: HashMap<String, HandlerConfig>,
    /// Process-wide log settings
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Statsd emitter settings; owned by the external metrics collaborator
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
    /// TLS plugin references; owned by the external TLS collaborator
    #[serde(rename = "TLSPlugins", default)]
    pub tls_plugins: Option<serde_json::Value>,
    #[serde(rename = "TLSPluginDir", default)]
    pub tls_plugin_dir: Option<String>,
}

/// One HTTP server: a set of listeners and the handler serving them
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerConfig {
    pub listeners: HashMap<String, ListenerConfig>,
    pub handler: HandlerSpec,
    /// Access log path; empty disables. File management is external
    #[serde(default)]
    pub access_log: Option<String>,
    /// Metrics spec applied to this server's handler
    #[serde(default)]
    pub metrics: Option<String>,
    #[serde(default)]
    pub disable_keep_alives: bool,
    #[serde(default)]
    pub read_header_timeout: ConfigDuration,
    #[serde(default)]
    pub idle_timeout: ConfigDuration,
    #[serde(default)]
    pub read_timeout: ConfigDuration,
    #[serde(default)]
    pub write_timeout: ConfigDuration,
}

/// One listening socket
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListenerConfig {
    /// Bind address; empty means all interfaces
    #[serde(default)]
    pub address: String,
    pub port: u16,
    /// Close the connection after this long without bytes flowing.
    /// Additive to the HTTP-level timeouts; enforcement is socket plumbing
    #[serde(rename = "IOActivityTimeout", default)]
    pub io_activity_timeout: ConfigDuration,
    /// TLS termination settings; certificate material loading is external
    #[serde(rename = "TLS", default)]
    pub tls: Option<serde_json::Value>,
    /// Named socket fd inheritance; owned by the supervision layer
    #[serde(default)]
    pub socket_fd_name: Option<String>,
    #[serde(default)]
    pub socket_inherit_only: bool,
}

impl ListenerConfig {
    pub fn bind_address(&self) -> String {
        let host = if self.address.is_empty() {
            "0.0.0.0"
        } else {
            &self.address
        };
        format!("{}:{}", host, self.port)
    }
}

/// The server's Handler field: a single handler name for all paths,
/// or a path to handler-name mux mapping
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HandlerSpec {
    Name(String),
    Mux(HashMap<String, String>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<String>,
}

impl Config {
    /// Load configuration from a JSON file, honoring `//` line comments
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_json(&content)?;
        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Parse a configuration document from a JSON string
    pub fn from_json(content: &str) -> VgateResult<Self> {
        let stripped = strip_line_comments(content);
        let config: Config = serde_json::from_str(&stripped)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the parts of the document that do not need handler resolution
    pub fn validate(&self) -> VgateResult<()> {
        for (srv_name, srv) in &self.http {
            if srv.listeners.is_empty() {
                return Err(VgateError::config(format!(
                    "server {} has no listeners",
                    srv_name
                )));
            }
            for (lst_name, lst) in &srv.listeners {
                if lst.port == 0 && lst.socket_fd_name.is_none() {
                    return Err(VgateError::config(format!(
                        "listener {}/{} has no port",
                        srv_name, lst_name
                    )));
                }
            }
            if let HandlerSpec::Mux(map) = &srv.handler {
                if map.is_empty() {
                    return Err(VgateError::config(format!(
                        "server {} handler mux is empty",
                        srv_name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Remove `//` line comments outside of string literals
fn strip_line_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
        } else if c == '"' {
            in_string = true;
            out.push(c);
        } else if c == '/' && chars.peek() == Some(&'/') {
            // Keep the newline so parse errors still point at the right line
            for skipped in chars.by_ref() {
                if skipped == '\n' {
                    out.push('\n');
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        // servers
        "HTTP": {
            "Front": {
                "Listeners": {
                    "http": { "Port": 8180 } // plain listener
                },
                "Handler": "theproxy",
                "ReadHeaderTimeout": "5s"
            }
        },
        "Handlers": {
            "theproxy": {
                "Type": "ReverseProxy",
                "Config": {}
            }
        }
    }"#;

    #[test]
    fn test_parse_with_comments() {
        let cfg = Config::from_json(SAMPLE).unwrap();
        assert_eq!(cfg.http.len(), 1);
        let srv = &cfg.http["Front"];
        assert_eq!(srv.listeners["http"].port, 8180);
        assert!(matches!(&srv.handler, HandlerSpec::Name(n) if n == "theproxy"));
        assert_eq!(
            srv.read_header_timeout.as_duration(),
            std::time::Duration::from_secs(5)
        );
        assert_eq!(cfg.handlers["theproxy"].r#type, "ReverseProxy");
    }

    #[test]
    fn test_comment_inside_string_kept() {
        let raw = r#"{ "HTTP": {}, "Handlers": { "h": { "Type": "Redirect", "Config": { "URL": "http://example.com/a//b", "Code": 301 } } } }"#;
        let cfg = Config::from_json(raw).unwrap();
        let redirect: RedirectHandlerConfig =
            serde_json::from_value(cfg.handlers["h"].config.clone()).unwrap();
        assert_eq!(redirect.url, "http://example.com/a//b");
    }

    #[test]
    fn test_mux_handler_spec() {
        let raw = r#"{
            "HTTP": {
                "S": {
                    "Listeners": { "l": { "Port": 8080 } },
                    "Handler": { "/": "fallback", "/api/": "api" }
                }
            }
        }"#;
        let cfg = Config::from_json(raw).unwrap();
        match &cfg.http["S"].handler {
            HandlerSpec::Mux(map) => {
                assert_eq!(map["/api/"], "api");
                assert_eq!(map["/"], "fallback");
            }
            other => panic!("expected mux, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_rejects_empty_listeners() {
        let raw = r#"{ "HTTP": { "S": { "Listeners": {}, "Handler": "NotFound" } } }"#;
        let err = Config::from_json(raw).unwrap_err();
        assert!(matches!(err, VgateError::Config { .. }));
    }

    #[test]
    fn test_listener_bind_address() {
        let lst = ListenerConfig {
            address: String::new(),
            port: 8180,
            io_activity_timeout: ConfigDuration::default(),
            tls: None,
            socket_fd_name: None,
            socket_inherit_only: false,
        };
        assert_eq!(lst.bind_address(), "0.0.0.0:8180");
    }
}
