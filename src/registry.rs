//! Named handler resolution.
//!
//! The configuration references handlers by name; the registry configures
//! each on first lookup and memoizes the result. Resolution keeps an
//! explicit path of names being configured so reference cycles fail with a
//! typed error instead of recursing forever. The registry is an explicit
//! object: one per (re)configuration, no process-wide state.

use async_trait::async_trait;
use hyper::header::{HeaderValue, LOCATION};
use hyper::{Body, Request, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{parse_metrics_spec, HandlerConfig, HandlerSpec, Meter, RedirectHandlerConfig};
use crate::error::{VgateError, VgateResult};
use crate::pipeline::ModuleRegistry;
use crate::proxy::{Handler, ProxyHandler, SharedHandler};
use crate::upstream::HealthMonitor;

/// Constructor for handler types registered at startup. It receives the
/// handler name, its opaque config subtree and the registry itself so it
/// can resolve other handlers by name.
pub type HandlerFactory = Arc<
    dyn Fn(&str, &serde_json::Value, &mut HandlerRegistry) -> VgateResult<SharedHandler>
        + Send
        + Sync,
>;

pub struct HandlerRegistry {
    configs: HashMap<String, HandlerConfig>,
    types: HashMap<String, HandlerFactory>,
    statics: HashMap<String, SharedHandler>,
    resolved: HashMap<String, SharedHandler>,
    /// Names currently being configured, for cycle detection
    path: Vec<String>,
    module_registry: ModuleRegistry,
    monitors: Vec<HealthMonitor>,
}

impl HandlerRegistry {
    pub fn new(configs: HashMap<String, HandlerConfig>) -> Self {
        let mut statics: HashMap<String, SharedHandler> = HashMap::new();
        statics.insert("NotFound".to_string(), Arc::new(NotFoundHandler));
        Self {
            configs,
            types: HashMap::new(),
            statics,
            resolved: HashMap::new(),
            path: Vec::new(),
            module_registry: ModuleRegistry::with_builtins(),
            monitors: Vec::new(),
        }
    }

    /// Register a handler type so configuration can reference it by Type
    pub fn register_type<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&str, &serde_json::Value, &mut HandlerRegistry) -> VgateResult<SharedHandler>
            + Send
            + Sync
            + 'static,
    {
        self.types.insert(type_name.into(), Arc::new(factory));
    }

    /// Make a ready-made handler resolvable by name. Handlers defined by
    /// configuration take precedence over statics of the same name.
    pub fn register_static(&mut self, name: impl Into<String>, handler: SharedHandler) {
        self.statics.insert(name.into(), handler);
    }

    /// Additional module types become available to every ReverseProxy
    pub fn module_registry_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.module_registry
    }

    /// Resolve a server's Handler field
    pub fn handler_for_spec(&mut self, spec: &HandlerSpec) -> VgateResult<SharedHandler> {
        match spec {
            HandlerSpec::Name(name) => self.handler_by_name(name),
            HandlerSpec::Mux(map) => {
                let mut routes = Vec::with_capacity(map.len());
                for (pattern, name) in map {
                    let handler = self.handler_by_name(name)?;
                    routes.push((pattern.clone(), handler));
                }
                Ok(Arc::new(MuxHandler::new(routes)))
            }
        }
    }

    /// Return the named handler, configuring it on first lookup
    pub fn handler_by_name(&mut self, name: &str) -> VgateResult<SharedHandler> {
        if let Some(handler) = self.resolved.get(name) {
            return Ok(Arc::clone(handler));
        }

        let Some(cfg) = self.configs.get(name).cloned() else {
            // Not in the config: fall back to static handlers
            return self
                .statics
                .get(name)
                .map(Arc::clone)
                .ok_or_else(|| VgateError::config(format!("No such handler config: {}", name)));
        };

        if self.path.iter().any(|n| n == name) {
            let mut cycle = self.path.clone();
            cycle.push(name.to_string());
            return Err(VgateError::HandlerCycle {
                name: name.to_string(),
                path: cycle.join(" -> "),
            });
        }

        self.path.push(name.to_string());
        let result = self.configure_handler(name, &cfg);
        self.path.pop();

        let mut handler = result?;
        if let Some(spec) = cfg.metrics.as_deref().filter(|s| !s.is_empty()) {
            handler = Arc::new(MetricsHandler::wrap(name, spec, handler));
        }
        self.resolved.insert(name.to_string(), Arc::clone(&handler));
        debug!(handler = %name, handler_type = %cfg.r#type, "handler configured");
        Ok(handler)
    }

    fn configure_handler(
        &mut self,
        name: &str,
        cfg: &HandlerConfig,
    ) -> VgateResult<SharedHandler> {
        match cfg.r#type.as_str() {
            "ReverseProxy" => {
                let proxy_cfg = serde_json::from_value(cfg.config.clone())?;
                let (proxy, monitor) =
                    ProxyHandler::from_config(&proxy_cfg, &self.module_registry)?;
                if !monitor.is_empty() {
                    self.monitors.push(monitor);
                }
                Ok(Arc::new(proxy))
            }
            "Redirect" => {
                let redirect_cfg: RedirectHandlerConfig =
                    serde_json::from_value(cfg.config.clone())?;
                Ok(Arc::new(RedirectHandler::new(&redirect_cfg)?))
            }
            other => match self.types.get(other).map(Arc::clone) {
                Some(factory) => factory(name, &cfg.config, self),
                None => Err(VgateError::UnknownHandlerType {
                    name: other.to_string(),
                }),
            },
        }
    }

    /// Health monitors collected while configuring ReverseProxy handlers.
    /// The server layer runs them for the life of the configuration.
    pub fn take_monitors(&mut self) -> Vec<HealthMonitor> {
        std::mem::take(&mut self.monitors)
    }

    /// Wrap a handler in metrics auditing under the given name. Used for
    /// server-level Metrics specs; handler-level specs wrap automatically.
    pub fn wrap_metrics(name: &str, spec: &str, handler: SharedHandler) -> SharedHandler {
        Arc::new(MetricsHandler::wrap(name, spec, handler))
    }

    /// Deinitialize every resolved handler, joining failures
    pub async fn deinit_all(&self) -> VgateResult<()> {
        let mut failures = Vec::new();
        for (name, handler) in &self.resolved {
            if let Err(e) = handler.deinit().await {
                failures.push(format!("{}: {}", name, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(VgateError::internal(failures.join("; ")))
        }
    }
}

/// The built-in NotFound handler
struct NotFoundHandler;

#[async_trait]
impl Handler for NotFoundHandler {
    async fn handle(&self, _req: Request<Body>) -> Response<Body> {
        let mut response = Response::new(Body::from("404 page not found\n"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    }
}

/// Static 30x redirect configured from {URL, Code}
struct RedirectHandler {
    location: HeaderValue,
    status: StatusCode,
}

impl RedirectHandler {
    fn new(cfg: &RedirectHandlerConfig) -> VgateResult<Self> {
        let status = StatusCode::from_u16(cfg.code)
            .map_err(|_| VgateError::config(format!("bad redirect code {}", cfg.code)))?;
        if !status.is_redirection() {
            return Err(VgateError::config(format!(
                "redirect code {} is not a 3xx status",
                cfg.code
            )));
        }
        let location = HeaderValue::from_str(&cfg.url)
            .map_err(|e| VgateError::config(format!("bad redirect URL: {}", e)))?;
        Ok(Self { location, status })
    }
}

#[async_trait]
impl Handler for RedirectHandler {
    async fn handle(&self, _req: Request<Body>) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = self.status;
        response.headers_mut().insert(LOCATION, self.location.clone());
        response
    }
}

/// Path mux over named handlers. Patterns ending in `/` match the subtree,
/// others match exactly; the longest pattern wins.
struct MuxHandler {
    /// Sorted longest-pattern-first so the first match is the winner
    routes: Vec<(String, SharedHandler)>,
}

impl MuxHandler {
    fn new(mut routes: Vec<(String, SharedHandler)>) -> Self {
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { routes }
    }

    fn lookup(&self, path: &str) -> Option<&SharedHandler> {
        self.routes.iter().find_map(|(pattern, handler)| {
            let matches = if pattern.ends_with('/') {
                path.starts_with(pattern.as_str()) || path == &pattern[..pattern.len() - 1]
            } else {
                path == pattern
            };
            matches.then_some(handler)
        })
    }
}

#[async_trait]
impl Handler for MuxHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match self.lookup(req.uri().path()) {
            Some(handler) => handler.handle(req).await,
            None => NotFoundHandler.handle(req).await,
        }
    }
}

/// Auditing wrapper counting finished responses against a metrics spec
struct MetricsHandler {
    inner: SharedHandler,
    meters: Vec<Meter>,
}

impl MetricsHandler {
    fn wrap(name: &str, spec: &str, inner: SharedHandler) -> Self {
        let meters = parse_metrics_spec(name, spec);
        info!(handler = %name, meters = meters.len(), "metrics auditing enabled");
        Self { inner, meters }
    }
}

#[async_trait]
impl Handler for MetricsHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let response = self.inner.handle(req).await;
        let size = hyper::body::HttpBody::size_hint(response.body())
            .exact()
            .unwrap_or(0);
        for meter in &self.meters {
            meter.measure(response.status(), size);
        }
        response
    }

    async fn deinit(&self) -> VgateResult<()> {
        self.inner.deinit().await
    }
}
