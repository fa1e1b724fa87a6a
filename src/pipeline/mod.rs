//! The module pipeline.
//!
//! A module sees every request on the way in (and may rewrite it or answer
//! it outright) and every response on the way out, in reverse order. Between
//! the two phases the pipeline scrubs hop-by-hop headers off the outbound
//! request.

pub mod context;
pub mod modules;

use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, USER_AGENT};
use hyper::{Body, HeaderMap, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::ModuleConfig;
use crate::error::{VgateError, VgateResult};

pub use context::{InboundRequest, RequestContext, UpstreamRequest};

/// A unit of request/response transformation in the proxy chain.
///
/// `process_request` runs in configured order; returning a response
/// short-circuits the chain and nothing is sent upstream. `modify_response`
/// runs in reverse order on the way back. `deinit` runs once at handler
/// shutdown.
#[async_trait]
pub trait ProxyModule: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect or rewrite the outbound request, or answer it directly by
    /// returning a synthetic response
    async fn process_request(
        &self,
        _ctx: &mut RequestContext,
        _inbound: &InboundRequest,
        _upstream: &mut UpstreamRequest,
    ) -> VgateResult<Option<Response<Body>>> {
        Ok(None)
    }

    /// Adjust the response before it streams back to the client
    async fn modify_response(
        &self,
        _ctx: &mut RequestContext,
        _inbound: &InboundRequest,
        _response: &mut Response<Body>,
    ) -> VgateResult<()> {
        Ok(())
    }

    /// Cleanup hook for graceful shutdown and reconfiguration
    async fn deinit(&self) -> VgateResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn ProxyModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ProxyModule")
    }
}

/// Outcome of the request phase
#[derive(Debug)]
pub enum RequestPhase {
    /// Every module passed; continue to the backend roundtrip
    Forward,
    /// A module answered the request itself
    Synthetic(Response<Body>),
}

/// The ordered chain of modules configured on one ReverseProxy handler
#[derive(Debug)]
pub struct ModulePipeline {
    modules: Vec<Arc<dyn ProxyModule>>,
}

impl ModulePipeline {
    pub fn new(modules: Vec<Arc<dyn ProxyModule>>) -> Self {
        Self { modules }
    }

    /// Instantiate the configured modules in ModuleOrder
    pub fn from_config(
        registry: &ModuleRegistry,
        modules: &HashMap<String, ModuleConfig>,
        order: &[String],
    ) -> VgateResult<Self> {
        let mut built = Vec::with_capacity(order.len());
        for name in order {
            let cfg = modules.get(name).ok_or_else(|| {
                VgateError::config(format!("No such module: {}", name))
            })?;
            debug!(module = %name, module_type = %cfg.r#type, "adding proxy module");
            built.push(registry.build(name, cfg)?);
        }
        Ok(Self::new(built))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Run `process_request` over the chain in order, stopping at the first
    /// synthetic response
    pub async fn process_request(
        &self,
        ctx: &mut RequestContext,
        inbound: &InboundRequest,
        upstream: &mut UpstreamRequest,
    ) -> VgateResult<RequestPhase> {
        for module in &self.modules {
            match module.process_request(ctx, inbound, upstream).await {
                Ok(None) => {}
                Ok(Some(response)) => return Ok(RequestPhase::Synthetic(response)),
                Err(e) => {
                    return Err(VgateError::module(module.name(), e.to_string()));
                }
            }
        }
        Ok(RequestPhase::Forward)
    }

    /// Run `modify_response` over the whole chain in reverse order.
    ///
    /// This intentionally covers every module even when an earlier
    /// short-circuit meant some never saw the request; the asymmetry is
    /// long-standing observable behavior that modules depend on.
    pub async fn modify_response(
        &self,
        ctx: &mut RequestContext,
        inbound: &InboundRequest,
        response: &mut Response<Body>,
    ) -> VgateResult<()> {
        for module in self.modules.iter().rev() {
            if let Err(e) = module.modify_response(ctx, inbound, response).await {
                return Err(VgateError::module(module.name(), e.to_string()));
            }
        }
        Ok(())
    }

    /// Deinitialize every module, collecting all failures into one error
    pub async fn deinit(&self) -> VgateResult<()> {
        let mut failures = Vec::new();
        for module in &self.modules {
            if let Err(e) = module.deinit().await {
                failures.push(format!("{}: {}", module.name(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(VgateError::internal(failures.join("; ")))
        }
    }
}

/// The RFC 7230 hop-by-hop header set this proxy never forwards
pub const HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(value) = headers.get(CONNECTION).and_then(|v| v.to_str().ok()) {
        for field in value.split(',') {
            let field = field.trim();
            if !field.is_empty() {
                names.push(field.to_ascii_lowercase());
            }
        }
    }
    names
}

/// Scrub the outbound request between the pipeline phases: drop hop-by-hop
/// headers (and anything the Connection header names), suppress the default
/// User-Agent, and stamp the correlation header when the inbound lacked it.
/// All removals route through the copy-on-write guard so the inbound map is
/// never touched.
pub fn sanitize_upstream_request(
    ctx: &mut RequestContext,
    inbound: &InboundRequest,
    upstream: &mut UpstreamRequest,
    correlation_header: &HeaderName,
) {
    let mut remove: Vec<String> = connection_listed(upstream.headers());
    for name in HOP_HEADERS {
        if upstream.headers().contains_key(name) {
            remove.push(name.to_string());
        }
    }
    if !remove.is_empty() {
        let headers = ctx.ensure_writable_headers(upstream, inbound);
        for name in &remove {
            headers.remove(name.as_str());
        }
    }

    if !upstream.headers().contains_key(USER_AGENT) {
        // An absent User-Agent must stay absent; an empty value stops the
        // client library from substituting its default
        ctx.ensure_writable_headers(upstream, inbound)
            .insert(USER_AGENT, HeaderValue::from_static(""));
    }

    let inbound_has_id = inbound
        .headers
        .get(correlation_header)
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    if !inbound_has_id {
        if let Ok(value) = HeaderValue::from_str(ctx.session_id()) {
            ctx.ensure_writable_headers(upstream, inbound)
                .insert(correlation_header.clone(), value);
        }
    }
}

/// Scrub hop-by-hop headers off a response before it reaches the client
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    for name in connection_listed(headers) {
        headers.remove(name.as_str());
    }
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

/// Shorthand for simple module-synthesized responses
pub fn synthetic_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

/// Factory signature for module types registered at startup
pub type ModuleFactory =
    Arc<dyn Fn(&str, &serde_json::Value) -> VgateResult<Arc<dyn ProxyModule>> + Send + Sync>;

/// Maps module type names to constructors. Built-ins are pre-registered;
/// embedders add their own types before configuration runs.
#[derive(Clone)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        modules::register_builtins(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&str, &serde_json::Value) -> VgateResult<Arc<dyn ProxyModule>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(type_name.into(), Arc::new(factory));
    }

    pub fn build(&self, name: &str, cfg: &ModuleConfig) -> VgateResult<Arc<dyn ProxyModule>> {
        let factory = self.factories.get(&cfg.r#type).ok_or_else(|| {
            VgateError::config(format!("No such module type: {}", cfg.r#type))
        })?;
        factory(name, &cfg.config)
    }
}
