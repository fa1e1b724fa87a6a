use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::header::{HeaderName, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{Body, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::Handler;
use crate::cache::{build_cache, Cache};
use crate::config::ProxyConfig;
use crate::error::{VgateError, VgateResult};
use crate::pipeline::{
    sanitize_response_headers, sanitize_upstream_request, InboundRequest, ModulePipeline,
    ModuleRegistry, RequestContext, RequestPhase, UpstreamRequest,
};
use crate::transport::{Transport, VirtualTransport};
use crate::upstream::HealthMonitor;

/// Header carrying the request correlation id end to end
pub const CORRELATION_HEADER: &str = "x-request-id";

/// The reverse proxy: binds a module pipeline, a transport and a cache to
/// the inbound handler contract.
///
/// Per request: build an outbound clone of the inbound request (headers
/// initially aliased, body dropped when the inbound carries none), run the
/// request phase, roundtrip unless a module answered, sanitize, run the
/// response phase in reverse, and stream the result back.
#[derive(Debug)]
pub struct ProxyHandler {
    pipeline: ModulePipeline,
    transport: Transport,
    cache: Arc<dyn Cache>,
    correlation_header: HeaderName,
}

impl ProxyHandler {
    /// Build from the "ReverseProxy" config subtree. Also returns the
    /// health monitor supervising any configured backend probes; the
    /// caller decides when to run it.
    pub fn from_config(
        cfg: &ProxyConfig,
        registry: &ModuleRegistry,
    ) -> VgateResult<(Self, HealthMonitor)> {
        let cache = build_cache(cfg.cache.as_ref())?;

        let transport_type = cfg
            .transport
            .as_ref()
            .and_then(|t| t.r#type.as_deref())
            .unwrap_or("Default");
        let (transport, monitor) = match transport_type {
            "Virtual" => {
                let vt_cfg = cfg
                    .transport
                    .as_ref()
                    .and_then(|t| t.config.as_ref())
                    .ok_or_else(|| {
                        VgateError::config("Virtual transport requires a Config section")
                    })?;
                let (vt, monitor) = VirtualTransport::from_config(vt_cfg, Arc::clone(&cache))?;
                (Transport::Virtual(Arc::new(vt)), monitor)
            }
            "Default" => (Transport::Default, HealthMonitor::new()),
            other => {
                return Err(VgateError::config(format!(
                    "Unknown transport: {}",
                    other
                )))
            }
        };

        let pipeline = ModulePipeline::from_config(registry, &cfg.modules, &cfg.module_order)?;

        Ok((
            Self {
                pipeline,
                transport,
                cache,
                correlation_header: HeaderName::from_static(CORRELATION_HEADER),
            },
            monitor,
        ))
    }

    /// Direct constructor for embedding and tests
    pub fn new(pipeline: ModulePipeline, transport: Transport, cache: Arc<dyn Cache>) -> Self {
        Self {
            pipeline,
            transport,
            cache,
            correlation_header: HeaderName::from_static(CORRELATION_HEADER),
        }
    }

    pub fn cache(&self) -> Arc<dyn Cache> {
        Arc::clone(&self.cache)
    }

    async fn proxy(&self, req: Request<Body>) -> VgateResult<Response<Body>> {
        let remote_addr = req.extensions().get::<SocketAddr>().copied();
        let (parts, inbound_body) = req.into_parts();
        let inbound = InboundRequest::from_parts(&parts, remote_addr);
        let mut upstream = UpstreamRequest::from_inbound(&inbound);

        let correlation = inbound
            .headers
            .get(&self.correlation_header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let mut ctx = RequestContext::new(Arc::clone(&self.cache), correlation.as_deref());

        debug!(
            session = %ctx.session_id(),
            method = %inbound.method,
            uri = %inbound.uri,
            "proxying request"
        );

        // A request without a body gets a fresh empty one so the transport
        // is free to retry
        let body = if request_has_body(&parts.headers, &inbound_body) {
            inbound_body
        } else {
            Body::empty()
        };

        let phase = self
            .pipeline
            .process_request(&mut ctx, &inbound, &mut upstream)
            .await?;

        let mut response = match phase {
            RequestPhase::Synthetic(response) => {
                debug!(session = %ctx.session_id(), "module answered request");
                response
            }
            RequestPhase::Forward => {
                sanitize_upstream_request(
                    &mut ctx,
                    &inbound,
                    &mut upstream,
                    &self.correlation_header,
                );
                let outbound = upstream.into_request(body)?;
                match self.transport.roundtrip(outbound).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(session = %ctx.session_id(), error = %e, "proxy roundtrip error");
                        return Err(e);
                    }
                }
            }
        };

        sanitize_response_headers(response.headers_mut());
        self.pipeline
            .modify_response(&mut ctx, &inbound, &mut response)
            .await?;

        Ok(response)
    }

    /// Deinitialize the modules, then close the cache, joining all errors
    pub async fn shutdown(&self) -> VgateResult<()> {
        let mut failures = Vec::new();
        if let Err(e) = self.pipeline.deinit().await {
            failures.push(e.to_string());
        }
        if let Err(e) = self.cache.close().await {
            failures.push(e.to_string());
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(VgateError::internal(failures.join("; ")))
        }
    }
}

#[async_trait]
impl Handler for ProxyHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match self.proxy(req).await {
            Ok(response) => response,
            Err(e) => error_response(&e),
        }
    }

    async fn deinit(&self) -> VgateResult<()> {
        self.shutdown().await
    }
}

fn request_has_body(headers: &hyper::HeaderMap, body: &Body) -> bool {
    if headers.contains_key(TRANSFER_ENCODING) {
        return true;
    }
    if let Some(len) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        return len > 0;
    }
    // No framing headers: trust the body's own size knowledge
    body.size_hint().exact() != Some(0)
}

/// Error responses close the client connection. Client cancellation gets
/// the bare 499 status with no body; nobody is listening anyway.
pub fn error_response(err: &VgateError) -> Response<Body> {
    let status = err.status_code();
    let body = if status.as_u16() == 499 {
        Body::empty()
    } else {
        let reason = status.canonical_reason().unwrap_or("Error");
        Body::from(format!("{} :: {}\n", reason, err))
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONNECTION, hyper::header::HeaderValue::from_static("close"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NullCache;
    use crate::pipeline::{synthetic_response, ProxyModule};
    use hyper::StatusCode;
    use serde_json::json;

    struct DenyModule;

    #[async_trait]
    impl ProxyModule for DenyModule {
        fn name(&self) -> &str {
            "deny"
        }

        async fn process_request(
            &self,
            _ctx: &mut RequestContext,
            _inbound: &InboundRequest,
            _upstream: &mut UpstreamRequest,
        ) -> VgateResult<Option<Response<Body>>> {
            Ok(Some(synthetic_response(StatusCode::FORBIDDEN, "denied\n")))
        }
    }

    struct StampModule;

    #[async_trait]
    impl ProxyModule for StampModule {
        fn name(&self) -> &str {
            "stamp"
        }

        async fn modify_response(
            &self,
            _ctx: &mut RequestContext,
            _inbound: &InboundRequest,
            response: &mut Response<Body>,
        ) -> VgateResult<()> {
            response
                .headers_mut()
                .insert("x-stamped", "1".parse().unwrap());
            Ok(())
        }
    }

    fn handler(modules: Vec<Arc<dyn ProxyModule>>) -> ProxyHandler {
        ProxyHandler::new(
            ModulePipeline::new(modules),
            Transport::Default,
            Arc::new(NullCache::new()),
        )
    }

    #[tokio::test]
    async fn test_synthetic_response_skips_backend_and_runs_response_phase() {
        let h = handler(vec![Arc::new(DenyModule), Arc::new(StampModule)]);
        let req = Request::builder()
            .uri("http://127.0.0.1:9/") // nothing listens here; must not matter
            .body(Body::empty())
            .unwrap();
        let resp = h.handle(req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        // StampModule::process_request never ran, but its response hook did
        assert_eq!(resp.headers().get("x-stamped").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_transport_failure_maps_to_error_response() {
        let h = handler(vec![]);
        let req = Request::builder()
            .uri("http://127.0.0.1:9/")
            .body(Body::empty())
            .unwrap();
        let resp = h.handle(req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers().get(CONNECTION).unwrap(), "close");
    }

    #[tokio::test]
    async fn test_from_config_builds_virtual_transport() {
        let cfg: ProxyConfig = serde_json::from_value(json!({
            "Transport": {
                "Type": "Virtual",
                "Config": {
                    "Type": "RoundRobin",
                    "Retries": 1,
                    "Upstreams": { "cluster": ["http://127.0.0.1:9/"] }
                }
            }
        }))
        .unwrap();
        let registry = ModuleRegistry::with_builtins();
        let (handler, monitor) = ProxyHandler::from_config(&cfg, &registry).unwrap();
        assert!(monitor.is_empty());
        assert!(matches!(handler.transport, Transport::Virtual(_)));
    }

    #[tokio::test]
    async fn test_from_config_rejects_unknown_transport() {
        let cfg: ProxyConfig = serde_json::from_value(json!({
            "Transport": { "Type": "Quantum" }
        }))
        .unwrap();
        let registry = ModuleRegistry::with_builtins();
        let err = ProxyHandler::from_config(&cfg, &registry).unwrap_err();
        assert!(matches!(err, VgateError::Config { .. }));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = error_response(&VgateError::NoLiveBackend {
            upstream: "cluster".into(),
        });
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers().get(CONNECTION).unwrap(), "close");

        let cancelled = error_response(&VgateError::ClientCancelled);
        assert_eq!(cancelled.status().as_u16(), 499);
    }

    #[test]
    fn test_request_has_body_detection() {
        let mut headers = hyper::HeaderMap::new();
        assert!(!request_has_body(&headers, &Body::empty()));

        headers.insert(CONTENT_LENGTH, "0".parse().unwrap());
        assert!(!request_has_body(&headers, &Body::from("ignored")));

        headers.insert(CONTENT_LENGTH, "5".parse().unwrap());
        assert!(request_has_body(&headers, &Body::from("hello")));

        let mut te = hyper::HeaderMap::new();
        te.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        assert!(request_has_body(&te, &Body::empty()));
    }
}
