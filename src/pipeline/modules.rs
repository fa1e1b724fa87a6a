//! Built-in pipeline modules.
//!
//! Directors pick where a request goes by rewriting the outbound URI;
//! `set_header` stamps configured headers on both directions.

use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue, HOST, LOCATION};
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{Body, Response, StatusCode, Uri};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{
    synthetic_response, InboundRequest, ModuleRegistry, ProxyModule, RequestContext,
    UpstreamRequest,
};
use crate::error::{VgateError, VgateResult};

pub fn register_builtins(registry: &mut ModuleRegistry) {
    registry.register("forward_map_director", |name, cfg| {
        Ok(Arc::new(ForwardMapDirector::from_config(name, cfg)?) as Arc<dyn ProxyModule>)
    });
    registry.register("host_suffix_director", |name, cfg| {
        Ok(Arc::new(HostSuffixDirector::from_config(name, cfg)?) as Arc<dyn ProxyModule>)
    });
    registry.register("set_header", |name, cfg| {
        Ok(Arc::new(SetHeaderModule::from_config(name, cfg)?) as Arc<dyn ProxyModule>)
    });
    registry.register("proxypass", |name, cfg| {
        Ok(Arc::new(ProxyPassModule::from_config(name, cfg)?) as Arc<dyn ProxyModule>)
    });
    registry.register("backendsettings", |name, cfg| {
        Ok(Arc::new(BackendSettingsModule::from_config(name, cfg)?) as Arc<dyn ProxyModule>)
    });
}

fn rewrite_target(uri: &Uri, scheme: &Scheme, authority: &Authority) -> VgateResult<Uri> {
    let pq = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(pq)
        .build()
        .map_err(VgateError::from)
}

fn request_host(upstream: &UpstreamRequest) -> String {
    upstream
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| upstream.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ForwardMapConfig {
    /// Inbound host to target URL; the empty key is the fallback
    #[serde(default)]
    forward: HashMap<String, String>,
}

/// Maps the request Host onto a forward target, typically a `vt://` cluster.
/// No match and no fallback answers 404 without contacting any backend.
pub struct ForwardMapDirector {
    name: String,
    forward: HashMap<String, (Scheme, Authority)>,
}

impl ForwardMapDirector {
    pub fn from_config(name: &str, cfg: &serde_json::Value) -> VgateResult<Self> {
        let cfg: ForwardMapConfig = serde_json::from_value(cfg.clone())?;
        let mut forward = HashMap::new();
        for (host, target) in cfg.forward {
            let uri: Uri = target.parse()?;
            let scheme = uri.scheme().cloned().ok_or_else(|| {
                VgateError::config(format!("forward target missing scheme: {}", target))
            })?;
            let authority = uri.authority().cloned().ok_or_else(|| {
                VgateError::config(format!("forward target missing host: {}", target))
            })?;
            forward.insert(host, (scheme, authority));
        }
        Ok(Self {
            name: name.to_string(),
            forward,
        })
    }
}

#[async_trait]
impl ProxyModule for ForwardMapDirector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_request(
        &self,
        _ctx: &mut RequestContext,
        _inbound: &InboundRequest,
        upstream: &mut UpstreamRequest,
    ) -> VgateResult<Option<Response<Body>>> {
        let host = request_host(upstream);
        let target = self
            .forward
            .get(host.as_str())
            .or_else(|| self.forward.get(""));
        match target {
            Some((scheme, authority)) => {
                upstream.uri = rewrite_target(&upstream.uri, scheme, authority)?;
                Ok(None)
            }
            None => Ok(Some(synthetic_response(
                StatusCode::NOT_FOUND,
                "No such host",
            ))),
        }
    }

    async fn deinit(&self) -> VgateResult<()> {
        info!(module = %self.name, "deinitializing forward director module");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostSuffixConfig {
    suffix: String,
}

/// Appends a suffix to the request host and targets the result, keeping any
/// explicit port. Turns `shop` into `shop.backend.internal` style routing.
pub struct HostSuffixDirector {
    name: String,
    suffix: String,
}

impl HostSuffixDirector {
    pub fn from_config(name: &str, cfg: &serde_json::Value) -> VgateResult<Self> {
        let cfg: HostSuffixConfig = serde_json::from_value(cfg.clone())?;
        Ok(Self {
            name: name.to_string(),
            suffix: cfg.suffix,
        })
    }
}

#[async_trait]
impl ProxyModule for HostSuffixDirector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_request(
        &self,
        _ctx: &mut RequestContext,
        _inbound: &InboundRequest,
        upstream: &mut UpstreamRequest,
    ) -> VgateResult<Option<Response<Body>>> {
        let request_host = request_host(upstream);
        let (host, port) = match request_host.rsplit_once(':') {
            Some((h, p)) if p.bytes().all(|b| b.is_ascii_digit()) => (h.to_string(), Some(p.to_string())),
            _ => (request_host, None),
        };

        let target = match port {
            Some(port) => format!("{}{}:{}", host, self.suffix, port),
            None => format!("{}{}", host, self.suffix),
        };
        let authority: Authority = target.parse().map_err(|e| {
            VgateError::module(&self.name, format!("bad target host {}: {}", target, e))
        })?;
        upstream.uri = rewrite_target(&upstream.uri, &Scheme::HTTP, &authority)?;
        debug!(module = %self.name, target = %target, "host suffix director rewrote target");
        Ok(None)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SetHeaderConfig {
    #[serde(default)]
    request_header: HashMap<String, String>,
    #[serde(default)]
    response_header: HashMap<String, String>,
}

/// Stamps configured headers onto the outbound request and the response
#[derive(Debug)]
pub struct SetHeaderModule {
    name: String,
    config: SetHeaderConfig,
}

impl SetHeaderModule {
    pub fn from_config(name: &str, cfg: &serde_json::Value) -> VgateResult<Self> {
        let config: SetHeaderConfig = serde_json::from_value(cfg.clone())?;
        for (k, v) in config.request_header.iter().chain(&config.response_header) {
            k.parse::<hyper::header::HeaderName>()
                .map_err(|e| VgateError::config(format!("bad header name {}: {}", k, e)))?;
            hyper::header::HeaderValue::from_str(v)
                .map_err(|e| VgateError::config(format!("bad header value {}: {}", v, e)))?;
        }
        Ok(Self {
            name: name.to_string(),
            config,
        })
    }
}

#[async_trait]
impl ProxyModule for SetHeaderModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_request(
        &self,
        ctx: &mut RequestContext,
        inbound: &InboundRequest,
        upstream: &mut UpstreamRequest,
    ) -> VgateResult<Option<Response<Body>>> {
        if !self.config.request_header.is_empty() {
            let headers = ctx.ensure_writable_headers(upstream, inbound);
            for (k, v) in &self.config.request_header {
                // Validated at configuration time
                if let (Ok(name), Ok(value)) = (
                    k.parse::<hyper::header::HeaderName>(),
                    hyper::header::HeaderValue::from_str(v),
                ) {
                    headers.insert(name, value);
                }
            }
        }
        Ok(None)
    }

    async fn modify_response(
        &self,
        _ctx: &mut RequestContext,
        _inbound: &InboundRequest,
        response: &mut Response<Body>,
    ) -> VgateResult<()> {
        for (k, v) in &self.config.response_header {
            if let (Ok(name), Ok(value)) = (
                k.parse::<hyper::header::HeaderName>(),
                hyper::header::HeaderValue::from_str(v),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        Ok(())
    }
}

fn server_host_name() -> &'static str {
    static HOSTNAME: Lazy<String> = Lazy::new(|| {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/proc/sys/kernel/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "localhost".to_string())
    });
    &HOSTNAME
}

/// Re-anchor a URI-valued header onto a new scheme and host, keeping the
/// path and query. Relative values become absolute.
fn reanchor_uri(value: &str, scheme: &str, host: &str) -> Option<String> {
    let uri: Uri = value.parse().ok()?;
    let pq = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Some(format!("{}://{}{}", scheme, host, pq))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProxyHeadersConfig {
    #[serde(rename = "X-Forwarded-For", default)]
    x_fwd_for: bool,
    #[serde(rename = "X-Forwarded-Host", default)]
    x_fwd_host: bool,
    #[serde(rename = "X-Forwarded-Server", default)]
    x_fwd_server: bool,
    #[serde(rename = "X-Forwarded-Proto", default)]
    x_fwd_proto: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProxyPassConfig {
    /// Rewrite the Host header to match the target URL
    #[serde(default)]
    rewrite_host: bool,
    /// Rewrite incoming URI-valued headers like "Destination"
    #[serde(default)]
    rewrite_forward: bool,
    /// Rewrite outgoing URI-valued headers like "Location"
    #[serde(default)]
    rewrite_reverse: bool,
    #[serde(default)]
    headers: ProxyHeadersConfig,
}

/// The standard reverse-proxy pass-through conditioning: X-Forwarded-*
/// header injection, Host rewriting toward the target, and re-anchoring of
/// Destination/Location headers across the proxy boundary.
pub struct ProxyPassModule {
    name: String,
    config: ProxyPassConfig,
}

impl ProxyPassModule {
    pub fn from_config(name: &str, cfg: &serde_json::Value) -> VgateResult<Self> {
        let config: ProxyPassConfig = serde_json::from_value(cfg.clone())?;
        Ok(Self {
            name: name.to_string(),
            config,
        })
    }
}

#[async_trait]
impl ProxyModule for ProxyPassModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_request(
        &self,
        ctx: &mut RequestContext,
        inbound: &InboundRequest,
        upstream: &mut UpstreamRequest,
    ) -> VgateResult<Option<Response<Body>>> {
        if self.config.headers.x_fwd_host {
            if let Some(value) = inbound.host().and_then(|h| HeaderValue::from_str(h).ok()) {
                ctx.ensure_writable_headers(upstream, inbound)
                    .insert(HeaderName::from_static("x-forwarded-host"), value);
            }
        }

        if self.config.headers.x_fwd_server {
            if let Ok(value) = HeaderValue::from_str(server_host_name()) {
                ctx.ensure_writable_headers(upstream, inbound)
                    .insert(HeaderName::from_static("x-forwarded-server"), value);
            }
        }

        if self.config.headers.x_fwd_proto {
            // Listeners terminate plaintext; an absolute-form request may
            // still carry its own scheme
            let scheme = inbound.uri.scheme_str().unwrap_or("http");
            if let Ok(value) = HeaderValue::from_str(scheme) {
                ctx.ensure_writable_headers(upstream, inbound)
                    .insert(HeaderName::from_static("x-forwarded-proto"), value);
            }
        }

        if self.config.headers.x_fwd_for {
            if let Some(remote) = inbound.remote_addr {
                let client_ip = remote.ip().to_string();
                // Retain prior X-Forwarded-For information as a comma+space
                // separated list and fold multiple headers into one
                let prior: Vec<String> = upstream
                    .headers()
                    .get_all("x-forwarded-for")
                    .iter()
                    .filter_map(|v| v.to_str().ok().map(str::to_owned))
                    .collect();
                let combined = if prior.is_empty() {
                    client_ip
                } else {
                    format!("{}, {}", prior.join(", "), client_ip)
                };
                if let Ok(value) = HeaderValue::from_str(&combined) {
                    ctx.ensure_writable_headers(upstream, inbound)
                        .insert(HeaderName::from_static("x-forwarded-for"), value);
                }
            }
        }

        if self.config.rewrite_host {
            if let Some(value) = upstream
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            {
                ctx.ensure_writable_headers(upstream, inbound)
                    .insert(HOST, value);
            }
        }

        if self.config.rewrite_forward {
            let destination = upstream
                .headers()
                .get("destination")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_owned);
            if let Some(destination) = destination {
                let scheme = upstream.uri.scheme_str().unwrap_or("http");
                let host = request_host(upstream);
                match reanchor_uri(&destination, scheme, &host)
                    .and_then(|v| HeaderValue::from_str(&v).ok())
                {
                    Some(value) => {
                        ctx.ensure_writable_headers(upstream, inbound)
                            .insert(HeaderName::from_static("destination"), value);
                    }
                    None => {
                        error!(module = %self.name, destination = %destination, "error parsing Destination header");
                    }
                }
            }
        }

        Ok(None)
    }

    async fn modify_response(
        &self,
        _ctx: &mut RequestContext,
        inbound: &InboundRequest,
        response: &mut Response<Body>,
    ) -> VgateResult<()> {
        if !self.config.rewrite_reverse {
            return Ok(());
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        if let Some(location) = location {
            let scheme = inbound.uri.scheme_str().unwrap_or("http");
            let host = inbound.host().unwrap_or_default();
            match reanchor_uri(&location, scheme, host)
                .and_then(|v| HeaderValue::from_str(&v).ok())
            {
                Some(value) => {
                    response.headers_mut().insert(LOCATION, value);
                }
                None => {
                    error!(module = %self.name, location = %location, "error parsing Location header");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BackendSettingsConfig {
    /// Always talk TLS to the backend
    #[serde(rename = "ForceTLS", default)]
    force_tls: bool,
    /// Override the backend port; zero leaves it alone
    #[serde(default)]
    port: u16,
}

/// Adjusts the outbound target to match how the backends are reachable:
/// pin the port, force https, or both.
pub struct BackendSettingsModule {
    name: String,
    config: BackendSettingsConfig,
}

impl BackendSettingsModule {
    pub fn from_config(name: &str, cfg: &serde_json::Value) -> VgateResult<Self> {
        let config: BackendSettingsConfig = serde_json::from_value(cfg.clone())?;
        Ok(Self {
            name: name.to_string(),
            config,
        })
    }
}

#[async_trait]
impl ProxyModule for BackendSettingsModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_request(
        &self,
        _ctx: &mut RequestContext,
        _inbound: &InboundRequest,
        upstream: &mut UpstreamRequest,
    ) -> VgateResult<Option<Response<Body>>> {
        let mut scheme = upstream.uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        if self.config.force_tls {
            scheme = Scheme::HTTPS;
        }

        if self.config.port != 0 {
            let request_host = request_host(upstream);
            let host = match request_host.rsplit_once(':') {
                Some((h, p)) if p.bytes().all(|b| b.is_ascii_digit()) => h.to_string(),
                _ => request_host,
            };
            let target = format!("{}:{}", host, self.config.port);
            let authority: Authority = target.parse().map_err(|e| {
                VgateError::module(&self.name, format!("bad target host {}: {}", target, e))
            })?;
            upstream.uri = rewrite_target(&upstream.uri, &scheme, &authority)?;
        } else if self.config.force_tls {
            if let Some(authority) = upstream.uri.authority().cloned() {
                upstream.uri = rewrite_target(&upstream.uri, &scheme, &authority)?;
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NullCache;
    use hyper::{Method, Request};
    use serde_json::json;

    fn inbound(host: &str) -> InboundRequest {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/path?q=1")
            .header(hyper::header::HOST, host)
            .body(Body::empty())
            .unwrap();
        let (parts, _) = req.into_parts();
        InboundRequest::from_parts(&parts, None)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Arc::new(NullCache::new()), None)
    }

    #[tokio::test]
    async fn test_forward_map_matches_host() {
        let module = ForwardMapDirector::from_config(
            "director",
            &json!({ "Forward": { "shop.example.com": "vt://shop", "": "vt://cluster" } }),
        )
        .unwrap();

        let inbound = inbound("shop.example.com");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        let res = module
            .process_request(&mut ctx(), &inbound, &mut upstream)
            .await
            .unwrap();
        assert!(res.is_none());
        assert_eq!(upstream.uri.to_string(), "vt://shop/path?q=1");
    }

    #[tokio::test]
    async fn test_forward_map_fallback() {
        let module = ForwardMapDirector::from_config(
            "director",
            &json!({ "Forward": { "": "vt://cluster" } }),
        )
        .unwrap();

        let inbound = inbound("unknown.example.com");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        module
            .process_request(&mut ctx(), &inbound, &mut upstream)
            .await
            .unwrap();
        assert_eq!(upstream.uri.to_string(), "vt://cluster/path?q=1");
    }

    #[tokio::test]
    async fn test_forward_map_no_match_synthesizes_404() {
        let module = ForwardMapDirector::from_config(
            "director",
            &json!({ "Forward": { "only.example.com": "http://127.0.0.1:8080" } }),
        )
        .unwrap();

        let inbound = inbound("other.example.com");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        let res = module
            .process_request(&mut ctx(), &inbound, &mut upstream)
            .await
            .unwrap()
            .expect("expected synthetic response");
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_host_suffix_preserves_port() {
        let module = HostSuffixDirector::from_config(
            "suffix",
            &json!({ "Suffix": ".backend.internal" }),
        )
        .unwrap();

        let inbound = inbound("shop:8443");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        module
            .process_request(&mut ctx(), &inbound, &mut upstream)
            .await
            .unwrap();
        assert_eq!(
            upstream.uri.to_string(),
            "http://shop.backend.internal:8443/path?q=1"
        );
    }

    #[tokio::test]
    async fn test_set_header_request_goes_through_cow() {
        let module = SetHeaderModule::from_config(
            "set_header",
            &json!({ "RequestHeader": { "X-Foo": "bar" } }),
        )
        .unwrap();

        let inbound = inbound("example.com");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        let mut ctx = ctx();
        module
            .process_request(&mut ctx, &inbound, &mut upstream)
            .await
            .unwrap();

        assert_eq!(upstream.headers().get("x-foo").unwrap(), "bar");
        assert!(inbound.headers.get("x-foo").is_none());
        assert!(ctx.headers_copied());
    }

    #[tokio::test]
    async fn test_set_header_response() {
        let module = SetHeaderModule::from_config(
            "set_header",
            &json!({ "ResponseHeader": { "X-Served-By": "vgate" } }),
        )
        .unwrap();

        let inbound = inbound("example.com");
        let mut response = synthetic_response(StatusCode::OK, "ok");
        module
            .modify_response(&mut ctx(), &inbound, &mut response)
            .await
            .unwrap();
        assert_eq!(response.headers().get("x-served-by").unwrap(), "vgate");
    }

    #[test]
    fn test_set_header_rejects_bad_config() {
        let err = SetHeaderModule::from_config(
            "set_header",
            &json!({ "RequestHeader": { "bad header": "x" } }),
        )
        .unwrap_err();
        assert!(matches!(err, VgateError::Config { .. }));
    }

    fn inbound_with_remote(host: &str, remote: &str) -> InboundRequest {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/path?q=1")
            .header(hyper::header::HOST, host)
            .body(Body::empty())
            .unwrap();
        let (parts, _) = req.into_parts();
        InboundRequest::from_parts(&parts, Some(remote.parse().unwrap()))
    }

    #[tokio::test]
    async fn test_proxypass_injects_forwarded_headers() {
        let module = ProxyPassModule::from_config(
            "proxypass",
            &json!({
                "Headers": {
                    "X-Forwarded-For": true,
                    "X-Forwarded-Host": true,
                    "X-Forwarded-Server": true,
                    "X-Forwarded-Proto": true
                }
            }),
        )
        .unwrap();

        let inbound = inbound_with_remote("shop.example.com", "192.0.2.7:41234");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        let mut ctx = ctx();
        module
            .process_request(&mut ctx, &inbound, &mut upstream)
            .await
            .unwrap();

        assert_eq!(
            upstream.headers().get("x-forwarded-host").unwrap(),
            "shop.example.com"
        );
        assert_eq!(upstream.headers().get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(
            upstream.headers().get("x-forwarded-for").unwrap(),
            "192.0.2.7"
        );
        assert!(!upstream
            .headers()
            .get("x-forwarded-server")
            .unwrap()
            .is_empty());
        assert!(ctx.headers_copied());
        // The inbound map saw none of it
        assert!(inbound.headers.get("x-forwarded-for").is_none());
    }

    #[tokio::test]
    async fn test_proxypass_folds_prior_forwarded_for() {
        let module = ProxyPassModule::from_config(
            "proxypass",
            &json!({ "Headers": { "X-Forwarded-For": true } }),
        )
        .unwrap();

        let req = Request::builder()
            .method(Method::GET)
            .uri("/")
            .header(hyper::header::HOST, "example.com")
            .header("x-forwarded-for", "198.51.100.1")
            .body(Body::empty())
            .unwrap();
        let (parts, _) = req.into_parts();
        let inbound = InboundRequest::from_parts(&parts, Some("192.0.2.7:999".parse().unwrap()));
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        module
            .process_request(&mut ctx(), &inbound, &mut upstream)
            .await
            .unwrap();

        assert_eq!(
            upstream.headers().get("x-forwarded-for").unwrap(),
            "198.51.100.1, 192.0.2.7"
        );
    }

    #[tokio::test]
    async fn test_proxypass_no_remote_addr_leaves_headers_shared() {
        let module = ProxyPassModule::from_config(
            "proxypass",
            &json!({ "Headers": { "X-Forwarded-For": true } }),
        )
        .unwrap();

        let inbound = inbound("example.com");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        let mut ctx = ctx();
        module
            .process_request(&mut ctx, &inbound, &mut upstream)
            .await
            .unwrap();

        assert!(upstream.shares_headers_with(&inbound));
        assert!(!ctx.headers_copied());
    }

    #[tokio::test]
    async fn test_proxypass_rewrite_host_matches_target() {
        let module =
            ProxyPassModule::from_config("proxypass", &json!({ "RewriteHost": true })).unwrap();

        let inbound = inbound("shop.example.com");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        // A director already aimed the request at a backend
        upstream.uri = "http://10.0.0.5:8080/path?q=1".parse().unwrap();
        module
            .process_request(&mut ctx(), &inbound, &mut upstream)
            .await
            .unwrap();

        assert_eq!(
            upstream.headers().get(hyper::header::HOST).unwrap(),
            "10.0.0.5:8080"
        );
    }

    #[tokio::test]
    async fn test_proxypass_rewrites_destination_header() {
        let module = ProxyPassModule::from_config(
            "proxypass",
            &json!({ "RewriteHost": true, "RewriteForward": true }),
        )
        .unwrap();

        let req = Request::builder()
            .method(Method::GET)
            .uri("/src.txt")
            .header(hyper::header::HOST, "dav.example.com")
            .header("destination", "http://dav.example.com/dst.txt")
            .body(Body::empty())
            .unwrap();
        let (parts, _) = req.into_parts();
        let inbound = InboundRequest::from_parts(&parts, None);
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        upstream.uri = "http://10.0.0.5:8080/src.txt".parse().unwrap();
        module
            .process_request(&mut ctx(), &inbound, &mut upstream)
            .await
            .unwrap();

        assert_eq!(
            upstream.headers().get("destination").unwrap(),
            "http://10.0.0.5:8080/dst.txt"
        );
    }

    #[tokio::test]
    async fn test_proxypass_rewrites_location_toward_client() {
        let module =
            ProxyPassModule::from_config("proxypass", &json!({ "RewriteReverse": true })).unwrap();

        let inbound = inbound("shop.example.com");
        let mut response = synthetic_response(StatusCode::FOUND, "");
        response.headers_mut().insert(
            LOCATION,
            "http://10.0.0.5:8080/login?next=%2Fcart".parse().unwrap(),
        );
        module
            .modify_response(&mut ctx(), &inbound, &mut response)
            .await
            .unwrap();

        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "http://shop.example.com/login?next=%2Fcart"
        );
    }

    #[tokio::test]
    async fn test_backendsettings_overrides_port() {
        let module =
            BackendSettingsModule::from_config("settings", &json!({ "Port": 9443 })).unwrap();

        let inbound = inbound("shop.example.com:8080");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        module
            .process_request(&mut ctx(), &inbound, &mut upstream)
            .await
            .unwrap();

        assert_eq!(
            upstream.uri.to_string(),
            "http://shop.example.com:9443/path?q=1"
        );
    }

    #[tokio::test]
    async fn test_backendsettings_forces_tls() {
        let module = BackendSettingsModule::from_config(
            "settings",
            &json!({ "ForceTLS": true, "Port": 443 }),
        )
        .unwrap();

        let inbound = inbound("shop.example.com");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        module
            .process_request(&mut ctx(), &inbound, &mut upstream)
            .await
            .unwrap();

        assert_eq!(
            upstream.uri.to_string(),
            "https://shop.example.com:443/path?q=1"
        );
    }

    #[tokio::test]
    async fn test_backendsettings_force_tls_without_port_keeps_authority() {
        let module =
            BackendSettingsModule::from_config("settings", &json!({ "ForceTLS": true })).unwrap();

        let inbound = inbound("shop.example.com");
        let mut upstream = UpstreamRequest::from_inbound(&inbound);
        upstream.uri = "http://10.0.0.5:8080/path?q=1".parse().unwrap();
        module
            .process_request(&mut ctx(), &inbound, &mut upstream)
            .await
            .unwrap();

        assert_eq!(
            upstream.uri.to_string(),
            "https://10.0.0.5:8080/path?q=1"
        );
    }

    #[test]
    fn test_registry_builds_builtins() {
        let registry = ModuleRegistry::with_builtins();
        for (module_type, cfg) in [
            ("set_header", json!({ "RequestHeader": { "X-Foo": "bar" } })),
            ("proxypass", json!({ "RewriteHost": true })),
            ("backendsettings", json!({ "Port": 8443 })),
        ] {
            let cfg = crate::config::ModuleConfig {
                r#type: module_type.to_string(),
                config: cfg,
            };
            let module = registry.build("m", &cfg).unwrap();
            assert_eq!(module.name(), "m");
        }

        let missing = crate::config::ModuleConfig {
            r#type: "no_such_type".to_string(),
            config: serde_json::Value::Null,
        };
        assert!(registry.build("m", &missing).is_err());
    }
}
