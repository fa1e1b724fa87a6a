//! Backend roundtripping.
//!
//! The default transport sends the outbound request as-is through the
//! shared pooled client. The virtual transport additionally understands
//! `vt://<name>` URIs: it resolves the named upstream, rewrites scheme and
//! authority to a picked backend and retries network-class failures against
//! other backends within the configured attempt budget.

pub mod client;

use hyper::body::HttpBody;
use hyper::http::uri::PathAndQuery;
use hyper::{Body, HeaderMap, Request, Response, Uri};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{Cache, PinStore};
use crate::config::VirtualTransportConfig;
use crate::error::{VgateError, VgateResult};
use crate::upstream::{HealthMonitor, RoundRobinUpstream, UpstreamOptions};

/// Transport a proxy handler roundtrips through
#[derive(Clone, Debug)]
pub enum Transport {
    Default,
    Virtual(Arc<VirtualTransport>),
}

impl Transport {
    pub async fn roundtrip(&self, req: Request<Body>) -> VgateResult<Response<Body>> {
        match self {
            Transport::Default => plain_roundtrip(req).await,
            Transport::Virtual(vt) => {
                if req.uri().scheme_str() == Some("vt") {
                    vt.roundtrip(req).await
                } else {
                    plain_roundtrip(req).await
                }
            }
        }
    }
}

async fn plain_roundtrip(req: Request<Body>) -> VgateResult<Response<Body>> {
    let client = client::shared_client();
    client.request(req).await.map_err(map_roundtrip_error)
}

/// Maps `vt://<name>` URIs onto named upstreams and executes requests with
/// bounded retries. Retries happen only for network-class errors and only
/// while the request body is replayable (empty); a consumed streaming body
/// cannot be rewound, so its first error is final.
#[derive(Debug)]
pub struct VirtualTransport {
    upstreams: HashMap<String, Arc<RoundRobinUpstream>>,
    retries: u32,
    routing_key_header: Option<String>,
}

impl VirtualTransport {
    /// Build the transport and the health monitor supervising its probes
    pub fn from_config(
        cfg: &VirtualTransportConfig,
        cache: Arc<dyn Cache>,
    ) -> VgateResult<(Self, HealthMonitor)> {
        if cfg.r#type != "RoundRobin" {
            return Err(VgateError::config(format!(
                "Unknown upstream type: {}",
                cfg.r#type
            )));
        }

        let options = UpstreamOptions {
            max_fails: cfg.max_fails,
            quarantine: cfg.quarantine.as_duration(),
            burst_fail_grace: cfg.burst_fail_grace.as_duration(),
            backend_pin: cfg.backend_pin.as_duration(),
        };

        let pins = PinStore::new(cache);
        let mut upstreams = HashMap::new();
        let mut monitor = HealthMonitor::new();
        for (name, urls) in &cfg.upstreams {
            let upstream = Arc::new(RoundRobinUpstream::new(
                name.clone(),
                urls,
                pins.clone(),
                options.clone(),
            )?);
            if let Some(hc) = &cfg.health_check {
                monitor.watch_upstream(&upstream, hc);
            }
            upstreams.insert(name.clone(), upstream);
        }

        Ok((
            Self {
                upstreams,
                retries: cfg.retries,
                routing_key_header: cfg.routing_key_header.clone(),
            },
            monitor,
        ))
    }

    pub fn upstream(&self, name: &str) -> Option<&Arc<RoundRobinUpstream>> {
        self.upstreams.get(name)
    }

    fn routing_key<'h>(&self, headers: &'h HeaderMap) -> Option<&'h str> {
        let name = self.routing_key_header.as_deref()?;
        headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub async fn roundtrip(&self, req: Request<Body>) -> VgateResult<Response<Body>> {
        let (parts, body) = req.into_parts();

        let name = parts
            .uri
            .host()
            .unwrap_or_default()
            .to_string();
        let upstream = self
            .upstreams
            .get(&name)
            .ok_or(VgateError::UnknownUpstream { name: name.clone() })?;

        let routing_key = self.routing_key(&parts.headers).map(str::to_owned);
        let key = routing_key.as_deref();

        // An empty body can be resent; anything else burns the one attempt
        let replayable = body.size_hint().exact() == Some(0);
        let attempts = self.retries.max(1);
        let mut body = Some(body);
        let mut last_err: Option<VgateError> = None;

        for attempt in 0..attempts {
            let selection = upstream.select(key).await?;
            let uri = rewrite_uri(&parts.uri, &selection.backend.scheme, &selection.backend.authority)?;
            debug!(
                upstream = %name,
                backend = %selection.backend.base_url(),
                attempt = attempt + 1,
                "dispatching to backend"
            );

            let attempt_body = if replayable {
                Body::empty()
            } else {
                body.take().expect("non-replayable body used twice")
            };
            let mut outbound = Request::builder()
                .method(parts.method.clone())
                .uri(uri)
                .body(attempt_body)?;
            *outbound.headers_mut() = parts.headers.clone();

            let client = client::shared_client();
            match client.request(outbound).await {
                Ok(resp) => {
                    upstream.report_success(selection.index, key).await;
                    return Ok(resp);
                }
                Err(e) if e.is_canceled() => return Err(VgateError::ClientCancelled),
                Err(e) if is_network_error(&e) => {
                    warn!(
                        upstream = %name,
                        backend = %selection.backend.base_url(),
                        error = %e,
                        "backend attempt failed"
                    );
                    upstream.report_failure(selection.index);
                    let mapped = map_roundtrip_error(e);
                    if !replayable {
                        // The body is gone; the first error is final
                        return Err(finalize_error(mapped, attempt + 1));
                    }
                    last_err = Some(mapped);
                }
                // Anything else (including any HTTP response path) is final
                Err(e) => return Err(map_roundtrip_error(e)),
            }
        }

        let last = last_err.expect("retry loop exited without error");
        Err(finalize_error(last, attempts))
    }
}

/// Certificate problems keep their identity; any other exhausted network
/// failure is reported as the retry budget running out
fn finalize_error(last: VgateError, attempts: u32) -> VgateError {
    if matches!(last, VgateError::CertInvalid { .. }) {
        return last;
    }
    VgateError::RetriesExhausted {
        attempts,
        message: last.to_string(),
    }
}

fn rewrite_uri(
    original: &Uri,
    scheme: &hyper::http::uri::Scheme,
    authority: &hyper::http::uri::Authority,
) -> VgateResult<Uri> {
    let pq = original
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

/// Connection refused/reset, i/o timeouts and TLS handshake failures: the
/// classes worth another backend. An HTTP response, however ugly, is not.
fn is_network_error(err: &hyper::Error) -> bool {
    if err.is_connect() || err.is_closed() || err.is_incomplete_message() || err.is_timeout() {
        return true;
    }
    source_chain(err).any(|s| s.is::<std::io::Error>() || s.is::<rustls::Error>())
}

fn map_roundtrip_error(err: hyper::Error) -> VgateError {
    if err.is_canceled() {
        return VgateError::ClientCancelled;
    }
    if let Some(msg) = cert_error_message(&err) {
        return VgateError::CertInvalid { message: msg };
    }
    VgateError::network(format!("roundtrip failed: {}", err))
}

fn cert_error_message(err: &hyper::Error) -> Option<String> {
    source_chain(err).find_map(|s| {
        if let Some(tls) = s.downcast_ref::<rustls::Error>() {
            return Some(tls.to_string());
        }
        if let Some(io) = s.downcast_ref::<std::io::Error>() {
            let msg = io.to_string();
            if io.kind() == std::io::ErrorKind::InvalidData && msg.contains("certificate") {
                return Some(msg);
            }
        }
        None
    })
}

fn source_chain<'a>(
    err: &'a hyper::Error,
) -> impl Iterator<Item = &'a (dyn std::error::Error + 'static)> + 'a {
    let mut next = std::error::Error::source(err);
    std::iter::from_fn(move || {
        let current = next?;
        next = current.source();
        Some(current)
    })
}
