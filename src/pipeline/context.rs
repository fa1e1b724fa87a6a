use hyper::http::request::Parts;
use hyper::{Body, HeaderMap, Method, Request, Uri, Version};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::VgateResult;

/// Read-only view of the inbound request as the client sent it.
/// The header map is shared with the outbound request until a module
/// needs to write.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: Arc<HeaderMap>,
    pub remote_addr: Option<SocketAddr>,
}

impl InboundRequest {
    pub fn from_parts(parts: &Parts, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: Arc::new(parts.headers.clone()),
            remote_addr,
        }
    }

    /// The Host the client addressed, from the Host header or absolute URI
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
    }
}

/// Outbound headers are either the inbound map (no allocation for
/// pass-through requests) or an owned deep copy once something writes.
#[derive(Debug, Clone)]
enum HeaderState {
    Shared(Arc<HeaderMap>),
    Owned(HeaderMap),
}

/// The request under construction for the backend.
///
/// Modules may rewrite method, URI and version freely; header writes must
/// go through [`RequestContext::ensure_writable_headers`] so zero-mutation
/// chains never pay for a header copy.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    headers: HeaderState,
}

impl UpstreamRequest {
    /// Shallow clone of the inbound request, sharing its header map
    pub fn from_inbound(inbound: &InboundRequest) -> Self {
        Self {
            method: inbound.method.clone(),
            uri: inbound.uri.clone(),
            version: inbound.version,
            headers: HeaderState::Shared(Arc::clone(&inbound.headers)),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match &self.headers {
            HeaderState::Shared(map) => map,
            HeaderState::Owned(map) => map,
        }
    }

    /// True while the outbound map still aliases the inbound map
    pub fn shares_headers_with(&self, inbound: &InboundRequest) -> bool {
        match &self.headers {
            HeaderState::Shared(map) => Arc::ptr_eq(map, &inbound.headers),
            HeaderState::Owned(_) => false,
        }
    }

    fn owned_headers_mut(&mut self) -> &mut HeaderMap {
        if let HeaderState::Shared(map) = &self.headers {
            self.headers = HeaderState::Owned((**map).clone());
        }
        match &mut self.headers {
            HeaderState::Owned(map) => map,
            HeaderState::Shared(_) => unreachable!("headers just made owned"),
        }
    }

    /// Materialize into a hyper request carrying the given body
    pub fn into_request(mut self, body: Body) -> VgateResult<Request<Body>> {
        let headers = std::mem::replace(self.owned_headers_mut(), HeaderMap::new());
        let mut req = Request::builder()
            .method(self.method)
            .uri(self.uri)
            .body(body)?;
        *req.headers_mut() = headers;
        Ok(req)
    }
}

/// Per-request state shared down the module chain: the session identity,
/// a module-visible scratch map, the cross-request cache handle and the
/// headers-cloned flag backing the copy-on-write contract.
///
/// One task owns the context for the request's lifetime; nothing here is
/// shared across requests.
pub struct RequestContext {
    session_id: String,
    info: HashMap<String, String>,
    copied_headers: bool,
    cache: Arc<dyn Cache>,
}

impl RequestContext {
    /// A fresh context. The session id is the inbound correlation header
    /// value, or a newly generated UUID when the request carried none.
    pub fn new(cache: Arc<dyn Cache>, correlation_id: Option<&str>) -> Self {
        let session_id = match correlation_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        Self {
            session_id,
            info: HashMap::new(),
            copied_headers: false,
            cache,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Cross-module scratch value
    pub fn ctx_info(&self, key: &str) -> Option<&str> {
        self.info.get(key).map(String::as_str)
    }

    pub fn set_ctx_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.info.insert(key.into(), value.into());
    }

    pub fn ctx_info_keys(&self) -> Vec<&str> {
        self.info.keys().map(String::as_str).collect()
    }

    /// The proxy-wide cache, for cross-request module state
    pub fn cache(&self) -> Arc<dyn Cache> {
        Arc::clone(&self.cache)
    }

    pub fn headers_copied(&self) -> bool {
        self.copied_headers
    }

    /// Make the outbound header map writable. The first call deep-copies
    /// the inbound headers onto the outbound request; later calls are
    /// no-ops returning the owned map.
    pub fn ensure_writable_headers<'a>(
        &mut self,
        outbound: &'a mut UpstreamRequest,
        _inbound: &InboundRequest,
    ) -> &'a mut HeaderMap {
        self.copied_headers = true;
        outbound.owned_headers_mut()
    }
}
