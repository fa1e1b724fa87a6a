//! The HTTP handler contract and the reverse proxy implementation of it.

pub mod handler;

use async_trait::async_trait;
use hyper::{Body, Request, Response};
use std::sync::Arc;

use crate::error::VgateResult;

/// Anything that can serve an inbound request. Named handlers in the
/// configuration resolve to one of these.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request<Body>) -> Response<Body>;

    /// Invoked when the owning server shuts down or is reconfigured
    async fn deinit(&self) -> VgateResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Handler")
    }
}

pub type SharedHandler = Arc<dyn Handler>;

pub use handler::ProxyHandler;
