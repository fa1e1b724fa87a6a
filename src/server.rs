//! Server assembly: bind the configured listeners, serve each with its
//! resolved handler, run the health monitors, and drain everything on
//! shutdown.

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Server};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{VgateError, VgateResult};
use crate::proxy::SharedHandler;
use crate::registry::HandlerRegistry;

/// Owns the configured servers and the registry that resolved their
/// handlers. Configuration errors surface before any socket is bound, so a
/// failed reload can leave a running instance untouched.
pub struct GatewayServer {
    config: Config,
    registry: HandlerRegistry,
}

impl GatewayServer {
    pub fn from_config(config: Config) -> Self {
        let registry = HandlerRegistry::new(config.handlers.clone());
        Self { config, registry }
    }

    /// Registration point for embedder handler and module types, used
    /// before `run` resolves the handler graph
    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Resolve all handlers, bind all listeners, serve until the shutdown
    /// channel fires, then deinitialize handlers.
    pub async fn run(mut self, shutdown: broadcast::Sender<()>) -> VgateResult<()> {
        // Resolve every server's handler graph up front
        let mut bindings: Vec<(String, SocketAddr, SharedHandler)> = Vec::new();
        for (srv_name, srv_cfg) in &self.config.http {
            let mut handler = self.registry.handler_for_spec(&srv_cfg.handler)?;
            if let Some(spec) = srv_cfg.metrics.as_deref().filter(|s| !s.is_empty()) {
                handler = HandlerRegistry::wrap_metrics(srv_name, spec, handler);
            }
            for (lst_name, lst_cfg) in &srv_cfg.listeners {
                let addr: SocketAddr = lst_cfg.bind_address().parse().map_err(|e| {
                    VgateError::config(format!(
                        "listener {}/{}: bad address: {}",
                        srv_name, lst_name, e
                    ))
                })?;
                bindings.push((format!("{}/{}", srv_name, lst_name), addr, handler.clone()));
            }
        }

        let mut tasks = JoinSet::new();

        for monitor in self.registry.take_monitors() {
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                monitor.run(shutdown).await;
                Ok::<(), VgateError>(())
            });
        }

        for (name, addr, handler) in bindings {
            let srv_cfg = self
                .config
                .http
                .get(name.split('/').next().unwrap_or_default())
                .cloned();

            let make_service = make_service_fn(move |conn: &AddrStream| {
                let handler = handler.clone();
                let remote = conn.remote_addr();
                async move {
                    Ok::<_, Infallible>(service_fn(move |mut req: Request<Body>| {
                        let handler = handler.clone();
                        req.extensions_mut().insert(remote);
                        async move { Ok::<_, Infallible>(handler.handle(req).await) }
                    }))
                }
            });

            let mut builder = Server::try_bind(&addr)
                .map_err(|e| VgateError::config(format!("bind {} ({}): {}", addr, name, e)))?;
            if let Some(cfg) = &srv_cfg {
                if !cfg.read_header_timeout.is_zero() {
                    builder = builder.http1_header_read_timeout(cfg.read_header_timeout.as_duration());
                }
                builder = builder.http1_keepalive(!cfg.disable_keep_alives);
            }

            let mut shutdown_rx = shutdown.subscribe();
            let server = builder
                .serve(make_service)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                });

            info!(listener = %name, address = %addr, "HTTP server listening");
            let listener_name = name.clone();
            tasks.spawn(async move {
                server.await.map_err(|e| {
                    error!(listener = %listener_name, error = %e, "HTTP server error");
                    VgateError::network(format!("server {}: {}", listener_name, e))
                })
            });
        }

        let mut first_error: Option<VgateError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error
                        .get_or_insert(VgateError::internal(format!("task panicked: {}", e)));
                }
            }
        }

        if let Err(e) = self.registry.deinit_all().await {
            error!(error = %e, "handler deinit reported failures");
            first_error.get_or_insert(e);
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
