use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::round_robin::RoundRobinUpstream;
use crate::config::HealthCheckConfig;
use crate::transport::client;

/// One probing loop for one backend
#[derive(Debug)]
pub struct HealthProbe {
    upstream: Arc<RoundRobinUpstream>,
    index: usize,
    interval: Duration,
    timeout: Duration,
    expect: u16,
    uri_path: String,
}

impl HealthProbe {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let target = self.upstream.backend(self.index).base_url();
        let probe_url = format!("{}{}", target, self.uri_path);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.recv() => {
                    debug!(backend = %target, "health probe stopping");
                    return;
                }
            }

            let healthy = match client::get_status(&probe_url, self.timeout).await {
                Ok(status) => status.as_u16() == self.expect,
                Err(e) => {
                    debug!(backend = %target, error = %e, "health probe failed");
                    false
                }
            };
            self.upstream.probe_result(self.index, healthy);
        }
    }
}

/// Background service supervising the health probes of every backend of
/// every upstream. `run` launches all probe tasks and returns once each has
/// observed shutdown and exited.
#[derive(Default, Debug)]
pub struct HealthMonitor {
    probes: Vec<HealthProbe>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register probes for every backend of the upstream. A zero probe
    /// timeout disables probing, matching the configuration contract.
    pub fn watch_upstream(&mut self, upstream: &Arc<RoundRobinUpstream>, cfg: &HealthCheckConfig) {
        if cfg.timeout.is_zero() {
            return;
        }
        for index in 0..upstream.len() {
            self.probes.push(HealthProbe {
                upstream: Arc::clone(upstream),
                index,
                interval: cfg.interval.as_duration(),
                timeout: cfg.timeout.as_duration(),
                expect: cfg.expect,
                uri_path: cfg.uri_path.clone(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    pub async fn run(self, shutdown: broadcast::Sender<()>) {
        if self.probes.is_empty() {
            return;
        }
        info!(probes = self.probes.len(), "backend health monitor started");
        let mut tasks = JoinSet::new();
        for probe in self.probes {
            tasks.spawn(probe.run(shutdown.subscribe()));
        }
        while tasks.join_next().await.is_some() {}
        info!("backend health monitor stopped");
    }
}
