use hyper::http::uri::{Authority, Scheme};
use hyper::Uri;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cache::PinStore;
use crate::error::{VgateError, VgateResult};

/// One concrete target inside an upstream: a scheme plus authority
#[derive(Debug, Clone)]
pub struct Backend {
    pub scheme: Scheme,
    pub authority: Authority,
}

impl Backend {
    pub fn parse(url: &str) -> VgateResult<Self> {
        let uri: Uri = url.parse()?;
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| VgateError::config(format!("backend URL missing scheme: {}", url)))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| VgateError::config(format!("backend URL missing host: {}", url)))?;
        Ok(Self { scheme, authority })
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.authority)
    }
}

/// Request-driven accounting plus probe-driven liveness of one slot
#[derive(Debug, Clone)]
struct SlotState {
    fails: u32,
    quarantine_until: Option<Instant>,
    last_fail_at: Option<Instant>,
    alive: bool,
}

impl SlotState {
    fn new() -> Self {
        Self {
            fails: 0,
            quarantine_until: None,
            last_fail_at: None,
            alive: true,
        }
    }

    fn available(&self, now: Instant) -> bool {
        self.alive && !matches!(self.quarantine_until, Some(until) if until > now)
    }
}

/// Snapshot of one slot for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    pub fails: u32,
    pub quarantined: bool,
    pub alive: bool,
}

/// The slot index chosen for one attempt
#[derive(Debug, Clone)]
pub struct Selection {
    pub index: usize,
    pub backend: Backend,
}

/// Behavior knobs of one upstream pool
#[derive(Debug, Clone, Default)]
pub struct UpstreamOptions {
    /// Failures before a slot enters quarantine; zero disables quarantine
    pub max_fails: u32,
    /// How long a quarantined slot is excluded
    pub quarantine: Duration,
    /// Failures within this window of the previous one only refresh the
    /// failure timestamp; they are taken for in-flight requests that hit
    /// the same broken backend
    pub burst_fail_grace: Duration,
    /// TTL of routing-key pins; zero disables write-through
    pub backend_pin: Duration,
}

#[derive(Debug)]
struct ScanState {
    cursor: usize,
    slots: Vec<SlotState>,
}

/// A named, ordered pool of equivalent backends with round-robin selection,
/// soft routing-key pinning, failure counting and quarantine.
///
/// Slot state sits behind one mutex so cursor advancement is linearizable:
/// two concurrent selections never observe the same cursor value.
#[derive(Debug)]
pub struct RoundRobinUpstream {
    name: String,
    backends: Vec<Backend>,
    state: Mutex<ScanState>,
    pins: PinStore,
    options: UpstreamOptions,
}

impl RoundRobinUpstream {
    pub fn new(
        name: impl Into<String>,
        urls: &[String],
        pins: PinStore,
        options: UpstreamOptions,
    ) -> VgateResult<Self> {
        let name = name.into();
        if urls.is_empty() {
            return Err(VgateError::config(format!(
                "upstream {} has no backends",
                name
            )));
        }
        let backends = urls
            .iter()
            .map(|u| Backend::parse(u))
            .collect::<VgateResult<Vec<_>>>()?;
        let slots = vec![SlotState::new(); backends.len()];
        Ok(Self {
            name,
            backends,
            state: Mutex::new(ScanState { cursor: 0, slots }),
            pins,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backend(&self, index: usize) -> &Backend {
        &self.backends[index]
    }

    /// Pick a slot for one attempt.
    ///
    /// A non-empty routing key consults the pin store first; the pin is only
    /// a hint and an unavailable slot falls back to the rotation scan. The
    /// scan starts at the cursor and takes the first available slot, leaving
    /// the cursor one past it.
    pub async fn select(&self, routing_key: Option<&str>) -> VgateResult<Selection> {
        let pinned = match routing_key {
            Some(key) if !key.is_empty() => self.pins.get(key).await,
            _ => None,
        };

        let now = Instant::now();
        let mut state = self.state.lock().expect("upstream state mutex poisoned");

        if let Some(idx) = pinned {
            if idx < state.slots.len() && state.slots[idx].available(now) {
                debug!(upstream = %self.name, slot = idx, "pinned backend selected");
                return Ok(Selection {
                    index: idx,
                    backend: self.backends[idx].clone(),
                });
            }
        }

        let n = state.slots.len();
        for offset in 0..n {
            let idx = (state.cursor + offset) % n;
            if state.slots[idx].available(now) {
                state.cursor = (idx + 1) % n;
                return Ok(Selection {
                    index: idx,
                    backend: self.backends[idx].clone(),
                });
            }
        }

        Err(VgateError::NoLiveBackend {
            upstream: self.name.clone(),
        })
    }

    /// Record a failed attempt against a slot.
    ///
    /// Failures inside the burst grace window after the previous one only
    /// refresh the timestamp. Reaching MaxFails quarantines the slot and
    /// resets the counter.
    pub fn report_failure(&self, index: usize) {
        let now = Instant::now();
        let options = &self.options;
        let mut state = self.state.lock().expect("upstream state mutex poisoned");
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };

        if !options.burst_fail_grace.is_zero() {
            if let Some(last) = slot.last_fail_at {
                if now.duration_since(last) < options.burst_fail_grace {
                    slot.last_fail_at = Some(now);
                    return;
                }
            }
        }

        slot.fails += 1;
        slot.last_fail_at = Some(now);
        if options.max_fails > 0 && slot.fails >= options.max_fails {
            slot.quarantine_until = Some(now + options.quarantine);
            slot.fails = 0;
            warn!(
                upstream = %self.name,
                backend = %self.backends[index].base_url(),
                quarantine = ?options.quarantine,
                "backend quarantined"
            );
        }
    }

    /// Record a successful roundtrip; writes the pin through when the
    /// request carried a routing key
    pub async fn report_success(&self, index: usize, routing_key: Option<&str>) {
        if self.options.backend_pin.is_zero() {
            return;
        }
        if let Some(key) = routing_key {
            if !key.is_empty() {
                self.pins.set(key, index, self.options.backend_pin).await;
            }
        }
    }

    /// Apply one health probe outcome. Probe success clears the failure
    /// counter; probe failure only drops liveness, keeping probe-driven and
    /// request-driven accounting decoupled.
    pub fn probe_result(&self, index: usize, healthy: bool) {
        let mut state = self.state.lock().expect("upstream state mutex poisoned");
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };
        if healthy {
            if !slot.alive {
                debug!(
                    upstream = %self.name,
                    backend = %self.backends[index].base_url(),
                    "backend back alive"
                );
            }
            slot.fails = 0;
            slot.alive = true;
        } else {
            slot.alive = false;
        }
    }

    pub fn slot_status(&self, index: usize) -> SlotStatus {
        let now = Instant::now();
        let state = self.state.lock().expect("upstream state mutex poisoned");
        let slot = &state.slots[index];
        SlotStatus {
            fails: slot.fails,
            quarantined: matches!(slot.quarantine_until, Some(until) if until > now),
            alive: slot.alive,
        }
    }
}
