//! Named pools of equivalent backends.
//!
//! Selection is round-robin with a soft routing-key pin; failures count
//! toward quarantine unless they arrive in a burst right after a previous
//! failure; optional active probes keep liveness up to date.

pub mod health;
pub mod round_robin;

pub use health::{HealthMonitor, HealthProbe};
pub use round_robin::{Backend, RoundRobinUpstream, Selection, SlotStatus, UpstreamOptions};
