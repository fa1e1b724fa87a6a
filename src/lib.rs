pub mod cache;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod transport;
pub mod upstream;

// Re-export commonly used types
pub use cache::{Cache, CacheError, CacheStats, Fetcher, MemoryCache, NullCache, PinStore};
pub use config::{Config, ConfigDuration, HandlerSpec};
pub use error::{VgateError, VgateResult};
pub use pipeline::{
    InboundRequest, ModulePipeline, ModuleRegistry, ProxyModule, RequestContext, UpstreamRequest,
};
pub use proxy::{Handler, ProxyHandler, SharedHandler};
pub use registry::HandlerRegistry;
pub use server::GatewayServer;
pub use transport::{Transport, VirtualTransport};
pub use upstream::{HealthMonitor, RoundRobinUpstream, UpstreamOptions};
