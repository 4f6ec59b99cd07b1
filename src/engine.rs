use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::buffer::WebBuffer;
use crate::client::WebClient;
use crate::config::WebConfig;
use crate::http::{HTTP_RESP_NOT_FOUND, HTTP_RESP_OK};
use crate::metrics::GlobalStats;
use crate::registry::{HostHandle, HostRegistry, SingleHostRegistry};

bitflags! {
    /// Per-connection access policy, resolved by the listener setup
    /// (per port / per source address) before the client reaches the
    /// engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Acl: u32 {
        const DASHBOARD  = 1 << 0;
        const REGISTRY   = 1 << 1;
        const BADGES     = 1 << 2;
        const MGMT       = 1 << 3;
        const AGENT_CONF = 1 << 4;
        const STREAMING  = 1 << 5;
    }
}

impl Default for Acl {
    fn default() -> Self {
        Acl::all()
    }
}

/// Data-API entry point. Receives the resolved host, the client (for
/// response buffers and parsed request state) and the path remainder
/// after `/api/vN/`. Returns the HTTP status code.
pub type ApiHandler = Arc<dyn Fn(&HostHandle, &mut WebClient, &str) -> u16 + Send + Sync>;

/// Streaming-ingestion entry point: gets the decoded query string of
/// a STREAM request and takes over the connection on success.
pub type StreamHandler = Arc<dyn Fn(&mut WebClient, &str) -> u16 + Send + Sync>;

/// Renders the agent configuration into the response buffer.
pub type ConfigRenderer = Arc<dyn Fn(&mut WebBuffer) + Send + Sync>;

/// Everything the request lifecycle engine needs besides the client
/// itself: configuration, the host registry and the opaque handler
/// callbacks. One instance is shared read-only by all workers, so the
/// engine behaves identically across deployment shapes.
pub struct Engine {
    pub config: WebConfig,
    pub stats: Arc<GlobalStats>,
    registry: Arc<dyn HostRegistry>,
    api_v1: ApiHandler,
    api_v2: ApiHandler,
    stream_handler: StreamHandler,
    config_renderer: ConfigRenderer,
    next_client_id: AtomicU64,
}

impl Engine {
    pub fn new(config: WebConfig) -> Self {
        Self {
            config,
            stats: Arc::new(GlobalStats::new()),
            registry: Arc::new(SingleHostRegistry::new("localhost")),
            api_v1: Arc::new(|_, w, _| {
                w.response.data.flush();
                w.response.data.push_str("API v1 is not available.");
                HTTP_RESP_NOT_FOUND
            }),
            api_v2: Arc::new(|_, w, _| {
                w.response.data.flush();
                w.response.data.push_str("API v2 is not available.");
                HTTP_RESP_NOT_FOUND
            }),
            stream_handler: Arc::new(|w, _| {
                w.response.data.flush();
                w.response.data.push_str("Streaming is not available.");
                HTTP_RESP_NOT_FOUND
            }),
            config_renderer: Arc::new(|out| {
                out.push_str("# vitals configuration\n");
            }),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn HostRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_api_v1(mut self, handler: ApiHandler) -> Self {
        self.api_v1 = handler;
        self
    }

    pub fn with_api_v2(mut self, handler: ApiHandler) -> Self {
        self.api_v2 = handler;
        self
    }

    pub fn with_stream_handler(mut self, handler: StreamHandler) -> Self {
        self.stream_handler = handler;
        self
    }

    pub fn with_config_renderer(mut self, renderer: ConfigRenderer) -> Self {
        self.config_renderer = renderer;
        self
    }

    pub fn registry(&self) -> &dyn HostRegistry {
        &*self.registry
    }

    pub fn api_v1(&self) -> ApiHandler {
        Arc::clone(&self.api_v1)
    }

    pub fn api_v2(&self) -> ApiHandler {
        Arc::clone(&self.api_v2)
    }

    pub fn stream_handler(&self) -> StreamHandler {
        Arc::clone(&self.stream_handler)
    }

    pub fn render_config(&self, out: &mut WebBuffer) -> u16 {
        (self.config_renderer)(out);
        HTTP_RESP_OK
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_monotonic() {
        let e = Engine::new(WebConfig::default());
        let a = e.next_client_id();
        let b = e.next_client_id();
        assert!(b > a);
    }

    #[test]
    fn default_acl_allows_everything() {
        assert!(Acl::default().contains(Acl::DASHBOARD | Acl::MGMT | Acl::STREAMING));
    }

    #[test]
    fn default_registry_is_single_host() {
        let e = Engine::new(WebConfig::default());
        assert!(e.registry().base_host().is_base);
        assert!(e.registry().by_node_id("x").is_none());
    }
}
