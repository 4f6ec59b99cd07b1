// src/lib.rs
pub mod buffer;
pub mod client;
pub mod compress;
pub mod config;
pub mod content_type;
pub mod engine;
pub mod error;
pub mod files;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod registry;
pub mod response;
pub mod router;
pub mod server;
pub mod syscalls;
pub mod tls;
pub mod transfer;
pub mod url;
pub mod worker;

// Re-exports for embedders
pub use buffer::WebBuffer;
pub use client::{ClientFlags, InputSource, WebClient};
pub use config::{TlsPolicy, WebConfig};
pub use content_type::ContentType;
pub use engine::{Acl, ApiHandler, ConfigRenderer, Engine, StreamHandler};
pub use error::{WebError, WebResult};
pub use http::Mode;
pub use logging::{init_logging, init_logging_with_level};
pub use parser::HttpValidation;
pub use registry::{HostHandle, HostRegistry, SingleHostRegistry};
pub use router::{bearer_required, permission_denied, process_request, process_url};
pub use server::Server;
pub use tls::{TlsIo, TlsState, TlsStream};
