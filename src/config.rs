use std::path::PathBuf;

/// TLS policy of the listening port, as configured by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Plain HTTP only. No redirects, STREAM accepted in clear text.
    #[default]
    Off,
    /// TLS available; plain HTTP clients are redirected to https.
    Optional,
    /// TLS required; plain STREAM connections are refused.
    Force,
}

impl TlsPolicy {
    pub fn wants_tls(self) -> bool {
        !matches!(self, TlsPolicy::Off)
    }
}

/// Immutable engine configuration.
///
/// The engine never consults process globals: everything tunable is
/// captured here once at startup and shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// Root directory of the static dashboard files.
    pub web_dir: PathBuf,

    /// Honor `Accept-Encoding: gzip` by compressing responses.
    pub enable_gzip: bool,
    /// gzip compression level, 0-9.
    pub gzip_level: u32,
    /// Size of one compressed output chunk.
    pub zlib_chunk_size: usize,

    /// Honor the browser `DNT` header and advertise it back (`Tk:`).
    pub respect_dnt: bool,
    /// Optional `X-Frame-Options:` response header value.
    pub x_frame_options: Option<String>,

    pub tls_policy: TlsPolicy,

    /// Initial allocation of the per-client receive buffer.
    pub request_initial_size: usize,
    /// Requests beyond this size are answered with 400 and dropped.
    pub request_max_size: usize,
    /// Give up on clients whose headers need more reads than this.
    pub max_header_fetch_tries: usize,

    /// Per-request deadline in milliseconds. 0 disables the check.
    pub timeout_ms: u64,

    /// Listen address for the pooled-worker reference driver.
    pub listen: String,
    /// Worker threads for the reference driver. 0 means one per core.
    pub workers: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            web_dir: PathBuf::from("/usr/share/vitals/web"),
            enable_gzip: true,
            gzip_level: 3,
            zlib_chunk_size: 16384,
            respect_dnt: false,
            x_frame_options: None,
            tls_policy: TlsPolicy::Off,
            request_initial_size: 16384,
            request_max_size: 65536,
            max_header_fetch_tries: 10,
            timeout_ms: 0,
            listen: "0.0.0.0:19999".to_string(),
            workers: 0,
        }
    }
}
