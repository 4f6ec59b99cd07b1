use std::time::Instant;

use bitflags::bitflags;

use crate::buffer::WebBuffer;
use crate::compress::Deflater;
use crate::engine::Acl;
use crate::http::{Mode, strip_control_characters};
use crate::metrics::GlobalStats;
use crate::syscalls;
use crate::tls::TlsStream;

pub const INITIAL_URL_BUFFER_SIZE: usize = 1024;
pub const INITIAL_HEADER_BUFFER_SIZE: usize = 4096;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        const DEAD              = 1 << 0;
        const KEEPALIVE         = 1 << 1;
        const WAIT_RECEIVE      = 1 << 2;
        const WAIT_SEND         = 1 << 3;
        const DONOTTRACK        = 1 << 4;
        const TRACKING_REQUIRED = 1 << 5;
        const CHUNKED_TRANSFER  = 1 << 6;
        const UNIX_SOCKET       = 1 << 7;
        const CORKABLE          = 1 << 8;
        const TLS_WAIT_RECEIVE  = 1 << 9;
        const TLS_WAIT_SEND     = 1 << 10;

        const PATH_IS_V0                = 1 << 16;
        const PATH_IS_V1                = 1 << 17;
        const PATH_IS_V2                = 1 << 18;
        const PATH_HAS_FILE_EXTENSION   = 1 << 19;
        const PATH_HAS_TRAILING_SLASH   = 1 << 20;

        const PATH_WITH_VERSION = Self::PATH_IS_V0.bits()
            | Self::PATH_IS_V1.bits()
            | Self::PATH_IS_V2.bits();
    }
}

/// Where response body bytes come from. `File` is only ever set in
/// FILECOPY mode while the input file is open; everywhere else the
/// input is the connection socket itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputSource {
    #[default]
    Socket,
    File(i32),
}

#[derive(Debug, Default)]
pub struct RequestStats {
    pub received_bytes: u64,
    pub sent_bytes: u64,
}

#[derive(Debug, Default)]
pub struct Timings {
    /// Receive start of the current request.
    pub tv_in: Option<Instant>,
    /// When the response became ready to send.
    pub tv_ready: Option<Instant>,
    pub tv_timeout_last_checkpoint: Option<Instant>,
    /// Per-request deadline in microseconds. 0 disables it.
    pub timeout_ut: u64,
}

/// Per-request response state. `data` doubles as the receive buffer
/// while request headers are being accumulated.
pub struct Response {
    pub data: WebBuffer,
    /// Custom headers accumulated by handlers (e.g. `Location:`).
    pub header: WebBuffer,
    /// The fully composed response head.
    pub header_output: WebBuffer,
    pub code: u16,
    pub has_cookies: bool,
    /// Plain mode: bytes of `data` already written to the socket.
    /// Compressed mode: input bytes already handed to the compressor.
    pub sent: usize,
    /// Expected total body size for FILECOPY / fully buffered replies.
    pub rlen: usize,

    pub zoutput: bool,
    pub zinitialized: bool,
    pub zstream: Option<Deflater>,
    /// Current compressed chunk and the send cursor inside it.
    pub zbuffer: Vec<u8>,
    pub zhave: usize,
    pub zsent: usize,
}

impl Response {
    fn new() -> Self {
        Self {
            data: WebBuffer::with_capacity(INITIAL_HEADER_BUFFER_SIZE),
            header: WebBuffer::with_capacity(256),
            header_output: WebBuffer::with_capacity(INITIAL_HEADER_BUFFER_SIZE),
            code: 0,
            has_cookies: false,
            sent: 0,
            rlen: 0,
            zoutput: false,
            zinitialized: false,
            zstream: None,
            zbuffer: Vec::new(),
            zhave: 0,
            zsent: 0,
        }
    }

    fn drop_compression(&mut self) {
        self.zstream = None;
        self.zbuffer.clear();
        self.zhave = 0;
        self.zsent = 0;
        self.zinitialized = false;
        self.zoutput = false;
    }
}

/// One web client per connection, reusable from a pool across
/// keep-alive requests and across connections.
pub struct WebClient {
    pub id: u64,
    pub use_count: usize,
    pub client_ip: String,
    pub client_port: String,

    /// Output socket fd. Owned by the driver, never closed here.
    pub ofd: i32,
    pub source: InputSource,
    pub tcp_cork: bool,
    pub tls: Option<Box<dyn TlsStream>>,

    pub mode: Mode,
    pub flags: ClientFlags,
    pub acl: Acl,

    pub url_as_received: WebBuffer,
    pub url_path_decoded: WebBuffer,
    pub url_query_string_decoded: WebBuffer,
    pub post_payload: Vec<u8>,

    pub origin: Option<String>,
    pub user_agent: Option<String>,
    pub auth_bearer_token: Option<String>,
    pub server_host: Option<String>,
    pub forwarded_host: Option<String>,

    pub header_parse_tries: usize,
    pub header_parse_last_size: usize,

    pub response: Response,
    pub stats: RequestStats,
    pub timings: Timings,
}

impl WebClient {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            use_count: 1,
            client_ip: String::new(),
            client_port: String::new(),
            ofd: -1,
            source: InputSource::Socket,
            tcp_cork: false,
            tls: None,
            mode: Mode::Get,
            flags: ClientFlags::WAIT_RECEIVE | ClientFlags::CORKABLE,
            acl: Acl::default(),
            url_as_received: WebBuffer::with_capacity(INITIAL_URL_BUFFER_SIZE),
            url_path_decoded: WebBuffer::with_capacity(INITIAL_URL_BUFFER_SIZE),
            url_query_string_decoded: WebBuffer::with_capacity(INITIAL_URL_BUFFER_SIZE),
            post_payload: Vec::new(),
            origin: None,
            user_agent: None,
            auth_bearer_token: None,
            server_host: None,
            forwarded_host: None,
            header_parse_tries: 0,
            header_parse_last_size: 0,
            response: Response::new(),
            stats: RequestStats::default(),
            timings: Timings::default(),
        }
    }

    /// Input fd for receive operations: the open file during
    /// FILECOPY, the connection socket otherwise.
    pub fn ifd(&self) -> i32 {
        match self.source {
            InputSource::Socket => self.ofd,
            InputSource::File(fd) => fd,
        }
    }

    // ---- flag helpers ----

    pub fn is_dead(&self) -> bool {
        self.flags.contains(ClientFlags::DEAD)
    }

    pub fn mark_dead(&mut self) {
        self.flags.insert(ClientFlags::DEAD);
    }

    pub fn has_keepalive(&self) -> bool {
        self.flags.contains(ClientFlags::KEEPALIVE)
    }

    pub fn wants_receive(&self) -> bool {
        self.flags.contains(ClientFlags::WAIT_RECEIVE)
    }

    pub fn wants_send(&self) -> bool {
        self.flags.contains(ClientFlags::WAIT_SEND)
    }

    pub fn enable_wait_receive(&mut self) {
        self.flags.insert(ClientFlags::WAIT_RECEIVE);
    }

    pub fn disable_wait_receive(&mut self) {
        self.flags.remove(ClientFlags::WAIT_RECEIVE);
    }

    pub fn enable_wait_send(&mut self) {
        self.flags.insert(ClientFlags::WAIT_SEND);
    }

    pub fn disable_wait_send(&mut self) {
        self.flags.remove(ClientFlags::WAIT_SEND);
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn is_unix_socket(&self) -> bool {
        self.flags.contains(ClientFlags::UNIX_SOCKET)
    }

    /// The `/v{0,1,2}/` dashboard version recorded in the path flags.
    pub fn dashboard_version(&self) -> Option<u8> {
        if self.flags.contains(ClientFlags::PATH_IS_V0) {
            Some(0)
        } else if self.flags.contains(ClientFlags::PATH_IS_V1) {
            Some(1)
        } else if self.flags.contains(ClientFlags::PATH_IS_V2) {
            Some(2)
        } else {
            None
        }
    }

    pub fn reset_path_flags(&mut self) {
        self.flags.remove(
            ClientFlags::PATH_WITH_VERSION
                | ClientFlags::PATH_HAS_FILE_EXTENSION
                | ClientFlags::PATH_HAS_TRAILING_SLASH,
        );
    }

    // ---- TCP corking (see response head send and request_done) ----

    pub fn cork_socket(&mut self) {
        if self.flags.contains(ClientFlags::CORKABLE) && !self.tcp_cork && self.ofd != -1 {
            self.tcp_cork = true;
            if let Err(e) = syscalls::set_tcp_cork(self.ofd, true) {
                tracing::error!("{}: failed to enable TCP_CORK on socket: {}", self.id, e);
                self.tcp_cork = false;
            }
        }
    }

    pub fn uncork_socket(&mut self) {
        if self.tcp_cork && self.ofd != -1 {
            self.tcp_cork = false;
            if let Err(e) = syscalls::set_tcp_cork(self.ofd, false) {
                tracing::error!("{}: failed to disable TCP_CORK on socket: {}", self.id, e);
            }
        }
        self.tcp_cork = false;
    }

    // ---- timeout checkpoints ----

    pub fn timeout_checkpoint_init(&mut self) {
        self.timings.tv_in = Some(Instant::now());
    }

    pub fn timeout_checkpoint_set(&mut self, timeout_ms: u64) {
        self.timings.timeout_ut = timeout_ms * 1000;

        if self.timings.tv_in.is_none() {
            self.timeout_checkpoint_init();
        }
        if self.timings.tv_timeout_last_checkpoint.is_none() {
            self.timings.tv_timeout_last_checkpoint = self.timings.tv_in;
        }
    }

    /// Advance the checkpoint; returns µs since the previous one.
    pub fn timeout_checkpoint(&mut self) -> u64 {
        let now = Instant::now();
        let last = self
            .timings
            .tv_timeout_last_checkpoint
            .or(self.timings.tv_in)
            .unwrap_or(now);
        self.timings.tv_timeout_last_checkpoint = Some(now);
        now.duration_since(last).as_micros() as u64
    }

    /// Mark the response as ready; returns the total preparation time
    /// of the request in µs.
    pub fn timeout_checkpoint_response_ready(&mut self) -> u64 {
        self.timeout_checkpoint();
        self.timings.tv_ready = self.timings.tv_timeout_last_checkpoint;
        match (self.timings.tv_in, self.timings.tv_ready) {
            (Some(t0), Some(t1)) => t1.duration_since(t0).as_micros() as u64,
            _ => 0,
        }
    }

    /// Checkpoint and test the per-request deadline. On expiry the
    /// response body is replaced with a 504 and the caller must treat
    /// the response as complete.
    pub fn timeout_checkpoint_and_check(&mut self) -> bool {
        self.timeout_checkpoint();

        if self.timings.timeout_ut == 0 {
            return false;
        }

        let since_reception = match (self.timings.tv_in, self.timings.tv_timeout_last_checkpoint) {
            (Some(t0), Some(t1)) => t1.duration_since(t0).as_micros() as u64,
            _ => return false,
        };

        if since_reception >= self.timings.timeout_ut {
            self.response.data.flush();
            self.response.data.push_str("Query timeout exceeded");
            self.response.code = crate::http::HTTP_RESP_GATEWAY_TIMEOUT;
            return true;
        }

        false
    }

    // ---- lifecycle ----

    fn reset_allocations(&mut self) {
        self.url_as_received.flush();
        self.url_path_decoded.flush();
        self.url_query_string_decoded.flush();

        self.response.header_output.flush();
        self.response.header.flush();
        self.response.data.flush();

        // keep the post payload allocation across requests
        self.post_payload.clear();

        self.server_host = None;
        self.forwarded_host = None;
        self.origin = None;
        self.user_agent = None;
        self.auth_bearer_token = None;

        if self.response.zinitialized {
            self.response.drop_compression();
            self.flags.remove(ClientFlags::CHUNKED_TRANSFER);
        }

        self.reset_path_flags();
    }

    /// Close out the current request: audit, statistics, FILECOPY
    /// teardown, then reset to a state ready for the next request on
    /// the same connection.
    pub fn request_done(&mut self, global: &GlobalStats) {
        self.uncork_socket();

        if !self.url_as_received.is_empty() {
            let now = Instant::now();

            let size = if self.mode == Mode::FileCopy {
                self.response.rlen as u64
            } else {
                self.response.data.len() as u64
            };
            let sent = match (self.response.zoutput, &self.response.zstream) {
                (true, Some(z)) => z.total_out(),
                _ => size,
            };

            global.request_completed(self.stats.received_bytes, self.stats.sent_bytes, size, sent);

            let ratio = if size > 0 {
                -((size as i64 - sent as i64) as f64 / size as f64 * 100.0)
            } else {
                0.0
            };
            let prep_ms = match (self.timings.tv_in, self.timings.tv_ready) {
                (Some(t0), Some(t1)) => t1.duration_since(t0).as_secs_f64() * 1000.0,
                _ => 0.0,
            };
            let send_ms = match self.timings.tv_ready {
                Some(t1) => now.duration_since(t1).as_secs_f64() * 1000.0,
                None => 0.0,
            };
            let total_ms = match self.timings.tv_in {
                Some(t0) => now.duration_since(t0).as_secs_f64() * 1000.0,
                None => 0.0,
            };

            tracing::info!(
                target: "access",
                "{}: {} '[{}]:{}' '{}' (sent/all = {}/{} bytes {:.0}%, prep/sent/total = {:.2}/{:.2}/{:.2} ms) {} '{}'",
                self.id,
                syscalls::gettid(),
                self.client_ip,
                self.client_port,
                self.mode.as_log_str(),
                sent,
                size,
                ratio,
                prep_ms,
                send_ms,
                total_ms,
                self.response.code,
                strip_control_characters(&self.url_as_received.as_str()),
            );

            self.stats.received_bytes = 0;
            self.stats.sent_bytes = 0;
        }

        if self.mode == Mode::FileCopy
            && let InputSource::File(fd) = self.source
        {
            syscalls::close_fd(fd);
            self.source = InputSource::Socket;
        }

        self.reset_allocations();

        self.mode = Mode::Get;

        self.flags.remove(
            ClientFlags::DONOTTRACK | ClientFlags::TRACKING_REQUIRED | ClientFlags::KEEPALIVE,
        );

        self.header_parse_tries = 0;
        self.header_parse_last_size = 0;

        self.enable_wait_receive();
        self.disable_wait_send();

        self.response.has_cookies = false;
        self.response.rlen = 0;
        self.response.sent = 0;
        self.response.code = 0;
        self.response.zoutput = false;

        self.timings = Timings::default();
    }

    /// Prepare a pooled client for a brand new connection: everything
    /// resets except the buffer allocations, the use count and the
    /// encrypted-transport handle. The caller assigns the new
    /// identity and socket afterwards.
    pub fn reuse(&mut self) {
        if let InputSource::File(fd) = self.source {
            syscalls::close_fd(fd);
        }

        self.reset_allocations();

        self.use_count += 1;

        self.id = 0;
        self.client_ip.clear();
        self.client_port.clear();
        self.ofd = -1;
        self.source = InputSource::Socket;
        self.tcp_cork = false;
        self.mode = Mode::Get;
        self.flags = ClientFlags::WAIT_RECEIVE | ClientFlags::CORKABLE;
        self.acl = Acl::default();
        self.header_parse_tries = 0;
        self.header_parse_last_size = 0;
        self.response.code = 0;
        self.response.has_cookies = false;
        self.response.sent = 0;
        self.response.rlen = 0;
        self.response.zoutput = false;
        self.stats = RequestStats::default();
        self.timings = Timings::default();
    }
}

impl Drop for WebClient {
    fn drop(&mut self) {
        if let InputSource::File(fd) = self.source {
            syscalls::close_fd(fd);
        }
        if let Some(tls) = self.tls.as_mut() {
            tls.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_waits_for_receive() {
        let w = WebClient::new(7);
        assert!(w.wants_receive());
        assert!(!w.wants_send());
        assert!(!w.is_dead());
        assert_eq!(w.mode, Mode::Get);
        assert_eq!(w.ifd(), -1);
    }

    #[test]
    fn input_source_aliases_socket() {
        let mut w = WebClient::new(1);
        w.ofd = 9;
        assert_eq!(w.ifd(), 9);
        w.source = InputSource::File(12);
        assert_eq!(w.ifd(), 12);
        w.source = InputSource::Socket;
        assert_eq!(w.ifd(), 9);
    }

    #[test]
    fn request_done_resets_but_keeps_buffers() {
        let g = GlobalStats::new();
        let mut w = WebClient::new(1);
        w.url_as_received.push_str("/index.html");
        w.url_path_decoded.push_str("/index.html");
        w.response.data.push_str("body");
        w.response.code = 200;
        w.mode = Mode::Get;
        w.flags.insert(ClientFlags::KEEPALIVE | ClientFlags::PATH_IS_V2);
        w.post_payload.extend_from_slice(b"payload");
        let payload_cap = w.post_payload.capacity();

        w.request_done(&g);

        assert!(w.url_as_received.is_empty());
        assert!(w.response.data.is_empty());
        assert_eq!(w.response.code, 0);
        assert_eq!(w.mode, Mode::Get);
        assert!(!w.has_keepalive());
        assert!(w.wants_receive());
        assert!(!w.wants_send());
        assert_eq!(w.dashboard_version(), None);
        // memory is retained
        assert!(w.post_payload.is_empty());
        assert_eq!(w.post_payload.capacity(), payload_cap);
        assert_eq!(
            g.requests_completed
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn request_done_without_url_logs_nothing() {
        let g = GlobalStats::new();
        let mut w = WebClient::new(1);
        w.request_done(&g);
        assert_eq!(
            g.requests_completed
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn reuse_bumps_use_count_and_clears_identity() {
        let mut w = WebClient::new(1);
        w.client_ip = "10.0.0.1".to_string();
        w.ofd = 33;
        w.mode = Mode::Post;
        w.reuse();
        assert_eq!(w.use_count, 2);
        assert_eq!(w.ofd, -1);
        assert!(w.client_ip.is_empty());
        assert_eq!(w.mode, Mode::Get);
        assert!(w.wants_receive());
    }

    #[test]
    fn timeout_expiry_produces_504() {
        let mut w = WebClient::new(1);
        w.timeout_checkpoint_set(0);
        assert!(!w.timeout_checkpoint_and_check());

        // a 1µs deadline set in the past has always expired
        w.timings.timeout_ut = 1;
        w.timings.tv_in = Some(Instant::now() - std::time::Duration::from_millis(10));
        assert!(w.timeout_checkpoint_and_check());
        assert_eq!(w.response.code, crate::http::HTTP_RESP_GATEWAY_TIMEOUT);
        assert_eq!(w.response.data.as_str(), "Query timeout exceeded");
    }

    #[test]
    fn dashboard_version_flags() {
        let mut w = WebClient::new(1);
        assert_eq!(w.dashboard_version(), None);
        w.flags.insert(ClientFlags::PATH_IS_V1);
        assert_eq!(w.dashboard_version(), Some(1));
        assert!(w.flags.intersects(ClientFlags::PATH_WITH_VERSION));
        w.reset_path_flags();
        assert_eq!(w.dashboard_version(), None);
    }
}
