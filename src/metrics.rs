use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Per-worker counters, one cache line each to avoid false sharing
/// between worker threads.
#[repr(C, align(64))]
pub struct WorkerMetrics {
    pub req_count: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub bytes_received: AtomicUsize,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            bytes_received: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide request accounting, updated once per completed
/// request from `request_done`.
#[derive(Default)]
pub struct GlobalStats {
    pub requests_completed: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub content_bytes: AtomicU64,
    pub compressed_bytes: AtomicU64,
    /// Bytes currently held by client buffers, for memory accounting.
    pub client_memory: AtomicU64,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_completed(&self, received: u64, sent: u64, size: u64, compressed: u64) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.content_bytes.fetch_add(size, Ordering::Relaxed);
        self.compressed_bytes.fetch_add(compressed, Ordering::Relaxed);
    }
}
