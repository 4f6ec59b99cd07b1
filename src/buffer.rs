use std::fmt;

use crate::content_type::ContentType;

/// Append-only growable byte buffer with response metadata attached.
///
/// The engine keeps six of these per client and reuses them across
/// keep-alive requests: `flush()` drops the content but keeps the
/// allocation. Content may be binary; `as_str()` is only for places
/// that need a textual view (log lines, header parsing).
#[derive(Debug, Default)]
pub struct WebBuffer {
    buf: Vec<u8>,
    pub content_type: ContentType,
    pub no_cacheable: bool,
    /// Unix seconds for the `Date:` header. 0 means "now".
    pub date: i64,
    /// Unix seconds for the `Expires:` header. 0 means derived.
    pub expires: i64,
}

impl WebBuffer {
    pub fn with_capacity(size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(size),
            ..Default::default()
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Textual view of the content. Invalid UTF-8 is replaced, so
    /// this is safe to call on binary payloads.
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.buf)
    }

    pub fn push_str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn push_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    /// Drop the content, keep the allocation and reset the metadata.
    pub fn flush(&mut self) {
        self.buf.clear();
        self.content_type = ContentType::TextPlain;
        self.no_cacheable = false;
        self.date = 0;
        self.expires = 0;
    }

    /// Ensure at least `n` more bytes fit without reallocation.
    pub fn need_bytes(&mut self, n: usize) {
        self.buf.reserve(n);
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Grow to `len` bytes, zero-filling, so a syscall can read
    /// directly into `&mut self[start..]`. Pair with `truncate()`.
    pub fn resize_for_read(&mut self, len: usize) {
        self.buf.resize(len, 0);
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    #[inline]
    pub fn slice_mut(&mut self, start: usize) -> &mut [u8] {
        &mut self.buf[start..]
    }

    pub fn mark_cacheable(&mut self) {
        self.no_cacheable = false;
    }

    pub fn mark_no_cacheable(&mut self) {
        self.no_cacheable = true;
    }

    /// Replace every NUL byte with a space, in place.
    pub fn replace_nul_with_space(&mut self) {
        for b in self.buf.iter_mut() {
            if *b == 0 {
                *b = b' ';
            }
        }
    }
}

impl fmt::Write for WebBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }
}
