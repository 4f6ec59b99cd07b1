use memchr::memmem;

use crate::http::Mode;

#[inline]
fn from_hex(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Percent-decode a request target into a bounded destination.
///
/// `+` decodes to space. Decoded control characters are replaced with
/// spaces so they cannot reach response headers. A `%` without two
/// hex digits behind it is dropped.
pub fn url_decode(url: &str, max: usize) -> String {
    let src = url.as_bytes();
    let mut out = Vec::with_capacity(src.len().min(max));
    let mut i = 0;

    while i < src.len() && out.len() < max {
        match src[i] {
            b'%' => {
                if i + 2 < src.len()
                    && let (Some(hi), Some(lo)) = (from_hex(src[i + 1]), from_hex(src[i + 2]))
                {
                    let t = (hi << 4) | lo;
                    out.push(if t < 0x20 || t == 0x7f { b' ' } else { t });
                    i += 2;
                }
            }
            b'+' => out.push(b' '),
            c => out.push(c),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Split a decoded request target at the first `?`. The query string
/// keeps its leading `?`; everything after it is one opaque string, so
/// a literal `&` inside an individual parameter value cannot be
/// represented.
pub fn split_path_and_query(decoded: &str) -> (&str, &str) {
    match decoded.find('?') {
        Some(idx) => (&decoded[..idx], &decoded[idx..]),
        None => (decoded, ""),
    }
}

/// Locate the ` HTTP/` marker that terminates the request target.
/// Returns the byte offset of the space, searching from `from`.
pub fn find_protocol(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    memmem::find(&buf[from..], b" HTTP/").map(|p| from + p)
}

/// Result of probing the receive buffer for a complete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestProbe {
    pub complete: bool,
    /// Offset one past the `\r\n\r\n` terminator, when found.
    pub headers_end: Option<usize>,
    /// Body bytes `[start, end)` for POST/PUT, once fully received.
    pub body: Option<(usize, usize)>,
}

/// Scan for the end-of-headers sequence, resuming at `resume_at` so
/// the already-examined prefix is never rescanned. For body-carrying
/// methods the request is complete only once the announced
/// `Content-Length` has fully arrived; without a `Content-Length`
/// such a request never completes. Body-carrying methods always scan
/// from the start: their terminator is usually behind the resume
/// point while the body trickles in.
pub fn is_request_complete(buf: &[u8], resume_at: usize, mode: Mode) -> RequestProbe {
    let incomplete = RequestProbe {
        complete: false,
        headers_end: None,
        body: None,
    };

    if buf.len() < 4 {
        return incomplete;
    }

    let start = if mode.expects_body() {
        0
    } else {
        resume_at.min(buf.len())
    };
    let Some(pos) = memmem::find(&buf[start..], b"\r\n\r\n") else {
        return incomplete;
    };
    let headers_end = start + pos + 4;

    if !mode.expects_body() {
        return RequestProbe {
            complete: true,
            headers_end: Some(headers_end),
            body: None,
        };
    }

    let Some(content_length) = content_length(&buf[..headers_end]) else {
        return RequestProbe {
            complete: false,
            headers_end: Some(headers_end),
            body: None,
        };
    };

    if buf.len() - headers_end >= content_length {
        RequestProbe {
            complete: true,
            headers_end: Some(headers_end),
            body: Some((headers_end, headers_end + content_length)),
        }
    }
    else {
        RequestProbe {
            complete: false,
            headers_end: Some(headers_end),
            body: None,
        }
    }
}

fn content_length(headers: &[u8]) -> Option<usize> {
    for line in headers.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() > 15 && line[..15].eq_ignore_ascii_case(b"content-length:") {
            let v = std::str::from_utf8(&line[15..]).ok()?;
            return v.trim().parse::<usize>().ok();
        }
    }
    None
}

/// Peek at the HTTP method without committing to it, used by the
/// incremental probe before the request line has been validated.
pub fn sniff_mode(buf: &[u8]) -> Mode {
    if buf.starts_with(b"POST ") {
        Mode::Post
    }
    else if buf.starts_with(b"PUT ") {
        Mode::Put
    }
    else {
        Mode::Get
    }
}
