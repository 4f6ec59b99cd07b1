use crate::client::{ClientFlags, WebClient};
use crate::config::WebConfig;
use crate::http::Mode;
use crate::url;

/// Verdict of one validation pass over the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpValidation {
    Ok,
    Incomplete,
    MalformedUrl,
    ExcessRequestData,
    TooManyReadRetries,
    NotSupported,
    /// Plain-HTTP request on a TLS-enabled port: answer with the
    /// https upgrade instead of processing it.
    Redirect,
}

/// Incremental request validation over the bytes accumulated in the
/// response data buffer. Called after every successful receive; keeps
/// its scan position across calls so the already-examined prefix is
/// never rescanned.
pub fn http_request_validate(w: &mut WebClient, cfg: &WebConfig) -> HttpValidation {
    // the buffer is moved out for the duration of the pass so header
    // effects can mutate the client while we hold slices into it
    let data = std::mem::take(&mut w.response.data);
    let verdict = validate_inner(w, data.as_bytes(), cfg);
    w.response.data = data;
    verdict
}

fn validate_inner(w: &mut WebClient, data: &[u8], cfg: &WebConfig) -> HttpValidation {
    let last_size = w.header_parse_last_size;
    w.header_parse_tries += 1;
    w.header_parse_last_size = data.len();

    let resume_at = if w.header_parse_tries > 1 {
        // allow re-finding a \r\n\r\n that straddles the last read
        let mut pos = last_size.saturating_sub(4);
        if data.len() < pos {
            pos = 0;
        }
        pos
    } else {
        0
    };

    let probe = url::is_request_complete(data, resume_at, url::sniff_mode(data));

    if w.header_parse_tries > 1 && !probe.complete {
        if w.header_parse_tries > cfg.max_header_fetch_tries {
            tracing::info!(
                "Disabling slow client after {} attempts to read the request ({} bytes received)",
                w.header_parse_tries,
                data.len()
            );
            w.header_parse_tries = 0;
            w.header_parse_last_size = 0;
            w.disable_wait_receive();
            return HttpValidation::TooManyReadRetries;
        }

        w.enable_wait_receive();
        return HttpValidation::Incomplete;
    }

    let Some(target_start) = valid_method(w, data, cfg) else {
        w.header_parse_tries = 0;
        w.header_parse_last_size = 0;
        w.disable_wait_receive();
        return HttpValidation::NotSupported;
    };

    if !probe.complete {
        w.enable_wait_receive();
        return HttpValidation::Incomplete;
    }

    // the request target ends at the literal " HTTP/"
    let Some(target_end) = url::find_protocol(data, target_start) else {
        w.enable_wait_receive();
        return HttpValidation::Incomplete;
    };

    if target_end == target_start {
        w.header_parse_tries = 0;
        w.header_parse_last_size = 0;
        w.disable_wait_receive();
        return HttpValidation::MalformedUrl;
    }

    let Some(headers_end) = probe.headers_end else {
        w.enable_wait_receive();
        return HttpValidation::Incomplete;
    };

    if !w.mode.expects_body() && data.len() > headers_end {
        w.header_parse_tries = 0;
        w.header_parse_last_size = 0;
        w.disable_wait_receive();
        return HttpValidation::ExcessRequestData;
    }

    parse_header_lines(w, data, target_end, headers_end, cfg);

    let encoded = String::from_utf8_lossy(&data[target_start..target_end]);
    decode_path_and_query_string(w, &encoded, cfg);

    if let Some((start, end)) = probe.body {
        w.post_payload.clear();
        w.post_payload.extend_from_slice(&data[start..end]);
    }

    w.header_parse_tries = 0;
    w.header_parse_last_size = 0;
    w.disable_wait_receive();

    if !w.is_unix_socket()
        && cfg.tls_policy.wants_tls()
        && !w.is_tls()
        && w.mode != Mode::Stream
    {
        return HttpValidation::Redirect;
    }

    HttpValidation::Ok
}

/// Match the request method token. Only the six methods of the wire
/// protocol are accepted; everything else invalidates the request
/// without waiting for more bytes. Returns the offset of the request
/// target.
fn valid_method(w: &mut WebClient, data: &[u8], cfg: &WebConfig) -> Option<usize> {
    if data.starts_with(b"GET ") {
        w.mode = Mode::Get;
        Some(4)
    }
    else if data.starts_with(b"OPTIONS ") {
        w.mode = Mode::Options;
        Some(8)
    }
    else if data.starts_with(b"POST ") {
        w.mode = Mode::Post;
        Some(5)
    }
    else if data.starts_with(b"PUT ") {
        w.mode = Mode::Put;
        Some(4)
    }
    else if data.starts_with(b"DELETE ") {
        w.mode = Mode::Delete;
        Some(7)
    }
    else if data.starts_with(b"STREAM ") {
        w.mode = Mode::Stream;

        if !w.is_tls() && cfg.tls_policy == crate::config::TlsPolicy::Force {
            let hostname = stream_hostname(&data[7..]);
            tracing::error!(
                "The server is configured to always use encrypted connections, \
                 please enable TLS on the child with hostname '{}'.",
                hostname
            );
            w.header_parse_tries = 0;
            w.header_parse_last_size = 0;
            w.disable_wait_receive();
            return None;
        }

        Some(7)
    }
    else {
        None
    }
}

/// Pull the `hostname=` value out of a STREAM query string, for the
/// refusal diagnostic only.
fn stream_hostname(target: &[u8]) -> String {
    let s = String::from_utf8_lossy(target);
    if let Some(pos) = s.find("hostname=") {
        let v = &s[pos + 9..];
        let mut end = v.find('&').unwrap_or(v.len()).min(255);
        while !v.is_char_boundary(end) {
            end -= 1;
        }
        if end > 0 {
            return v[..end].to_string();
        }
    }
    "not available".to_string()
}

fn parse_header_lines(
    w: &mut WebClient,
    data: &[u8],
    request_line_from: usize,
    headers_end: usize,
    cfg: &WebConfig,
) {
    // skip the rest of the request line
    let Some(first_crlf) = memchr::memmem::find(&data[request_line_from..headers_end], b"\r\n")
    else {
        return;
    };

    let region = &data[request_line_from + first_crlf + 2..headers_end];
    for line in region.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let line = String::from_utf8_lossy(line);
        http_header_parse(w, &line, w.mode == Mode::Stream, cfg);
    }
}

fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|win| win.eq_ignore_ascii_case(needle.as_bytes()))
}

fn clamp_host(v: &str) -> String {
    let mut end = v.len().min(255);
    while !v.is_char_boundary(end) {
        end -= 1;
    }
    v[..end].to_string()
}

/// Apply one header line to the client state. Unknown headers are
/// ignored.
fn http_header_parse(w: &mut WebClient, line: &str, parse_useragent: bool, cfg: &WebConfig) {
    let Some((name, value)) = line.split_once(':') else {
        return;
    };
    let value = value.trim_start_matches(' ');

    if name.eq_ignore_ascii_case("Origin") {
        w.origin = Some(value.to_string());
    }
    else if name.eq_ignore_ascii_case("Connection") {
        if contains_ignore_ascii_case(value, "keep-alive") {
            w.flags.insert(ClientFlags::KEEPALIVE);
        }
    }
    else if cfg.respect_dnt && name.eq_ignore_ascii_case("DNT") {
        if value.starts_with('0') {
            w.flags.remove(ClientFlags::DONOTTRACK);
        } else if value.starts_with('1') {
            w.flags.insert(ClientFlags::DONOTTRACK);
        }
    }
    else if parse_useragent && name.eq_ignore_ascii_case("User-Agent") {
        w.user_agent = Some(value.to_string());
    }
    else if name.eq_ignore_ascii_case("X-Auth-Token") {
        w.auth_bearer_token = Some(value.to_string());
    }
    else if name.eq_ignore_ascii_case("Host") {
        w.server_host = Some(clamp_host(value));
    }
    else if name.eq_ignore_ascii_case("Accept-Encoding") {
        if cfg.enable_gzip && contains_ignore_ascii_case(value, "gzip") {
            w.enable_deflate(cfg);
        }
    }
    else if name.eq_ignore_ascii_case("X-Forwarded-Host") {
        w.forwarded_host = Some(clamp_host(value));
    }
}

/// Decode the request target into the path and query-string buffers.
/// In STREAM mode the whole decoded target is the query string.
pub fn decode_path_and_query_string(w: &mut WebClient, path_and_query_string: &str, cfg: &WebConfig) {
    w.url_path_decoded.flush();
    w.url_query_string_decoded.flush();

    if w.url_as_received.is_empty() {
        w.url_as_received.push_str(path_and_query_string);
    }

    let decoded = url::url_decode(path_and_query_string, cfg.request_max_size);

    if w.mode == Mode::Stream {
        w.url_query_string_decoded.push_str(&decoded);
    } else {
        let (path, query) = url::split_path_and_query(&decoded);
        w.url_query_string_decoded.push_str(query);
        w.url_path_decoded.push_str(path);
    }
}
