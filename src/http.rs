// HTTP protocol constants shared across the engine.

pub const HTTP_RESP_OK: u16 = 200;
pub const HTTP_RESP_MOVED_PERM: u16 = 301;
pub const HTTP_RESP_REDIR_TEMP: u16 = 307;
// Internal sentinel: the header builder rewrites it to a 301 pointing
// at the https:// flavour of the same URL.
pub const HTTP_RESP_HTTPS_UPGRADE: u16 = 399;
pub const HTTP_RESP_BAD_REQUEST: u16 = 400;
pub const HTTP_RESP_FORBIDDEN: u16 = 403;
pub const HTTP_RESP_NOT_FOUND: u16 = 404;
pub const HTTP_RESP_PRECOND_FAIL: u16 = 412;
pub const HTTP_RESP_INTERNAL_SERVER_ERROR: u16 = 500;
pub const HTTP_RESP_GATEWAY_TIMEOUT: u16 = 504;

/// What the client asked us to do. `FileCopy` is not a wire method:
/// the static-file responder switches a GET into it once an input
/// file has been opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Options,
    Stream,
    FileCopy,
}

impl Mode {
    /// The mode tag used by the access log.
    pub fn as_log_str(self) -> &'static str {
        match self {
            Mode::FileCopy => "FILECOPY",
            Mode::Options => "OPTIONS",
            Mode::Stream => "STREAM",
            Mode::Get | Mode::Post | Mode::Put | Mode::Delete => "DATA",
        }
    }

    /// Body-carrying request methods must announce a Content-Length.
    pub fn expects_body(self) -> bool {
        matches!(self, Mode::Post | Mode::Put)
    }
}

pub fn response_code_to_string(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",

        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",

        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",

        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        429 => "Too Many Requests",
        499 => "Client Closed Request",

        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",

        _ => {
            if (100..200).contains(&code) {
                "Informational"
            } else if (200..300).contains(&code) {
                "Successful"
            } else if (300..400).contains(&code) {
                "Redirection"
            } else if (400..500).contains(&code) {
                "Client Error"
            } else if (500..600).contains(&code) {
                "Server Error"
            } else {
                "Undefined Error"
            }
        }
    }
}

/// Replace control characters with spaces, for log lines that embed
/// client-supplied URLs.
pub fn strip_control_characters(url: &str) -> String {
    url.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Minimal HTML escaping for client-supplied strings echoed into
/// error bodies.
pub fn html_escape(dst: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '&' => dst.push_str("&amp;"),
            '<' => dst.push_str("&lt;"),
            '>' => dst.push_str("&gt;"),
            '"' => dst.push_str("&quot;"),
            '\'' => dst.push_str("&#39;"),
            _ => dst.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_strings() {
        assert_eq!(response_code_to_string(200), "OK");
        assert_eq!(response_code_to_string(301), "Moved Permanently");
        assert_eq!(response_code_to_string(504), "Gateway Timeout");
        assert_eq!(response_code_to_string(418), "Client Error");
        assert_eq!(response_code_to_string(299), "Successful");
        assert_eq!(response_code_to_string(700), "Undefined Error");
    }

    #[test]
    fn control_characters_become_spaces() {
        assert_eq!(strip_control_characters("/a\rb\nc"), "/a b c");
        assert_eq!(strip_control_characters("/plain"), "/plain");
    }

    #[test]
    fn html_escaping() {
        let mut s = String::new();
        html_escape(&mut s, "<script>&'\"");
        assert_eq!(s, "&lt;script&gt;&amp;&#39;&quot;");
    }

    #[test]
    fn mode_log_tags() {
        assert_eq!(Mode::Get.as_log_str(), "DATA");
        assert_eq!(Mode::FileCopy.as_log_str(), "FILECOPY");
        assert_eq!(Mode::Stream.as_log_str(), "STREAM");
        assert!(Mode::Post.expects_body());
        assert!(!Mode::Get.expects_body());
    }
}
