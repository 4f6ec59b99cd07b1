use std::fmt::Write;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::client::{ClientFlags, WebClient};
use crate::config::WebConfig;
use crate::http::{HTTP_RESP_HTTPS_UPGRADE, HTTP_RESP_MOVED_PERM, HTTP_RESP_OK, response_code_to_string};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

fn http_date(unix_secs: i64) -> String {
    let t = UNIX_EPOCH + Duration::from_secs(unix_secs.max(0) as u64);
    httpdate::fmt_http_date(t)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl WebClient {
    /// Compose the full response head into `response.header_output`,
    /// as a pure function of the client state.
    pub fn build_http_header(&mut self, cfg: &WebConfig) {
        if self.response.code != HTTP_RESP_OK {
            self.response.data.mark_no_cacheable();
        }

        if self.response.data.date == 0 {
            self.response.data.date = now_unix();
        }

        // a proper expiration date, if none was set by the responder
        if self.response.data.expires == 0 {
            self.response.data.expires = self.response.data.date
                + if self.response.data.no_cacheable { 0 } else { 86400 };
        }

        let content_type = self.response.data.content_type.as_str();
        let code_msg = response_code_to_string(self.response.code);
        let date = http_date(self.response.data.date);
        let edate = http_date(self.response.data.expires);

        let out = &mut self.response.header_output;
        out.flush();

        if self.response.code == HTTP_RESP_HTTPS_UPGRADE {
            let _ = write!(
                out,
                "HTTP/1.1 {} {}\r\nLocation: https://{}{}\r\n",
                self.response.code,
                code_msg,
                self.server_host.as_deref().unwrap_or(""),
                self.url_as_received.as_str(),
            );
            self.response.code = HTTP_RESP_MOVED_PERM;
        }
        else {
            let _ = write!(
                out,
                "HTTP/1.1 {} {}\r\n\
                 Connection: {}\r\n\
                 Server: vitals Embedded HTTP Server v{}\r\n\
                 Access-Control-Allow-Origin: {}\r\n\
                 Access-Control-Allow-Credentials: true\r\n\
                 Content-Type: {}\r\n\
                 Date: {}\r\n",
                self.response.code,
                code_msg,
                if self.flags.contains(ClientFlags::KEEPALIVE) {
                    "keep-alive"
                } else {
                    "close"
                },
                SERVER_VERSION,
                self.origin.as_deref().unwrap_or("*"),
                content_type,
                date,
            );
        }

        let out = &mut self.response.header_output;

        if let Some(xfo) = cfg.x_frame_options.as_deref() {
            let _ = write!(out, "X-Frame-Options: {}\r\n", xfo);
        }

        if cfg.respect_dnt {
            if self.response.has_cookies || self.flags.contains(ClientFlags::TRACKING_REQUIRED) {
                out.push_str("Tk: T;cookies\r\n");
            } else {
                out.push_str("Tk: N\r\n");
            }
        }

        if self.mode == crate::http::Mode::Options {
            out.push_str(
                "Access-Control-Allow-Methods: GET, OPTIONS\r\n\
                 Access-Control-Allow-Headers: accept, x-requested-with, origin, content-type, \
                 cookie, pragma, cache-control, x-auth-token\r\n\
                 Access-Control-Max-Age: 1209600\r\n",
            );
        }
        else {
            let _ = write!(
                out,
                "Cache-Control: {}\r\nExpires: {}\r\n",
                if self.response.data.no_cacheable {
                    "no-cache, no-store, must-revalidate\r\nPragma: no-cache"
                } else {
                    "public"
                },
                edate,
            );
        }

        // a possibly available custom header (Location: and friends)
        if !self.response.header.is_empty() {
            let custom = self.response.header.as_str().into_owned();
            self.response.header_output.push_str(&custom);
        }

        // headers related to the transfer method
        if self.response.zoutput {
            self.response
                .header_output
                .push_str("Content-Encoding: gzip\r\n");
        }

        if self.flags.contains(ClientFlags::CHUNKED_TRANSFER) {
            self.response
                .header_output
                .push_str("Transfer-Encoding: chunked\r\n");
        }
        else if self.response.data.len() > 0 || self.response.rlen > 0 {
            // we know the content length, put it
            let length = if self.response.data.len() > 0 {
                self.response.data.len()
            } else {
                self.response.rlen
            };
            let out = &mut self.response.header_output;
            let _ = write!(out, "Content-Length: {}\r\n", length);
        }
        else {
            // we don't know the content length, disable keep-alive
            self.flags.remove(ClientFlags::KEEPALIVE);
        }

        self.response.header_output.push_str("\r\n");
    }
}
