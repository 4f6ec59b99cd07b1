use std::fmt::Write as _;

use crate::client::{ClientFlags, WebClient};
use crate::content_type::ContentType;
use crate::engine::{Acl, Engine};
use crate::files::{append_slash_to_url_and_redirect, sendfile};
use crate::http::{
    HTTP_RESP_BAD_REQUEST, HTTP_RESP_FORBIDDEN, HTTP_RESP_HTTPS_UPGRADE, HTTP_RESP_NOT_FOUND,
    HTTP_RESP_OK, HTTP_RESP_PRECOND_FAIL, Mode, html_escape,
};
use crate::parser::{HttpValidation, http_request_validate};
use crate::registry::{HostHandle, normalize_guid};

pub fn permission_denied(w: &mut WebClient) -> u16 {
    w.response.data.flush();
    w.response.data.push_str("You are not allowed to access this resource.");
    w.response.code = HTTP_RESP_FORBIDDEN;
    HTTP_RESP_FORBIDDEN
}

pub fn bearer_required(w: &mut WebClient) -> u16 {
    w.response.data.flush();
    w.response.data.push_str("An authorization bearer is required to access the resource.");
    w.response.code = HTTP_RESP_PRECOND_FAIL;
    HTTP_RESP_PRECOND_FAIL
}

fn bad_request_multiple_dashboard_versions(w: &mut WebClient) -> u16 {
    w.response.data.flush();
    w.response.data.push_str("Multiple dashboard versions given at the URL.");
    w.response.code = HTTP_RESP_BAD_REQUEST;
    HTTP_RESP_BAD_REQUEST
}

/// Split off the next path segment, skipping consecutive separators.
/// Returns the segment and the remainder behind its separator, when
/// one followed.
fn next_segment(path: &str) -> (Option<&str>, Option<&str>) {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return (None, None);
    }
    match path.find('/') {
        Some(idx) => (Some(&path[..idx]), Some(&path[idx + 1..])),
        None => (Some(path), None),
    }
}

/// `/api/vN/...` version dispatch into the data-API callbacks.
fn api_request(engine: &Engine, host: &HostHandle, w: &mut WebClient, fragment: &str) -> u16 {
    let (tok, remainder) = next_segment(fragment);
    let remainder = remainder.unwrap_or("");

    match tok {
        Some("v2") => (engine.api_v2())(host, w, remainder),
        Some("v1") => (engine.api_v1())(host, w, remainder),
        Some(other) => {
            w.response.data.flush();
            w.response.data.content_type = ContentType::TextHtml;
            let mut body = String::from("Unsupported API version: ");
            html_escape(&mut body, other);
            w.response.data.push_str(&body);
            HTTP_RESP_NOT_FOUND
        }
        None => {
            w.response.data.flush();
            w.response.data.push_str("Which API version?");
            HTTP_RESP_BAD_REQUEST
        }
    }
}

/// `/host/<name>/...` and `/node/<id>/...` switching. Only the base
/// host may switch; the resolution order depends on which alias was
/// used, with a lower-cased GUID retry for case mismatches.
fn switch_host(
    engine: &Engine,
    host: &HostHandle,
    w: &mut WebClient,
    url: &str,
    nodeid: bool,
) -> u16 {
    if !host.is_base {
        w.response.data.flush();
        w.response.data.push_str("Nesting of hosts is not allowed.");
        return HTTP_RESP_BAD_REQUEST;
    }

    let (tok, remainder) = next_segment(url);

    if let Some(tok) = tok.filter(|t| !t.is_empty()) {
        tracing::debug!("{}: searching for host with name '{}'", w.id, tok);

        let registry = engine.registry();
        let mut found = if nodeid {
            registry
                .by_node_id(tok)
                .or_else(|| registry.by_hostname(tok))
                .or_else(|| registry.by_guid(tok))
        } else {
            registry
                .by_hostname(tok)
                .or_else(|| registry.by_guid(tok))
                .or_else(|| registry.by_node_id(tok))
        };

        if found.is_none()
            && let Some(lower) = normalize_guid(tok)
        {
            found = registry.by_guid(&lower);
        }

        if let Some(resolved) = found {
            let Some(remainder) = remainder else {
                return append_slash_to_url_and_redirect(w);
            };

            let mut sub_path = String::with_capacity(remainder.len() + 1);
            sub_path.push('/');
            sub_path.push_str(remainder);

            w.url_path_decoded.flush();
            w.url_path_decoded.push_str(&sub_path);
            return process_url(engine, &resolved, w, &sub_path);
        }
    }

    w.response.data.flush();
    w.response.data.content_type = ContentType::TextHtml;
    let mut body = String::from("This vitals agent does not maintain a database for host: ");
    html_escape(&mut body, tok.unwrap_or(""));
    w.response.data.push_str(&body);
    HTTP_RESP_NOT_FOUND
}

/// First-segment dispatch of a decoded request path, recursing for
/// dashboard-version prefixes and switched hosts. Falls through to
/// the static-file responder.
pub fn process_url(engine: &Engine, host: &HostHandle, w: &mut WebClient, path: &str) -> u16 {
    // keep a copy of the decoded path, in case we serve it as a file
    let filename = path.to_string();

    let (tok, remainder) = next_segment(path);
    let rest = remainder.unwrap_or("");

    if let Some(tok) = tok.filter(|t| !t.is_empty()) {
        tracing::debug!("{}: processing command '{}'", w.id, tok);

        match tok {
            "api" => return check_host_and_call(engine, host, w, rest, api_request),
            "host" => return switch_host(engine, host, w, rest, false),
            "node" => return switch_host(engine, host, w, rest, true),
            "v0" | "v1" | "v2" => {
                if w.flags.intersects(ClientFlags::PATH_WITH_VERSION) {
                    return bad_request_multiple_dashboard_versions(w);
                }
                let flag = match tok {
                    "v0" => ClientFlags::PATH_IS_V0,
                    "v1" => ClientFlags::PATH_IS_V1,
                    _ => ClientFlags::PATH_IS_V2,
                };
                w.flags.insert(flag);
                return process_url(engine, host, w, rest);
            }
            "vitals.conf" => {
                if !w.acl.contains(Acl::AGENT_CONF) {
                    return permission_denied(w);
                }
                tracing::debug!("{}: generating vitals.conf ...", w.id);
                w.response.data.flush();
                w.response.data.content_type = ContentType::TextPlain;
                return engine.render_config(&mut w.response.data);
            }
            #[cfg(feature = "internal-checks")]
            "exit" => {
                if !w.acl.contains(Acl::AGENT_CONF) {
                    return permission_denied(w);
                }
                w.response.data.flush();
                w.response.data.push_str("ok, will do...");
                tracing::error!("web request to exit received");
                std::process::exit(0);
            }
            #[cfg(feature = "internal-checks")]
            "mirror" => {
                if !w.acl.contains(Acl::AGENT_CONF) {
                    return permission_denied(w);
                }
                tracing::debug!("{}: mirroring...", w.id);
                // replace the zero bytes with spaces, then reflect the
                // buffer back as it stands
                w.response.data.replace_nul_with_space();
                return HTTP_RESP_OK;
            }
            _ => {}
        }
    }

    w.response.data.flush();
    sendfile(w, &engine.config, &filename)
}

fn check_host_and_call(
    engine: &Engine,
    host: &HostHandle,
    w: &mut WebClient,
    url: &str,
    func: fn(&Engine, &HostHandle, &mut WebClient, &str) -> u16,
) -> u16 {
    func(engine, host, w, url)
}

const DATA_ACL: Acl = Acl::DASHBOARD
    .union(Acl::REGISTRY)
    .union(Acl::BADGES)
    .union(Acl::MGMT)
    .union(Acl::AGENT_CONF);

/// Drive one complete, validated request through dispatch, response
/// head composition and send-side arming. Invoked by the readiness
/// driver after every receive.
pub fn process_request(w: &mut WebClient, engine: &Engine) {
    let cfg = &engine.config;

    w.timeout_checkpoint_init();
    if cfg.timeout_ms > 0 {
        w.timeout_checkpoint_set(cfg.timeout_ms);
    }

    match http_request_validate(w, cfg) {
        HttpValidation::Ok => match w.mode {
            Mode::Stream => {
                if !w.acl.contains(Acl::STREAMING) {
                    permission_denied(w);
                    return;
                }

                let query = w.url_query_string_decoded.as_str().into_owned();
                w.response.code = (engine.stream_handler())(w, &query);
                return;
            }

            Mode::Options => {
                if !w.acl.intersects(DATA_ACL) {
                    permission_denied(w);
                } else {
                    w.response.data.flush();
                    w.response.data.push_str("OK");
                    w.response.code = HTTP_RESP_OK;
                }
            }

            Mode::FileCopy | Mode::Get | Mode::Post | Mode::Put | Mode::Delete => {
                if !w.acl.intersects(DATA_ACL) {
                    permission_denied(w);
                } else {
                    w.reset_path_flags();

                    let path = w.url_path_decoded.as_str().into_owned();

                    if path.is_empty() || path.ends_with('/') {
                        w.flags.insert(ClientFlags::PATH_HAS_TRAILING_SLASH);
                    }

                    // check if there is a filename extension
                    let last_segment_start =
                        path.rfind('/').map(|i| i + 1).unwrap_or(0);
                    if path[last_segment_start..].contains('.') {
                        w.flags.insert(ClientFlags::PATH_HAS_FILE_EXTENSION);
                    }

                    let base = engine.registry().base_host();
                    w.response.code = process_url(engine, &base, w, &path);
                }
            }
        },

        HttpValidation::Incomplete => {
            if w.response.data.len() > cfg.request_max_size {
                w.url_as_received.flush();
                w.url_as_received.push_str("too big request");

                tracing::debug!(
                    "{}: received request is too big ({} bytes)",
                    w.id,
                    w.response.data.len()
                );

                let len = w.response.data.len();
                w.response.data.flush();
                let _ = write!(
                    w.response.data,
                    "Received request is too big  (received {} bytes, max is {} bytes).\r\n",
                    len, cfg.request_max_size
                );
                w.response.code = HTTP_RESP_BAD_REQUEST;
            } else {
                // wait for more data; fall back to a plain mode so the
                // driver does not enter stream mode early
                if w.mode == Mode::Stream {
                    w.mode = Mode::Get;
                }
                return;
            }
        }

        HttpValidation::Redirect => {
            w.response.data.flush();
            w.response.data.content_type = ContentType::TextHtml;
            w.response.data.push_str(
                "<!DOCTYPE html><html>\
                 <body onload=\"window.location.href ='https://'+ window.location.hostname + \
                 ':' + window.location.port + window.location.pathname + window.location.search\">\
                 Redirecting to safety connection, case your browser does not support redirection, \
                 please click \
                 <a onclick=\"window.location.href ='https://'+ window.location.hostname + ':' \
                  + window.location.port + window.location.pathname + window.location.search\">\
                 here</a>.</body></html>",
            );
            w.response.code = HTTP_RESP_HTTPS_UPGRADE;
        }

        HttpValidation::MalformedUrl => {
            tracing::debug!("{}: malformed URL", w.id);
            w.response.data.flush();
            w.response.data.push_str("Malformed URL...\r\n");
            w.response.code = HTTP_RESP_BAD_REQUEST;
        }

        HttpValidation::ExcessRequestData => {
            tracing::debug!("{}: excess data in request", w.id);
            w.response.data.flush();
            w.response.data.push_str("Excess data in request.\r\n");
            w.response.code = HTTP_RESP_BAD_REQUEST;
        }

        HttpValidation::TooManyReadRetries => {
            tracing::debug!("{}: too many retries to read the request", w.id);
            w.response.data.flush();
            w.response.data.push_str("Too many retries to read request.\r\n");
            w.response.code = HTTP_RESP_BAD_REQUEST;
        }

        HttpValidation::NotSupported => {
            tracing::debug!("{}: HTTP method requested is not supported", w.id);
            w.response.data.flush();
            w.response.data.push_str("HTTP method requested is not supported...\r\n");
            w.response.code = HTTP_RESP_BAD_REQUEST;
        }
    }

    // keep track of the processing time
    w.timeout_checkpoint_response_ready();

    w.response.sent = 0;
    w.build_http_header(&engine.config);
    w.send_http_header();

    // enable sending immediately if we have data
    if w.response.data.len() > 0 {
        w.enable_wait_send();
    } else {
        w.disable_wait_send();
    }

    if w.mode == Mode::FileCopy && w.response.rlen > 0 {
        w.enable_wait_receive();
    }
}
