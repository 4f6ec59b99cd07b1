use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::client::{ClientFlags, InputSource, WebClient};
use crate::config::WebConfig;
use crate::content_type::ContentType;
use crate::engine::Acl;
use crate::http::{
    HTTP_RESP_BAD_REQUEST, HTTP_RESP_MOVED_PERM, HTTP_RESP_NOT_FOUND, HTTP_RESP_OK,
    HTTP_RESP_REDIR_TEMP, Mode, html_escape,
};
use crate::router::permission_denied;
use crate::syscalls;

fn reply_html(w: &mut WebClient, prefix: &str, echoed: &str, code: u16) -> u16 {
    let mut body = String::from(prefix);
    html_escape(&mut body, echoed);
    w.response.data.flush();
    w.response.data.content_type = ContentType::TextHtml;
    w.response.data.push_str(&body);
    code
}

/// Issue a relative redirect that appends a slash to the last path
/// component of the URL as it was received, preserving the query
/// string. The browser resolves it against the directory it already
/// knows it is in.
pub fn append_slash_to_url_and_redirect(w: &mut WebClient) -> u16 {
    let received = w.url_as_received.as_str().into_owned();

    w.response.header.push_str("Location: ");
    match received.find('?') {
        Some(q) if q > 0 => {
            let path = &received[..q];
            let last = match path.rfind('/') {
                Some(s) => &path[s + 1..],
                None => path,
            };
            w.response.header.push_str(last);
            w.response.header.push_str("/");
            w.response.header.push_str(&received[q..]);
        }
        _ => {
            let last = match received.rfind('/') {
                Some(s) => &received[s + 1..],
                None => received.as_str(),
            };
            w.response.header.push_str(last);
            w.response.header.push_str("/");
        }
    }
    w.response.header.push_str("\r\n");

    w.response.data.flush();
    w.response.data.content_type = ContentType::TextHtml;
    w.response.data.push_str(
        "<!DOCTYPE html><html>\
         <body onload=\"window.location.href = window.location.origin + \
         window.location.pathname + '/' + window.location.search + window.location.hash\">\
         Redirecting. In case your browser does not support redirection, please click \
         <a onclick=\"window.location.href = window.location.origin + \
         window.location.pathname + '/' + window.location.search + window.location.hash\">\
         here</a>.</body></html>",
    );

    HTTP_RESP_MOVED_PERM
}

/// Resolve the on-disk file for a request path, honoring the
/// dashboard-version sub-roots and their fallbacks.
fn find_filename_to_serve(
    web_dir: &Path,
    filename: &str,
    w: &mut WebClient,
) -> Option<(PathBuf, fs::Metadata, bool)> {
    let d_version = w.dashboard_version();
    let has_extension = w.flags.contains(ClientFlags::PATH_HAS_FILE_EXTENSION);

    let mut fallback = 0;
    let mut dst = if has_extension {
        match d_version {
            None => web_dir.join(filename),
            Some(v) => {
                // fall back to the same path without the dashboard
                // version when the versioned one does not exist
                fallback = 1;
                web_dir.join(format!("v{v}")).join(filename)
            }
        }
    } else if let Some(v) = d_version {
        if !filename.is_empty() {
            // fall back to the version root otherwise
            fallback = 2;
            web_dir.join(filename)
        } else {
            web_dir.join(format!("v{v}"))
        }
    } else {
        // serve {filename}/index.html when someone put an html file
        // into a directory, falling back to the web root
        fallback = 3;
        web_dir.join(filename)
    };

    let mut meta = match fs::metadata(&dst) {
        Ok(m) => m,
        Err(_) => match fallback {
            1 => {
                dst = web_dir.join(filename);
                fs::metadata(&dst).ok()?
            }
            2 => {
                if !filename.is_empty() {
                    w.flags.insert(ClientFlags::PATH_HAS_TRAILING_SLASH);
                }
                let v = d_version?;
                dst = web_dir.join(format!("v{v}"));
                fs::metadata(&dst).ok()?
            }
            3 => {
                if !filename.is_empty() {
                    w.flags.insert(ClientFlags::PATH_HAS_TRAILING_SLASH);
                }
                dst = web_dir.to_path_buf();
                fs::metadata(&dst).ok()?
            }
            _ => return None,
        },
    };

    let mut is_dir = false;
    if meta.is_dir() {
        dst = dst.join("index.html");
        meta = fs::metadata(&dst).ok()?;
        is_dir = true;
    }

    Some((dst, meta, is_dir))
}

/// Serve a file from the webroot: validate the path, resolve it on
/// disk, and arm FILECOPY streaming on success.
pub fn sendfile(w: &mut WebClient, cfg: &WebConfig, filename: &str) -> u16 {
    tracing::debug!(
        "{}: looking for file '{}/{}'",
        w.id,
        cfg.web_dir.display(),
        filename
    );

    if !w.acl.contains(Acl::DASHBOARD) {
        return permission_denied(w);
    }

    let filename = filename.trim_start_matches('/');

    // refuse to serve "strange" characters
    if filename
        .bytes()
        .any(|c| !c.is_ascii_alphanumeric() && !matches!(c, b'/' | b'.' | b'-' | b'_'))
    {
        return reply_html(
            w,
            "Filename contains invalid characters: ",
            filename,
            HTTP_RESP_BAD_REQUEST,
        );
    }

    if filename.contains("..") {
        return reply_html(
            w,
            "Relative filenames are not supported: ",
            filename,
            HTTP_RESP_BAD_REQUEST,
        );
    }

    let Some((web_filename, meta, is_dir)) = find_filename_to_serve(&cfg.web_dir, filename, w)
    else {
        return reply_html(
            w,
            "File does not exist, or is not accessible: ",
            filename,
            HTTP_RESP_NOT_FOUND,
        );
    };

    if is_dir && !w.flags.contains(ClientFlags::PATH_HAS_TRAILING_SLASH) {
        return append_slash_to_url_and_redirect(w);
    }

    let fd = match syscalls::open_nonblocking_read(&web_filename) {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::EBUSY) || e.raw_os_error() == Some(libc::EAGAIN) => {
            tracing::error!(
                "{}: file '{}' is busy, sending 307 to force retry",
                w.id,
                web_filename.display()
            );
            w.response.header.push_str("Location: /");
            w.response.header.push_str(filename);
            w.response.header.push_str("\r\n");
            return reply_html(
                w,
                "File is currently busy, please try again later: ",
                &web_filename.display().to_string(),
                HTTP_RESP_REDIR_TEMP,
            );
        }
        Err(_) => {
            tracing::error!("{}: cannot open file '{}'", w.id, web_filename.display());
            return reply_html(
                w,
                "Cannot open file: ",
                &web_filename.display().to_string(),
                HTTP_RESP_NOT_FOUND,
            );
        }
    };

    let size = meta.len() as usize;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    tracing::debug!(
        "{}: sending file '{}' ({} bytes, fd {})",
        w.id,
        web_filename.display(),
        size,
        fd
    );

    w.source = InputSource::File(fd);
    w.mode = Mode::FileCopy;
    w.enable_wait_receive();
    w.disable_wait_send();
    w.response.data.flush();
    w.response.data.need_bytes(size);
    w.response.data.content_type = ContentType::for_filename(&web_filename);
    w.response.rlen = size;
    w.response.data.date = mtime;
    w.response.data.mark_cacheable();

    HTTP_RESP_OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn webroot() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("v2/sub")).unwrap();
        let mut f = fs::File::create(dir.path().join("index.html")).unwrap();
        f.write_all(b"<html>root</html>").unwrap();
        let mut f = fs::File::create(dir.path().join("v2/index.html")).unwrap();
        f.write_all(b"<html>v2</html>").unwrap();
        let mut f = fs::File::create(dir.path().join("v2/app.js")).unwrap();
        f.write_all(b"console.log(2)").unwrap();
        let mut f = fs::File::create(dir.path().join("shared.css")).unwrap();
        f.write_all(b"body{}").unwrap();
        dir
    }

    fn cfg_for(dir: &tempfile::TempDir) -> WebConfig {
        WebConfig {
            web_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn client() -> WebClient {
        WebClient::new(1)
    }

    #[test]
    fn invalid_characters_rejected() {
        let dir = webroot();
        let cfg = cfg_for(&dir);
        let mut w = client();
        let code = sendfile(&mut w, &cfg, "a;b");
        assert_eq!(code, HTTP_RESP_BAD_REQUEST);
        assert!(w.response.data.as_str().contains("invalid characters"));
    }

    #[test]
    fn dotdot_rejected() {
        let dir = webroot();
        let cfg = cfg_for(&dir);
        let mut w = client();
        let code = sendfile(&mut w, &cfg, "foo/../etc/passwd");
        assert_eq!(code, HTTP_RESP_BAD_REQUEST);
        assert!(
            w.response
                .data
                .as_str()
                .contains("Relative filenames are not supported")
        );
    }

    #[test]
    fn missing_file_is_404() {
        let dir = webroot();
        let cfg = cfg_for(&dir);
        let mut w = client();
        assert_eq!(sendfile(&mut w, &cfg, "nope.html"), HTTP_RESP_NOT_FOUND);
    }

    #[test]
    fn plain_file_arms_filecopy() {
        let dir = webroot();
        let cfg = cfg_for(&dir);
        let mut w = client();
        w.flags.insert(ClientFlags::PATH_HAS_FILE_EXTENSION);
        let code = sendfile(&mut w, &cfg, "index.html");
        assert_eq!(code, HTTP_RESP_OK);
        assert_eq!(w.mode, Mode::FileCopy);
        assert_eq!(w.response.rlen, 17);
        assert_eq!(w.response.data.content_type, ContentType::TextHtml);
        assert!(w.wants_receive());
        assert!(!w.wants_send());
        assert!(matches!(w.source, InputSource::File(_)));
        assert!(!w.response.data.no_cacheable);
        assert!(w.response.data.date > 0);
    }

    #[test]
    fn version_root_serves_versioned_index() {
        let dir = webroot();
        let cfg = cfg_for(&dir);
        let mut w = client();
        w.flags
            .insert(ClientFlags::PATH_IS_V2 | ClientFlags::PATH_HAS_TRAILING_SLASH);
        let code = sendfile(&mut w, &cfg, "");
        assert_eq!(code, HTTP_RESP_OK);
        assert_eq!(w.response.rlen, 15); // v2/index.html
    }

    #[test]
    fn versioned_file_with_extension_prefers_version_dir() {
        let dir = webroot();
        let cfg = cfg_for(&dir);
        let mut w = client();
        w.flags
            .insert(ClientFlags::PATH_IS_V2 | ClientFlags::PATH_HAS_FILE_EXTENSION);
        let code = sendfile(&mut w, &cfg, "app.js");
        assert_eq!(code, HTTP_RESP_OK);
        assert_eq!(
            w.response.data.content_type,
            ContentType::ApplicationJavascript
        );
    }

    #[test]
    fn versioned_file_falls_back_to_root() {
        let dir = webroot();
        let cfg = cfg_for(&dir);
        let mut w = client();
        w.flags
            .insert(ClientFlags::PATH_IS_V2 | ClientFlags::PATH_HAS_FILE_EXTENSION);
        // only exists at the webroot, not under v2/
        let code = sendfile(&mut w, &cfg, "shared.css");
        assert_eq!(code, HTTP_RESP_OK);
        assert_eq!(w.response.data.content_type, ContentType::TextCss);
    }

    #[test]
    fn directory_without_trailing_slash_redirects() {
        let dir = webroot();
        let cfg = cfg_for(&dir);
        let mut w = client();
        w.url_as_received.push_str("/v2/sub?x=1");
        fs::write(dir.path().join("v2/sub/index.html"), "<html>s</html>").unwrap();
        let code = sendfile(&mut w, &cfg, "v2/sub");
        assert_eq!(code, HTTP_RESP_MOVED_PERM);
        assert_eq!(w.response.header.as_str(), "Location: sub/?x=1\r\n");
        assert!(w.response.data.as_str().contains("Redirecting"));
    }

    #[test]
    fn directory_with_trailing_slash_serves_index() {
        let dir = webroot();
        let cfg = cfg_for(&dir);
        let mut w = client();
        w.flags.insert(ClientFlags::PATH_HAS_TRAILING_SLASH);
        fs::write(dir.path().join("v2/sub/index.html"), "<html>s</html>").unwrap();
        let code = sendfile(&mut w, &cfg, "v2/sub");
        assert_eq!(code, HTTP_RESP_OK);
        assert_eq!(w.mode, Mode::FileCopy);
    }

    #[test]
    fn denied_without_dashboard_acl() {
        let dir = webroot();
        let cfg = cfg_for(&dir);
        let mut w = client();
        w.acl = Acl::STREAMING;
        assert_eq!(sendfile(&mut w, &cfg, "index.html"), 403);
    }

    #[test]
    fn redirect_without_query_string() {
        let mut w = client();
        w.url_as_received.push_str("/path/to/dir");
        let code = append_slash_to_url_and_redirect(&mut w);
        assert_eq!(code, HTTP_RESP_MOVED_PERM);
        assert_eq!(w.response.header.as_str(), "Location: dir/\r\n");
    }
}
