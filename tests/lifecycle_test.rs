//! Engine lifecycle tests over socketpair-backed fds: no live server,
//! no sleeps, every step driven explicitly the way a readiness driver
//! would.

use std::fs;
use std::io::Read;
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;
use vitals_web::client::{ClientFlags, InputSource};
use vitals_web::transfer::IoOutcome;
use vitals_web::{Engine, Mode, WebClient, WebConfig, process_request};

fn socketpair() -> (i32, i32) {
    let mut fds = [0 as libc::c_int; 2];
    let r = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(r, 0);
    (fds[0], fds[1])
}

fn close(fd: i32) {
    unsafe {
        libc::close(fd);
    }
}

fn peer_write(fd: i32, bytes: &[u8]) {
    let n = unsafe { libc::send(fd, bytes.as_ptr() as *const _, bytes.len(), 0) };
    assert_eq!(n as usize, bytes.len());
}

fn peer_drain(fd: i32, into: &mut Vec<u8>) -> bool {
    let mut buf = [0u8; 65536];
    let mut got = false;
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut _, buf.len(), libc::MSG_DONTWAIT) };
        if n > 0 {
            into.extend_from_slice(&buf[..n as usize]);
            got = true;
        } else {
            break;
        }
    }
    got
}

fn new_client(engine_fd: i32) -> WebClient {
    let mut w = WebClient::new(1);
    w.ofd = engine_fd;
    w.client_ip = "local".to_string();
    w.client_port = "0".to_string();
    // unix sockets cannot be corked
    w.flags.remove(ClientFlags::CORKABLE);
    w
}

/// Pump the client until it makes no more progress, collecting
/// everything it writes to the socket.
fn drive(w: &mut WebClient, engine: &Engine, peer: i32) -> Vec<u8> {
    let mut response = Vec::new();

    loop {
        let mut progressed = false;

        while !w.is_dead()
            && w.mode == Mode::FileCopy
            && w.wants_receive()
            && matches!(w.source, InputSource::File(_))
        {
            match w.read_file() {
                IoOutcome::Progress(n) if n > 0 => progressed = true,
                _ => break,
            }
        }

        if w.wants_send() && !w.is_dead() && w.send(engine) > 0 {
            progressed = true;
        }

        if peer_drain(peer, &mut response) {
            progressed = true;
        }

        if !progressed {
            break;
        }
    }

    response
}

fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let pos = raw
        .windows(4)
        .position(|win| win == b"\r\n\r\n")
        .expect("no header terminator in response");
    (
        String::from_utf8_lossy(&raw[..pos + 4]).into_owned(),
        raw[pos + 4..].to_vec(),
    )
}

fn decode_chunked(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = body
            .windows(2)
            .position(|win| win == b"\r\n")
            .expect("chunk size line");
        let size = usize::from_str_radix(
            std::str::from_utf8(&body[..line_end]).unwrap().trim(),
            16,
        )
        .unwrap();
        body = &body[line_end + 2..];
        if size == 0 {
            break;
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size..];
        assert_eq!(&body[..2], b"\r\n");
        body = &body[2..];
    }
    out
}

fn webroot() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("index.html"), "<html>dashboard</html>").unwrap();
    dir
}

fn engine_for(dir: &tempfile::TempDir) -> Engine {
    Engine::new(WebConfig {
        web_dir: dir.path().to_path_buf(),
        ..Default::default()
    })
}

#[test]
fn serves_index_html_from_webroot() {
    let dir = webroot();
    let engine = engine_for(&dir);
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(peer, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(matches!(w.receive(&engine), IoOutcome::Progress(_)));
    process_request(&mut w, &engine);

    let raw = drive(&mut w, &engine, peer);
    let (head, body) = split_response(&raw);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: text/html; charset=utf-8\r\n"));
    assert!(head.contains("Content-Length: 22\r\n"));
    assert!(head.contains("Date: "));
    assert!(head.contains("Expires: "));
    assert_eq!(body, b"<html>dashboard</html>");

    // no keep-alive was negotiated: the client is gone
    assert!(w.is_dead());

    close(efd);
    close(peer);
}

#[test]
fn api_handler_receives_path_remainder() {
    let dir = webroot();
    let engine = engine_for(&dir).with_api_v1(Arc::new(|host, w, rest| {
        w.response.data.flush();
        w.response.data.push_str("host=");
        w.response.data.push_str(&host.hostname);
        w.response.data.push_str(" rest=");
        w.response.data.push_str(rest);
        200
    }));
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(peer, b"GET /api/v1/info HTTP/1.1\r\nHost: h\r\n\r\n");
    w.receive(&engine);
    process_request(&mut w, &engine);

    let raw = drive(&mut w, &engine, peer);
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"host=localhost rest=info");

    close(efd);
    close(peer);
}

#[test]
fn path_traversal_is_rejected() {
    let dir = webroot();
    let engine = engine_for(&dir);
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(peer, b"GET /foo/../etc/passwd HTTP/1.1\r\n\r\n");
    w.receive(&engine);
    process_request(&mut w, &engine);

    let raw = drive(&mut w, &engine, peer);
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(
        String::from_utf8_lossy(&body).contains("Relative filenames are not supported")
    );

    close(efd);
    close(peer);
}

#[test]
fn multiple_dashboard_versions_are_rejected() {
    let dir = webroot();
    let engine = engine_for(&dir);
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(peer, b"GET /v1/v2/index.html HTTP/1.1\r\n\r\n");
    w.receive(&engine);
    process_request(&mut w, &engine);

    let raw = drive(&mut w, &engine, peer);
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(body, b"Multiple dashboard versions given at the URL.");

    close(efd);
    close(peer);
}

#[test]
fn post_payload_assembled_across_two_reads() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();

    let dir = webroot();
    let engine = engine_for(&dir).with_api_v2(Arc::new(move |_, w, _| {
        seen_in_handler.lock().unwrap().extend_from_slice(&w.post_payload);
        w.response.data.flush();
        w.response.data.push_str("stored");
        200
    }));
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(
        peer,
        b"POST /api/v2/data HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel",
    );
    w.receive(&engine);
    process_request(&mut w, &engine);
    // incomplete: nothing was sent, no response code yet
    assert_eq!(w.response.code, 0);
    assert!(w.wants_receive());

    peer_write(peer, b"lo");
    w.receive(&engine);
    process_request(&mut w, &engine);

    let raw = drive(&mut w, &engine, peer);
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"stored");
    assert_eq!(seen.lock().unwrap().as_slice(), b"hello");

    close(efd);
    close(peer);
}

#[test]
fn large_file_streams_as_chunked_gzip_and_keeps_alive() {
    let dir = webroot();
    let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(dir.path().join("large.bin"), &content).unwrap();

    let engine = engine_for(&dir);
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(
        peer,
        b"GET /large.bin HTTP/1.1\r\nAccept-Encoding: gzip\r\nConnection: keep-alive\r\n\r\n",
    );
    w.receive(&engine);
    process_request(&mut w, &engine);
    assert_eq!(w.mode, Mode::FileCopy);

    let raw = drive(&mut w, &engine, peer);
    let (head, body) = split_response(&raw);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Encoding: gzip\r\n"));
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert!(!head.contains("Content-Length:"));

    let compressed = decode_chunked(&body);
    let mut decompressed = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut decompressed)
        .unwrap();
    assert_eq!(decompressed, content);

    // keep-alive honoured: the client was reset for the next request
    assert!(!w.is_dead());
    assert!(w.wants_receive());
    assert!(!w.wants_send());
    assert_eq!(w.mode, Mode::Get);
    assert_eq!(w.response.code, 0);
    assert!(w.url_as_received.is_empty());
    assert!(w.response.data.is_empty());
    assert!(w.post_payload.is_empty());

    close(efd);
    close(peer);
}

#[test]
fn unsupported_method_gets_400_and_close() {
    let dir = webroot();
    let engine = engine_for(&dir);
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(peer, b"BREW /coffee HTTP/1.1\r\n\r\n");
    w.receive(&engine);
    process_request(&mut w, &engine);

    let raw = drive(&mut w, &engine, peer);
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(String::from_utf8_lossy(&body).contains("not supported"));
    assert!(w.is_dead());

    close(efd);
    close(peer);
}

#[test]
fn oversized_request_is_answered_with_400() {
    let dir = webroot();
    let engine = Engine::new(WebConfig {
        web_dir: dir.path().to_path_buf(),
        request_initial_size: 64,
        request_max_size: 128,
        ..Default::default()
    });
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    // an incomplete request that keeps growing past the cap
    let padding = "x".repeat(300);
    let req = format!("GET /{padding} HTTP");
    peer_write(peer, req.as_bytes());
    while matches!(w.receive(&engine), IoOutcome::Progress(n) if n > 0) {}
    process_request(&mut w, &engine);

    let raw = drive(&mut w, &engine, peer);
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(String::from_utf8_lossy(&body).contains("too big"));
    assert_eq!(w.url_as_received.as_str(), "too big request");

    close(efd);
    close(peer);
}

#[test]
fn request_exactly_at_max_size_is_accepted() {
    let dir = webroot();

    // craft a complete request that lands exactly on the cap
    let skeleton = "GET / HTTP/1.1\r\nX-Pad: \r\n\r\n";
    let max = 256usize;
    let pad = "p".repeat(max - skeleton.len());
    let req = format!("GET / HTTP/1.1\r\nX-Pad: {pad}\r\n\r\n");
    assert_eq!(req.len(), max);

    let engine = Engine::new(WebConfig {
        web_dir: dir.path().to_path_buf(),
        request_initial_size: 64,
        request_max_size: max,
        ..Default::default()
    });
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(peer, req.as_bytes());
    while matches!(w.receive(&engine), IoOutcome::Progress(n) if n > 0) {}
    process_request(&mut w, &engine);

    let raw = drive(&mut w, &engine, peer);
    let (head, _) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));

    close(efd);
    close(peer);
}

#[test]
fn options_preflight_short_circuits() {
    let dir = webroot();
    let engine = engine_for(&dir);
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(peer, b"OPTIONS /api/v1/data HTTP/1.1\r\nOrigin: http://x\r\n\r\n");
    w.receive(&engine);
    process_request(&mut w, &engine);

    let raw = drive(&mut w, &engine, peer);
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Access-Control-Allow-Methods: GET, OPTIONS\r\n"));
    assert!(head.contains("Access-Control-Allow-Origin: http://x\r\n"));
    assert_eq!(body, b"OK");

    close(efd);
    close(peer);
}

#[test]
fn slow_client_is_cut_off_after_retry_limit() {
    let dir = webroot();
    let engine = Engine::new(WebConfig {
        web_dir: dir.path().to_path_buf(),
        max_header_fetch_tries: 3,
        ..Default::default()
    });
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(peer, b"GET / HTTP/1.1\r\nHos");
    w.receive(&engine);

    // the driver keeps asking; the validator eventually gives up and
    // disarms receive-wait
    let mut responded = false;
    for _ in 0..5 {
        process_request(&mut w, &engine);
        if w.response.code != 0 {
            responded = true;
            break;
        }
    }
    assert!(responded);

    let raw = drive(&mut w, &engine, peer);
    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(String::from_utf8_lossy(&body).contains("Too many retries"));

    close(efd);
    close(peer);
}

#[test]
fn dir_without_trailing_slash_redirects_relative() {
    let dir = webroot();
    fs::create_dir(dir.path().join("assets")).unwrap();
    fs::write(dir.path().join("assets/index.html"), "<html>a</html>").unwrap();

    let engine = engine_for(&dir);
    let (efd, peer) = socketpair();
    let mut w = new_client(efd);

    peer_write(peer, b"GET /assets?theme=dark HTTP/1.1\r\n\r\n");
    w.receive(&engine);
    process_request(&mut w, &engine);

    let raw = drive(&mut w, &engine, peer);
    let (head, _) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
    assert!(head.contains("Location: assets/?theme=dark\r\n"));

    close(efd);
    close(peer);
}
