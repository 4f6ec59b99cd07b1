use libc::c_int;

use crate::client::{ClientFlags, InputSource, WebClient};
use crate::compress::Deflater;
use crate::config::WebConfig;
use crate::engine::Engine;
use crate::http::Mode;
use crate::syscalls::{self, IoAttempt};
use crate::tls::{TlsIo, TlsStream};

/// What one receive attempt did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    Progress(usize),
    Blocked,
    /// The peer closed the connection.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendAttempt {
    Sent(usize),
    Blocked,
    Fatal,
}

/// Write to the socket or the encrypted transport, mapping TLS
/// would-block reasons onto the client's TLS wait flags.
fn send_bytes(
    tls: &mut Option<Box<dyn TlsStream>>,
    flags: &mut ClientFlags,
    ofd: c_int,
    buf: &[u8],
    send_flags: c_int,
) -> SendAttempt {
    if let Some(tls) = tls.as_mut() {
        let io = tls.write(buf);
        apply_tls_wait(flags, &io);
        return match io {
            TlsIo::Done(n) => SendAttempt::Sent(n),
            TlsIo::WantRead | TlsIo::WantWrite => SendAttempt::Blocked,
            TlsIo::Closed | TlsIo::Fatal => SendAttempt::Fatal,
        };
    }

    match syscalls::send_nonblocking(ofd, buf, send_flags) {
        Ok(IoAttempt::Data(n)) => SendAttempt::Sent(n),
        Ok(IoAttempt::WouldBlock) => SendAttempt::Blocked,
        Ok(IoAttempt::Eof) => SendAttempt::Fatal,
        Err(_) => SendAttempt::Fatal,
    }
}

fn apply_tls_wait(flags: &mut ClientFlags, io: &TlsIo) {
    match io {
        TlsIo::WantRead => {
            flags.insert(ClientFlags::TLS_WAIT_RECEIVE);
            flags.remove(ClientFlags::TLS_WAIT_SEND);
        }
        TlsIo::WantWrite => {
            flags.insert(ClientFlags::TLS_WAIT_SEND);
            flags.remove(ClientFlags::TLS_WAIT_RECEIVE);
        }
        _ => {
            flags.remove(ClientFlags::TLS_WAIT_RECEIVE | ClientFlags::TLS_WAIT_SEND);
        }
    }
}

impl WebClient {
    /// Switch the response to gzip chunked encoding. Refused once any
    /// response byte has been handed out, and idempotent per request.
    pub fn enable_deflate(&mut self, cfg: &WebConfig) {
        if self.response.zinitialized {
            tracing::debug!("{}: compression already initialized for this client", self.id);
            return;
        }

        if self.response.sent != 0 {
            tracing::error!(
                "{}: cannot enable compression in the middle of a conversation",
                self.id
            );
            return;
        }

        self.response.zstream = Some(Deflater::new(cfg.gzip_level));
        self.response.zbuffer.clear();
        self.response.zhave = 0;
        self.response.zsent = 0;
        self.response.zoutput = true;
        self.response.zinitialized = true;
        self.flags.insert(ClientFlags::CHUNKED_TRANSFER);
    }

    /// Pull bytes from the connection into the receive buffer, or in
    /// FILECOPY mode from the input file into the response body.
    pub fn receive(&mut self, engine: &Engine) -> IoOutcome {
        if self.mode == Mode::FileCopy {
            return self.read_file();
        }

        let cfg = &engine.config;
        let start = self.response.data.len();
        self.response.data.need_bytes(cfg.request_initial_size);
        // always leave one spare byte, like the terminating NUL the
        // buffer reserves for its textual view
        let want = self.response.data.capacity() - start - 1;
        self.response.data.resize_for_read(start + want);

        let attempt = {
            let WebClient {
                tls,
                flags,
                response,
                ofd,
                ..
            } = self;
            if let Some(tls) = tls.as_mut() {
                let io = tls.read(&mut response.data.slice_mut(start)[..want]);
                apply_tls_wait(flags, &io);
                match io {
                    TlsIo::Done(n) if n > 0 => Ok(IoAttempt::Data(n)),
                    TlsIo::Done(_) | TlsIo::Closed => Ok(IoAttempt::Eof),
                    TlsIo::WantRead | TlsIo::WantWrite => Ok(IoAttempt::WouldBlock),
                    TlsIo::Fatal => Err(std::io::Error::other("tls fatal")),
                }
            } else {
                syscalls::recv_nonblocking(*ofd, &mut response.data.slice_mut(start)[..want])
            }
        };

        match attempt {
            Ok(IoAttempt::Data(n)) => {
                self.response.data.truncate(start + n);
                self.stats.received_bytes += n as u64;
                tracing::debug!("{}: received {} bytes", self.id, n);
                IoOutcome::Progress(n)
            }
            Ok(IoAttempt::WouldBlock) => {
                self.response.data.truncate(start);
                self.enable_wait_receive();
                IoOutcome::Blocked
            }
            Ok(IoAttempt::Eof) => {
                self.response.data.truncate(start);
                IoOutcome::Eof
            }
            Err(e) => {
                self.response.data.truncate(start);
                tracing::debug!("{}: receive data failed: {}", self.id, e);
                self.mark_dead();
                IoOutcome::Blocked
            }
        }
    }

    /// FILECOPY receive: append file bytes to the response body until
    /// `rlen` is reached. On end of file the input collapses back to
    /// the socket and the remaining buffer drains through `send`.
    pub fn read_file(&mut self) -> IoOutcome {
        let rlen = self.response.rlen;
        let len = self.response.data.len();

        if rlen <= len {
            return IoOutcome::Progress(0);
        }

        let InputSource::File(fd) = self.source else {
            self.disable_wait_receive();
            return IoOutcome::Progress(0);
        };

        let left = rlen - len;
        self.response.data.resize_for_read(rlen);

        match syscalls::read_nonblocking(fd, &mut self.response.data.slice_mut(len)[..left]) {
            Ok(IoAttempt::Data(n)) => {
                self.response.data.truncate(len + n);
                tracing::debug!("{}: read {} bytes", self.id, n);
                self.enable_wait_send();
                if self.response.data.len() >= rlen {
                    self.disable_wait_receive();
                }
                IoOutcome::Progress(n)
            }
            Ok(IoAttempt::Eof) => {
                self.response.data.truncate(len);
                tracing::debug!("{}: read the whole file", self.id);
                // short file: let the buffered part finish copying
                self.disable_wait_receive();
                syscalls::close_fd(fd);
                self.source = InputSource::Socket;
                IoOutcome::Progress(0)
            }
            Ok(IoAttempt::WouldBlock) => {
                self.response.data.truncate(len);
                IoOutcome::Blocked
            }
            Err(e) => {
                self.response.data.truncate(len);
                tracing::debug!("{}: read data failed: {}", self.id, e);
                self.mark_dead();
                IoOutcome::Blocked
            }
        }
    }

    /// Drain pending response bytes to the socket. Dispatches to the
    /// compressed path when gzip is active; otherwise writes
    /// `data[sent..]` and decides close / keep-alive / yield exactly
    /// once everything is out.
    pub fn send(&mut self, engine: &Engine) -> usize {
        if self.response.zoutput {
            return self.send_deflate(engine);
        }

        if self.response.data.len() == self.response.sent {
            // out of output data: either done, or waiting for the
            // input file to refill the buffer
            if self.mode == Mode::FileCopy
                && self.wants_receive()
                && self.response.rlen > self.response.data.len()
            {
                self.disable_wait_send();
                return 0;
            }

            if !self.has_keepalive() {
                tracing::debug!("{}: closing, keep-alive is not enabled", self.id);
                self.mark_dead();
                return 0;
            }

            self.request_done(&engine.stats);
            return 0;
        }

        let WebClient {
            tls,
            flags,
            response,
            ofd,
            ..
        } = self;
        let range = &response.data.as_bytes()[response.sent..];
        match send_bytes(tls, flags, *ofd, range, libc::MSG_DONTWAIT) {
            SendAttempt::Sent(n) => {
                self.stats.sent_bytes += n as u64;
                self.response.sent += n;
                n
            }
            SendAttempt::Blocked => 0,
            SendAttempt::Fatal => {
                tracing::debug!("{}: failed to send data to client", self.id);
                self.mark_dead();
                0
            }
        }
    }

    /// All remaining input is in hand when the mode cannot produce
    /// more (plain data modes), or the file is fully buffered.
    fn deflate_input_final(&self) -> bool {
        match self.mode {
            Mode::Get | Mode::Post | Mode::Put | Mode::Delete => true,
            Mode::FileCopy => {
                !self.wants_receive() && self.response.data.len() == self.response.rlen
            }
            Mode::Options | Mode::Stream => false,
        }
    }

    fn send_deflate(&mut self, engine: &Engine) -> usize {
        let pending_input = self.response.data.len() - self.response.sent;
        let drained = self.response.zhave == self.response.zsent;
        let finished = self
            .response
            .zstream
            .as_ref()
            .map(Deflater::is_finished)
            .unwrap_or(true);
        let input_final = self.deflate_input_final();

        if pending_input == 0 && drained && (finished || !input_final) {
            // nothing left to produce for now
            if self.response.sent != 0 && !self.send_framing(b"\r\n0\r\n\r\n") {
                return 0;
            }

            if self.mode == Mode::FileCopy
                && self.wants_receive()
                && self.response.rlen > self.response.data.len()
            {
                self.disable_wait_send();
                return 0;
            }

            if !self.has_keepalive() {
                tracing::debug!("{}: closing, keep-alive is not enabled", self.id);
                self.mark_dead();
                return 0;
            }

            self.request_done(&engine.stats);
            return 0;
        }

        if drained {
            // close the previously open chunk
            if self.response.sent != 0 && !self.send_framing(b"\r\n") {
                return 0;
            }

            let take = pending_input.min(engine.config.zlib_chunk_size);
            let finish = input_final && take == pending_input;
            let from = self.response.sent;

            let out = {
                let crate::client::Response { data, zstream, .. } = &mut self.response;
                let input = &data.as_bytes()[from..from + take];
                let Some(z) = zstream.as_mut() else {
                    return 0;
                };
                z.compress(input, finish)
            };

            let out = match out {
                Ok(out) => out,
                Err(e) => {
                    tracing::error!("{}: compression failed, closing down client: {}", self.id, e);
                    self.request_done(&engine.stats);
                    self.mark_dead();
                    return 0;
                }
            };

            self.response.zbuffer = out;
            self.response.zhave = self.response.zbuffer.len();
            self.response.zsent = 0;
            self.response.sent += take;

            if self.response.zhave > 0 {
                let header = format!("{:X}\r\n", self.response.zhave);
                if !self.send_framing(header.as_bytes()) {
                    return 0;
                }
            }
        }

        let WebClient {
            tls,
            flags,
            response,
            ofd,
            ..
        } = self;
        let range = &response.zbuffer[response.zsent..response.zhave];
        if range.is_empty() {
            return 0;
        }

        match send_bytes(tls, flags, *ofd, range, libc::MSG_DONTWAIT) {
            SendAttempt::Sent(n) => {
                self.stats.sent_bytes += n as u64;
                self.response.zsent += n;
                n
            }
            SendAttempt::Blocked => 0,
            SendAttempt::Fatal => {
                tracing::debug!("{}: failed to send data to client", self.id);
                self.mark_dead();
                0
            }
        }
    }

    /// Send chunk framing bytes completely. Framing is tiny and must
    /// be serialized with the chunk body, so transient would-blocks
    /// are retried a bounded number of times before the client is
    /// declared dead. Returns false when the client died.
    fn send_framing(&mut self, framing: &[u8]) -> bool {
        let mut written = 0;
        let mut retries = 0;

        while written < framing.len() {
            let WebClient {
                tls, flags, ofd, ..
            } = self;
            match send_bytes(tls, flags, *ofd, &framing[written..], 0) {
                SendAttempt::Sent(n) => {
                    written += n;
                    self.stats.sent_bytes += n as u64;
                }
                SendAttempt::Blocked => {
                    retries += 1;
                    if retries > 100 {
                        tracing::debug!("{}: failed to send chunk framing to client", self.id);
                        self.mark_dead();
                        return false;
                    }
                }
                SendAttempt::Fatal => {
                    tracing::debug!("{}: failed to send chunk framing to client", self.id);
                    self.mark_dead();
                    return false;
                }
            }
        }

        true
    }

    /// Send the composed response head, corking the socket first so
    /// the head and the first body bytes share a segment.
    pub fn send_http_header(&mut self) {
        self.cork_socket();

        let header_len = self.response.header_output.len();
        let mut written = 0;
        let mut retries = 0;

        while written < header_len {
            let WebClient {
                tls,
                flags,
                response,
                ofd,
                ..
            } = self;
            let range = &response.header_output.as_bytes()[written..];
            match send_bytes(tls, flags, *ofd, range, 0) {
                SendAttempt::Sent(n) => {
                    written += n;
                    self.stats.sent_bytes += n as u64;
                }
                SendAttempt::Blocked => {
                    retries += 1;
                    if retries > 100 {
                        tracing::error!("cannot send HTTP headers to web client");
                        self.mark_dead();
                        return;
                    }
                }
                SendAttempt::Fatal => {
                    tracing::error!(
                        "HTTP headers failed to be sent ({} of {} bytes). Closing web client.",
                        written,
                        header_len
                    );
                    self.mark_dead();
                    return;
                }
            }
        }
    }
}
