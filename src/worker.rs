use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use libc::c_int;

use crate::client::InputSource;
use crate::engine::Engine;
use crate::error::WebResult;
use crate::http::Mode;
use crate::metrics::WorkerMetrics;
use crate::pool::ClientPool;
use crate::router::process_request;
use crate::syscalls::{self, EPOLLIN, EPOLLOUT, Epoll, epoll_event};
use crate::transfer::IoOutcome;

const LISTEN_TOKEN: u64 = u64::MAX;
const MAX_EVENTS: usize = 1024;
const POOL_CAPACITY: usize = 4096;

/// One static worker thread: owns an epoll instance, a SO_REUSEPORT
/// listener and a disjoint set of clients. The loop mirrors the
/// engine's WAIT_RECEIVE / WAIT_SEND flags into epoll interests and
/// calls back into the engine on readiness.
pub struct Worker {
    id: usize,
    listen_fd: c_int,
    engine: Arc<Engine>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    pub fn new(id: usize, listen_fd: c_int, engine: Arc<Engine>, metrics: Arc<WorkerMetrics>) -> Self {
        Self {
            id,
            listen_fd,
            engine,
            metrics,
        }
    }

    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> WebResult<()> {
        let epoll = Epoll::new()?;
        epoll.add(self.listen_fd, LISTEN_TOKEN, EPOLLIN)?;

        let mut pool = ClientPool::new(POOL_CAPACITY);
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        tracing::debug!("worker {} entering main event loop", self.id);

        let mut last_sweep = Instant::now();

        while !shutdown.load(Ordering::Acquire) {
            let n = epoll.wait(&mut events, 200)?;

            for ev in &events[..n] {
                let token = ev.u64;
                let readable = (ev.events & EPOLLIN as u32) != 0;
                let writable = (ev.events & EPOLLOUT as u32) != 0;

                if token == LISTEN_TOKEN {
                    self.accept_pending(&epoll, &mut pool, &shutdown);
                } else {
                    self.drive_client(&epoll, &mut pool, token as usize, readable, writable);
                }
            }

            if last_sweep.elapsed().as_secs() >= 1 {
                self.sweep_timeouts(&epoll, &mut pool);
                last_sweep = Instant::now();
            }
        }

        tracing::debug!("worker {} exiting gracefully", self.id);

        for idx in pool.active_slots() {
            if let Some(w) = pool.get_mut(idx) {
                let fd = w.ofd;
                epoll.delete(fd).ok();
                syscalls::close_fd(fd);
            }
            pool.release(idx);
        }

        Ok(())
    }

    fn accept_pending(&self, epoll: &Epoll, pool: &mut ClientPool, shutdown: &AtomicBool) {
        if shutdown.load(Ordering::Acquire) {
            return; // no new connections during graceful shutdown
        }

        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, ip, port))) => {
                    let Some(idx) = pool.acquire() else {
                        // out of capacity: backpressure, drop it
                        syscalls::close_fd(fd);
                        continue;
                    };

                    if epoll.add(fd, idx as u64, EPOLLIN).is_err() {
                        pool.release(idx);
                        syscalls::close_fd(fd);
                        continue;
                    }

                    let w = pool.get_mut(idx).expect("freshly acquired slot");
                    w.id = self.engine.next_client_id();
                    w.client_ip = ip;
                    w.client_port = port;
                    w.ofd = fd;
                    self.metrics.inc_conn();

                    tracing::debug!(
                        "worker {}: client {} connected from [{}]:{}",
                        self.id,
                        w.id,
                        w.client_ip,
                        w.client_port
                    );
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    fn drive_client(
        &self,
        epoll: &Epoll,
        pool: &mut ClientPool,
        idx: usize,
        readable: bool,
        writable: bool,
    ) {
        let engine = &*self.engine;
        let Some(w) = pool.get_mut(idx) else {
            return;
        };

        if readable && w.wants_receive() && w.mode != Mode::FileCopy {
            match w.receive(engine) {
                IoOutcome::Eof => {
                    self.close_client(epoll, pool, idx);
                    return;
                }
                IoOutcome::Progress(n) if n > 0 => {
                    self.metrics.add_received(n);
                    process_request(w, engine);
                    if w.response.code != 0 {
                        self.metrics.inc_req();
                    }
                }
                IoOutcome::Progress(_) | IoOutcome::Blocked => {}
            }
        }

        // regular files are not pollable: drain the input file inline
        // whenever FILECOPY wants more of it
        while !w.is_dead()
            && w.mode == Mode::FileCopy
            && w.wants_receive()
            && matches!(w.source, InputSource::File(_))
        {
            match w.read_file() {
                IoOutcome::Progress(n) if n > 0 => {}
                _ => break,
            }
        }

        if (writable || w.wants_send()) && w.wants_send() && !w.is_dead() {
            let sent = w.send(engine);
            self.metrics.add_sent(sent);
        }

        if w.is_dead() {
            self.close_client(epoll, pool, idx);
            return;
        }

        // mirror the engine's wait flags into epoll interests
        let mut interests = 0;
        if w.wants_receive() && w.source == InputSource::Socket {
            interests |= EPOLLIN;
        }
        if w.wants_send() {
            interests |= EPOLLOUT;
        }
        let fd = w.ofd;
        if epoll.modify(fd, idx as u64, interests).is_err() {
            self.close_client(epoll, pool, idx);
        }
    }

    fn sweep_timeouts(&self, epoll: &Epoll, pool: &mut ClientPool) {
        let engine = &*self.engine;
        if engine.config.timeout_ms == 0 {
            return;
        }

        for idx in pool.active_slots() {
            let Some(w) = pool.get_mut(idx) else {
                continue;
            };

            // only requests still being prepared have a deadline to
            // miss; once the head is on the wire a 504 cannot replace
            // the response any more
            if w.timings.timeout_ut == 0
                || w.timings.tv_ready.is_some()
                || !w.timeout_checkpoint_and_check()
            {
                continue;
            }

            // the 504 replaces whatever was in flight
            tracing::debug!("worker {}: client {} timed out", self.id, w.id);
            w.timeout_checkpoint_response_ready();
            w.response.sent = 0;
            w.disable_wait_receive();
            w.build_http_header(&engine.config);
            w.send_http_header();
            w.enable_wait_send();

            if w.is_dead() {
                self.close_client(epoll, pool, idx);
            } else {
                let w = pool.get_mut(idx).expect("slot still active");
                let fd = w.ofd;
                let _ = epoll.modify(fd, idx as u64, EPOLLOUT);
            }
        }
    }

    fn close_client(&self, epoll: &Epoll, pool: &mut ClientPool, idx: usize) {
        let Some(w) = pool.get_mut(idx) else {
            return;
        };
        let fd = w.ofd;
        tracing::debug!("worker {}: releasing client {}", self.id, w.id);

        epoll.delete(fd).ok();
        syscalls::close_fd(fd);
        pool.release(idx);
        self.metrics.dec_conn();
    }
}
