use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::engine::Engine;
use crate::error::{WebError, WebResult};
use crate::metrics::WorkerMetrics;
use crate::syscalls;
use crate::worker::Worker;

/// Pooled static-thread deployment of the engine: one worker thread
/// per core, each with its own SO_REUSEPORT listener and epoll
/// instance, all sharing one read-only `Engine`.
pub struct Server {
    engine: Arc<Engine>,
    workers: usize,
}

impl Server {
    pub fn new(engine: Engine) -> Self {
        let workers = if engine.config.workers > 0 {
            engine.config.workers
        } else {
            num_cpus::get()
        };

        Self {
            engine: Arc::new(engine),
            workers,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Run until SIGINT. Blocks the calling thread.
    pub fn serve(self) -> WebResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let shutdown_signal = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("received shutdown signal, draining active connections");
            shutdown_signal.store(true, Ordering::Release);
        })
        .map_err(|e| WebError::Other(format!("cannot set signal handler: {e}")))?;

        self.serve_with_shutdown(shutdown)
    }

    /// Run until the given flag turns true.
    pub fn serve_with_shutdown(self, shutdown: Arc<AtomicBool>) -> WebResult<()> {
        let Parts { host, port } = parse_host_port(&self.engine.config.listen)?;
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        let mut worker_metrics = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            worker_metrics.push(Arc::new(WorkerMetrics::new()));
        }

        let metrics_clones = worker_metrics.clone();
        let shutdown_metrics = shutdown.clone();
        thread::Builder::new()
            .name("vitals-web-metrics".to_string())
            .spawn(move || {
                while !shutdown_metrics.load(Ordering::Acquire) {
                    thread::sleep(std::time::Duration::from_secs(5));
                    if shutdown_metrics.load(Ordering::Acquire) {
                        break;
                    }
                    let mut total_reqs = 0;
                    let mut total_active = 0;
                    for m in &metrics_clones {
                        total_reqs += m.req_count.load(Ordering::Relaxed);
                        total_active += m.active_conns.load(Ordering::Relaxed);
                    }
                    tracing::info!(
                        "active connections: {} | total requests: {}",
                        total_active,
                        total_reqs
                    );
                }
            })
            .ok();

        tracing::info!(
            "starting {} web workers on {}:{} (SO_REUSEPORT)",
            self.workers,
            host,
            port
        );

        let mut handles: Vec<thread::JoinHandle<()>> = Vec::with_capacity(self.workers);
        for i in 0..self.workers {
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let engine = self.engine.clone();
            let shutdown = shutdown.clone();
            let metrics = worker_metrics[i].clone();
            let host = host.clone();

            let handle = thread::Builder::new()
                .name(format!("vitals-web-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }

                    match syscalls::create_listen_socket(&host, port) {
                        Ok(listen_fd) => {
                            let mut worker = Worker::new(i, listen_fd, engine, metrics);
                            if let Err(e) = worker.run(shutdown) {
                                tracing::error!("worker {} exited with error: {}", i, e);
                            }
                            syscalls::close_fd(listen_fd);
                        }
                        Err(e) => {
                            tracing::error!("worker {} failed to bind: {}", i, e);
                        }
                    }
                })
                .map_err(|e| WebError::Io(e))?;

            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }

        Ok(())
    }
}

struct Parts {
    host: String,
    port: u16,
}

fn parse_host_port(hp: &str) -> WebResult<Parts> {
    let (host, port) = hp
        .rsplit_once(':')
        .ok_or_else(|| WebError::Address(hp.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| WebError::Address(hp.to_string()))?;

    Ok(Parts {
        host: if host.is_empty() {
            "0.0.0.0".to_string()
        } else {
            host.to_string()
        },
        port,
    })
}
