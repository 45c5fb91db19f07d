//! Listening socket, accept loop and teardown.
//!
//! The acceptor turns each inbound connection into a job using only the slots
//! allocated up front: take a free slot, attach the socket, publish it. When no
//! slot is free it sleeps for the configured backoff and tries again, so the
//! backlog absorbs bursts instead of the process allocating more capacity.

use std::net::{Shutdown, SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::{LISTEN_BACKLOG, ServerConfig};
use crate::error::{Error, Result};
use crate::metrics;
use crate::session::{Job, Session, SessionPool};
use crate::thread_pool::{JobHandler, PoolStats, ThreadPool};

fn create_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::setup("failed to create socket"))?;
    socket
        .set_reuse_address(true)
        .map_err(Error::setup("failed to set SO_REUSEADDR"))?;
    socket
        .bind(&addr.into())
        .map_err(Error::setup("failed to bind"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(Error::setup("failed to listen"))?;
    Ok(socket.into())
}

/// Cloneable trigger for stopping a running [`Server`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stopping: Arc<AtomicBool>,
    listener: Arc<TcpListener>,
}

impl ShutdownHandle {
    /// Stop accepting. Wakes an acceptor blocked in `accept`; later connection
    /// attempts are refused. Safe to call more than once.
    pub fn trigger(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Shutting down listening socket");
        if let Err(e) = SockRef::from(&*self.listener).shutdown(Shutdown::Both) {
            debug!("Listening socket shutdown: {e}");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

pub struct Server {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    backoff: Duration,
    pool: ThreadPool<Session>,
}

impl Server {
    /// Bind the listening socket, allocate every session slot and start the
    /// worker pool. Connections are not accepted until [`run`](Self::run).
    pub fn bind(config: &ServerConfig, handler: impl JobHandler<Session>) -> Result<Self> {
        config.validate()?;
        info!("Starting server on {}", config.listen_addr);

        let listener = create_listener(config.listen_addr)?;
        let local_addr = listener
            .local_addr()
            .map_err(Error::setup("failed to read local address"))?;

        let sessions = SessionPool::with_sessions(config.queue_size)?;
        let mut pool = ThreadPool::new(config.workers, sessions, handler)?;
        pool.start()?;

        info!(
            "Server has started on {local_addr} ({} workers, {} slots)",
            config.workers, config.queue_size
        );
        Ok(Self {
            listener: Arc::new(listener),
            local_addr,
            stopping: Arc::new(AtomicBool::new(false)),
            backoff: config.backoff,
            pool,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stopping: Arc::clone(&self.stopping),
            listener: Arc::clone(&self.listener),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Accept connections until the shutdown handle is triggered.
    pub fn run(&self) {
        debug!("Acceptor running");
        while !self.is_stopping() {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    if self.is_stopping() {
                        break;
                    }
                    metrics::inc_accept_failures();
                    error!("Failed to accept connection: {e}");
                    thread::sleep(self.backoff);
                    continue;
                }
            };
            metrics::inc_connections_accepted();
            debug!("Accepted connection from {peer}");

            // Dropping the stream on shutdown closes the connection.
            let Some(mut job) = self.free_slot() else {
                break;
            };
            job.payload_mut().attach(stream, peer);
            if !self.publish(job) {
                break;
            }
        }
        debug!("Acceptor stopped");
    }

    /// Wait for a free slot. `None` if shutdown starts first.
    fn free_slot(&self) -> Option<Job<Session>> {
        loop {
            if let Some(job) = self.pool.acquire() {
                return Some(job);
            }
            if self.is_stopping() {
                return None;
            }
            metrics::inc_backpressure_waits();
            warn!(
                "No free session slot, retrying in {}ms",
                self.backoff.as_millis()
            );
            thread::sleep(self.backoff);
        }
    }

    fn publish(&self, mut job: Job<Session>) -> bool {
        loop {
            match self.pool.submit(job) {
                Ok(()) => return true,
                Err(full) => {
                    job = full.into_inner();
                    if self.is_stopping() {
                        warn!("Dropping connection from {} during shutdown", job.payload());
                        return false;
                    }
                    metrics::inc_backpressure_waits();
                    warn!(
                        "Pending queue full, retrying in {}ms",
                        self.backoff.as_millis()
                    );
                    thread::sleep(self.backoff);
                }
            }
        }
    }

    /// Stop accepting, stop the pool and join every thread. A worker that is
    /// mid-job finishes it first.
    pub fn shutdown(mut self) {
        info!("Stopping server");
        self.shutdown_handle().trigger();
        self.pool.stop();
        info!("Server is stopped");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("stopping", &self.is_stopping())
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    fn config(workers: usize, queue_size: usize) -> ServerConfig {
        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.workers = workers;
        config.queue_size = queue_size;
        config
    }

    #[test]
    fn binds_ephemeral_port() {
        let server = Server::bind(&config(1, 1), |_: &mut Session| {}).expect("bind");
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.stats().free, 1);
        server.shutdown();
    }

    #[test]
    fn invalid_sizes_fail_before_binding() {
        assert!(matches!(
            Server::bind(&config(0, 1), |_: &mut Session| {}),
            Err(Error::InvalidWorkerCount(0))
        ));
        assert!(matches!(
            Server::bind(&config(1, 0), |_: &mut Session| {}),
            Err(Error::InvalidCapacity(0))
        ));
        let mut zero_timeout = config(1, 1);
        zero_timeout.recv_timeout = Duration::ZERO;
        assert!(matches!(
            Server::bind(&zero_timeout, |_: &mut Session| {}),
            Err(Error::ZeroRecvTimeout)
        ));
    }

    #[test]
    fn address_in_use_is_a_setup_error() {
        let taken = TcpListener::bind("127.0.0.1:0").expect("bind");
        let mut cfg = config(1, 1);
        cfg.listen_addr = taken.local_addr().expect("addr");
        assert!(matches!(
            Server::bind(&cfg, |_: &mut Session| {}),
            Err(Error::Setup { .. })
        ));
    }

    #[test]
    fn trigger_unblocks_accept_and_refuses_new_connections() {
        let server = Arc::new(Server::bind(&config(1, 1), |_: &mut Session| {}).expect("bind"));
        let addr = server.local_addr();
        let handle = server.shutdown_handle();

        let acceptor = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run())
        };
        thread::sleep(Duration::from_millis(50));
        handle.trigger();
        handle.trigger();
        acceptor.join().expect("acceptor");
        assert!(handle.is_triggered());
        assert!(TcpStream::connect(addr).is_err());

        let server = Arc::try_unwrap(server).expect("sole owner");
        server.shutdown();
    }
}
