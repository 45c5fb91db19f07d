#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gatekeep::config::ServerConfig;
use gatekeep::protocol::{self, Response};
use gatekeep::server::{Server, ShutdownHandle};
use gatekeep::session::Session;
use gatekeep::thread_pool::{JobHandler, PoolStats};

/// A server on an ephemeral loopback port with its acceptor on a background thread.
pub struct TestServer {
    server: Arc<Server>,
    acceptor: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(workers: usize, queue_size: usize, handler: impl JobHandler<Session>) -> Self {
        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.workers = workers;
        config.queue_size = queue_size;
        config.backoff = Duration::from_millis(5);

        let server = Arc::new(Server::bind(&config, handler).expect("bind test server"));
        let acceptor = {
            let server = Arc::clone(&server);
            thread::Builder::new()
                .name("acceptor".into())
                .spawn(move || server.run())
                .expect("spawn acceptor")
        };
        Self {
            server,
            acceptor: Some(acceptor),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn handle(&self) -> ShutdownHandle {
        self.server.shutdown_handle()
    }

    pub fn stats(&self) -> PoolStats {
        self.server.stats()
    }

    /// Stop accepting and wait for the acceptor thread to exit.
    pub fn stop_accepting(&mut self) {
        self.handle().trigger();
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.join().expect("acceptor panicked");
        }
    }

    /// Full teardown: acceptor first, then the worker pool.
    pub fn shutdown(mut self) {
        self.stop_accepting();
        let server = Arc::try_unwrap(self.server).expect("acceptor released the server");
        server.shutdown();
    }
}

/// Send one raw frame and read until the server closes. Empty when the
/// server closed without answering.
pub fn send_raw(addr: SocketAddr, frame: &str) -> String {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    stream.write_all(frame.as_bytes()).expect("send");
    stream.shutdown(Shutdown::Write).expect("half close");
    let mut reply = String::new();
    stream.read_to_string(&mut reply).expect("read reply");
    reply
}

pub fn send_request(addr: SocketAddr, frame: &str) -> Response {
    let reply = send_raw(addr, frame);
    protocol::parse_response(&reply).unwrap_or_else(|e| panic!("bad reply {reply:?}: {e}"))
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
