//! Per-connection exchange executed on a worker thread.
//!
//! One frame in, one frame out, then the socket is closed. The receive timeout
//! is a socket option, so a silent peer releases the worker on its own.

use std::io::{Read, Write};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::MAX_FRAME_SIZE;
use crate::metrics;
use crate::protocol::{self, Response};
use crate::runner::RequestHandler;
use crate::session::Session;
use crate::thread_pool::JobHandler;

pub struct ConnectionHandler<H> {
    handler: H,
    recv_timeout: Duration,
}

impl<H: RequestHandler> ConnectionHandler<H> {
    pub fn new(handler: H, recv_timeout: Duration) -> Self {
        Self {
            handler,
            recv_timeout,
        }
    }

    /// Run the request/response exchange for one accepted connection.
    pub fn serve(&self, session: &mut Session) {
        let peer = session.to_string();
        let Some(stream) = session.stream() else {
            warn!("Job for a free session; nothing to serve");
            return;
        };
        debug!("Connection from {peer}");

        if let Err(e) = stream.set_read_timeout(Some(self.recv_timeout)) {
            error!("Failed to set receive timeout for {peer}: {e}");
            return;
        }

        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = match stream.read(&mut buf) {
            Ok(0) => {
                metrics::inc_recv_failures();
                warn!("Connection to {peer} closed before a request was sent");
                return;
            }
            Ok(len) => len,
            Err(e) => {
                metrics::inc_recv_failures();
                error!("Failed to receive request from {peer}: {e}");
                return;
            }
        };

        let text = String::from_utf8_lossy(&buf[..len]);
        let text = text.trim_end_matches(|c: char| c == '\0' || c.is_ascii_whitespace());
        debug!("Request: {text:?}");

        let response = self.respond(text);
        let reply = protocol::compose_response(&response);
        debug!("Response: {reply:?}");

        if let Err(e) = stream.write_all(reply.as_bytes()).and_then(|()| stream.flush()) {
            error!("Failed to send response to {peer}: {e}");
        }
    }

    fn respond(&self, text: &str) -> Response {
        let request = match protocol::parse_request(text) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed request {text:?}: {e}");
                return Response::malformed(&e);
            }
        };
        match self.handler.handle(&request) {
            Ok(response) => response,
            Err(e) => {
                error!(
                    "Handling {} for {:?} failed: {e}",
                    request.method, request.ip
                );
                Response::internal_error()
            }
        }
    }
}

impl<H: RequestHandler> JobHandler<Session> for ConnectionHandler<H> {
    fn run(&self, session: &mut Session) {
        self.serve(session);
    }

    fn recycle(&self, session: &mut Session) {
        let peer = session.to_string();
        if session.is_free() {
            return;
        }
        debug!("Close connection to {peer}");
        if let Err(e) = session.close() {
            debug!("Closing connection to {peer}: {e}");
        }
    }
}
