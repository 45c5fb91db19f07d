//! Pre-allocated connection slots and the two queues that recycle them.
//!
//! Every slot is a [`Job`] permanently paired with one payload (a [`Session`]
//! for the server). A slot lives in exactly one place at a time:
//!
//! - `finished`: free, waiting for the acceptor;
//! - the acceptor: being populated with a fresh connection;
//! - `pending`: populated, waiting for the dispatcher;
//! - one worker: running.
//!
//! Slots move by value between those owners, so no slot can be referenced by
//! two components at once. Nothing is allocated after [`SessionPool::new`].

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};

use tracing::error;

use crate::error::Result;
use crate::queue::{BoundedQueue, QueueFull};

/// Per-connection state. Free when it holds no stream.
#[derive(Debug, Default)]
pub struct Session {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate a free session with an accepted connection.
    pub fn attach(&mut self, stream: TcpStream, peer: SocketAddr) {
        debug_assert!(self.is_free(), "attach on a session that still owns a socket");
        self.stream = Some(stream);
        self.peer = Some(peer);
    }

    pub fn is_free(&self) -> bool {
        self.stream.is_none()
    }

    pub fn stream(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Shut down and drop the socket, returning the session to the free state.
    pub fn close(&mut self) -> io::Result<()> {
        self.peer = None;
        match self.stream.take() {
            Some(stream) => match stream.shutdown(Shutdown::Both) {
                // Peer already gone.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "{}:{}", peer.ip(), peer.port()),
            None => f.write_str("<free>"),
        }
    }
}

/// Typed handle for a slot: its index in the pool plus the payload it carries.
pub struct Job<S> {
    id: usize,
    payload: S,
}

impl<S> Job<S> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn payload(&self) -> &S {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut S {
        &mut self.payload
    }
}

impl<S: fmt::Debug> fmt::Debug for Job<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Fixed set of reusable slots cycling through a free list and a ready list.
pub struct SessionPool<S = Session> {
    pending: BoundedQueue<Job<S>>,
    finished: BoundedQueue<Job<S>>,
}

impl<S> SessionPool<S> {
    /// Allocate `capacity` slots up front, all free.
    ///
    /// # Errors
    /// `Error::InvalidCapacity` if `capacity` is zero.
    pub fn new(capacity: usize, mut init: impl FnMut(usize) -> S) -> Result<Self> {
        let pending = BoundedQueue::new(capacity)?;
        let finished = BoundedQueue::new(capacity)?;
        for id in 0..capacity {
            let job = Job {
                id,
                payload: init(id),
            };
            if finished.put(job).is_err() {
                unreachable!("free list sized to capacity");
            }
        }
        Ok(Self { pending, finished })
    }

    /// Take a free slot, if any.
    pub fn acquire(&self) -> Option<Job<S>> {
        self.finished.get()
    }

    /// Make a populated slot visible to the dispatcher.
    pub fn publish(&self, job: Job<S>) -> core::result::Result<(), QueueFull<Job<S>>> {
        self.pending.put(job)
    }

    /// Take the oldest published slot, if any.
    pub fn next_pending(&self) -> Option<Job<S>> {
        self.pending.get()
    }

    /// Return a slot to the free list once its job is done.
    pub fn recycle(&self, job: Job<S>) {
        // Both queues hold every slot; a full free list means a slot was duplicated.
        if let Err(full) = self.finished.put(job) {
            error!(
                "Free list overflow while recycling slot {}; dropping it",
                full.0.id
            );
        }
    }

    pub fn capacity(&self) -> usize {
        self.finished.capacity()
    }

    /// Slots currently on the free list.
    pub fn free(&self) -> usize {
        self.finished.len()
    }

    /// Slots published and not yet picked up by the dispatcher.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// `(free, pending)` read under both queue locks at once.
    pub(crate) fn with_counts<R>(&self, f: impl FnOnce(usize, usize) -> R) -> R {
        self.pending
            .with_len(|pending| self.finished.with_len(|free| f(free, pending)))
    }
}

impl SessionPool<Session> {
    pub fn with_sessions(capacity: usize) -> Result<Self> {
        Self::new(capacity, |_| Session::new())
    }
}
