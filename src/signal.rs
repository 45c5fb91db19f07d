//! SIGINT delivery for graceful teardown.
//!
//! SIGINT is blocked in the main thread before any other thread is spawned, so
//! every thread inherits the mask and the signal stays pending until the
//! watcher collects it with `sigwait`. The watcher then ignores further
//! SIGINTs and triggers the server's shutdown handle. Once teardown is done,
//! [`reraise`] restores the default disposition and delivers SIGINT again so
//! the process exits with the conventional signal status.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::server::ShutdownHandle;

fn sigint_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set
}

/// Block SIGINT in the calling thread. Call before spawning any thread.
pub fn block_sigint() -> Result<()> {
    sigint_set().thread_block()?;
    Ok(())
}

pub struct SigintWatcher {
    received: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl SigintWatcher {
    /// Whether SIGINT has been received.
    pub fn received(&self) -> bool {
        self.received.load(Ordering::Acquire)
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

/// Spawn the thread that waits for SIGINT and triggers `shutdown`.
pub fn spawn_sigint_watcher(shutdown: ShutdownHandle) -> Result<SigintWatcher> {
    let received = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&received);
    let handle = thread::Builder::new()
        .name("sigint".into())
        .spawn(move || {
            let set = sigint_set();
            match set.wait() {
                Ok(sig) => {
                    info!("Received {sig}, shutting down");
                    // SAFETY: installs a disposition, not a handler function.
                    if let Err(e) = unsafe { signal::signal(Signal::SIGINT, SigHandler::SigIgn) } {
                        debug!("Ignoring further SIGINTs failed: {e}");
                    }
                    flag.store(true, Ordering::Release);
                    shutdown.trigger();
                }
                Err(e) => debug!("sigwait failed: {e}"),
            }
        })
        .map_err(|source| Error::ThreadSpawn {
            name: "sigint".into(),
            source,
        })?;
    Ok(SigintWatcher { received, handle })
}

/// Restore the default SIGINT disposition and deliver SIGINT to this process.
/// Does not return when the default action terminates the process.
pub fn reraise() -> Result<()> {
    // SAFETY: installs a disposition, not a handler function.
    unsafe { signal::signal(Signal::SIGINT, SigHandler::SigDfl) }?;
    let set = sigint_set();
    signal::raise(Signal::SIGINT)?;
    // Pending SIGINT is delivered as soon as it is unblocked.
    set.thread_unblock()?;
    Ok(())
}
