//! Error types for the gatekeep service.
//!
//! Startup failures (configuration, socket setup, thread creation) are fatal and
//! bubble up to `main`. Per-connection failures never reach this type: they are
//! logged by the connection handler and the connection is abandoned.
//!
//! `Command` and `CommandFailed` come from the firewall runner; the connection
//! handler maps both to an error-coded response instead of propagating them.

use std::io;
use std::process::ExitStatus;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A bounded queue or session pool was sized below one slot.
    #[error("invalid capacity {0}: must be at least 1")]
    InvalidCapacity(usize),

    /// The worker pool was sized below one worker.
    #[error("invalid worker count {0}: must be at least 1")]
    InvalidWorkerCount(usize),

    /// A zero receive timeout would make every socket read fail.
    #[error("receive timeout must be greater than zero")]
    ZeroRecvTimeout,

    /// The listen address could not be resolved.
    #[error("invalid listen address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// Creating, configuring, binding or listening on the server socket failed.
    #[error("{context}: {source}")]
    Setup {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The external firewall program could not be started.
    #[error("failed to execute {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The external firewall program ran but reported failure.
    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("signal handling: {0}")]
    Signal(#[from] nix::Error),
}

impl Error {
    pub(crate) fn setup(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Setup { context, source }
    }
}
