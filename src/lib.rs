//! Library crate for gatekeep: bounded queue, session pool, dispatcher-driven
//! thread pool, TCP server, wire codec and firewall runner.
//!
//! The binary (`main.rs`) wires these together with logging and SIGINT
//! handling. Everything here is usable without signals, so integration tests
//! drive a real [`Server`] through its [`ShutdownHandle`].

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod runner;
pub mod server;
pub mod session;
pub mod signal;
pub mod telemetry;
pub mod thread_pool;

pub use config::{CliArgs, ServerConfig};
pub use connection::ConnectionHandler;
pub use error::{Error, Result};
pub use protocol::{Request, Response};
pub use runner::{FirewallRunner, RequestHandler};
pub use server::{Server, ShutdownHandle};
pub use session::{Job, Session, SessionPool};
pub use thread_pool::{JobHandler, PoolStats, ThreadPool};
