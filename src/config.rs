//! Server sizing and operational configuration.
//!
//! Everything is fixed at startup. Wire constants that are not tunable live
//! here as plain consts; the rest comes from the command line or environment.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::error::{Error, Result};

/// Largest request frame read from a connection (bytes).
pub const MAX_FRAME_SIZE: usize = 1024;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// Idle time allowed before a connection that has not sent its request is dropped.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Acceptor sleep between attempts while no free slot is available.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);

pub const LISTEN_BACKLOG: i32 = 128;

#[derive(Parser, Debug, Clone)]
#[command(about = "Threaded TCP service that manages firewall forwarding rules")]
pub struct CliArgs {
    /// Address to listen on.
    #[arg(long, env = "GATEKEEP_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, env = "GATEKEEP_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of worker threads handling connections.
    #[arg(short, long, env = "GATEKEEP_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Number of pre-allocated connection slots (and queue depth).
    #[arg(short, long, env = "GATEKEEP_QUEUE_SIZE", default_value_t = DEFAULT_QUEUE_SIZE)]
    pub queue_size: usize,

    /// Seconds to wait for a client to send its request.
    #[arg(long, env = "GATEKEEP_RECV_TIMEOUT_SECS", default_value_t = DEFAULT_RECV_TIMEOUT.as_secs())]
    pub recv_timeout_secs: u64,

    /// Milliseconds the acceptor sleeps while every slot is busy.
    #[arg(long, env = "GATEKEEP_BACKOFF_MS", default_value_t = DEFAULT_BACKOFF.as_millis() as u64)]
    pub backoff_ms: u64,

    /// Program invoked to change firewall rules.
    #[arg(long, env = "GATEKEEP_FIREWALL_CMD", default_value = "iptables")]
    pub firewall_cmd: String,

    /// Chain the rules are appended to / removed from.
    #[arg(long, env = "GATEKEEP_CHAIN", default_value = "FORWARD")]
    pub chain: String,

    /// Enable debug logging.
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub workers: usize,
    pub queue_size: usize,
    pub recv_timeout: Duration,
    pub backoff: Duration,
    pub firewall_cmd: String,
    pub chain: String,
    pub log_level: LevelFilter,
}

impl ServerConfig {
    /// Defaults for everything but the listen address.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            workers: DEFAULT_WORKERS,
            queue_size: DEFAULT_QUEUE_SIZE,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
            firewall_cmd: "iptables".to_string(),
            chain: "FORWARD".to_string(),
            log_level: LevelFilter::INFO,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers < 1 {
            return Err(Error::InvalidWorkerCount(self.workers));
        }
        if self.queue_size < 1 {
            return Err(Error::InvalidCapacity(self.queue_size));
        }
        if self.recv_timeout.is_zero() {
            return Err(Error::ZeroRecvTimeout);
        }
        Ok(())
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let invalid = |reason: String| Error::InvalidAddress {
        addr: format!("{host}:{port}"),
        reason,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("no addresses found".to_string()))
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = Error;

    fn try_from(args: CliArgs) -> Result<Self> {
        let config = Self {
            listen_addr: resolve(&args.host, args.port)?,
            workers: args.workers,
            queue_size: args.queue_size,
            recv_timeout: Duration::from_secs(args.recv_timeout_secs),
            backoff: Duration::from_millis(args.backoff_ms),
            firewall_cmd: args.firewall_cmd,
            chain: args.chain,
            log_level: if args.debug {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("gatekeep").chain(args.iter().copied()))
            .expect("valid args")
    }

    #[test]
    fn defaults_match_constants() {
        let config = ServerConfig::try_from(parse(&[])).expect("config");
        assert_eq!(config.listen_addr, "127.0.0.1:5555".parse().unwrap());
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.queue_size, DEFAULT_QUEUE_SIZE);
        assert_eq!(config.recv_timeout, DEFAULT_RECV_TIMEOUT);
        assert_eq!(config.backoff, DEFAULT_BACKOFF);
        assert_eq!(config.firewall_cmd, "iptables");
        assert_eq!(config.chain, "FORWARD");
        assert_eq!(config.log_level, LevelFilter::INFO);
    }

    #[test]
    fn flags_override_defaults() {
        let config = ServerConfig::try_from(parse(&[
            "--host",
            "0.0.0.0",
            "-p",
            "6000",
            "-w",
            "2",
            "-q",
            "8",
            "--recv-timeout-secs",
            "1",
            "--backoff-ms",
            "50",
            "--firewall-cmd",
            "/sbin/iptables",
            "--chain",
            "INPUT",
            "--debug",
        ]))
        .expect("config");
        assert_eq!(config.listen_addr, "0.0.0.0:6000".parse().unwrap());
        assert_eq!((config.workers, config.queue_size), (2, 8));
        assert_eq!(config.recv_timeout, Duration::from_secs(1));
        assert_eq!(config.backoff, Duration::from_millis(50));
        assert_eq!(config.firewall_cmd, "/sbin/iptables");
        assert_eq!(config.chain, "INPUT");
        assert_eq!(config.log_level, LevelFilter::DEBUG);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(matches!(
            ServerConfig::try_from(parse(&["--workers", "0"])),
            Err(Error::InvalidWorkerCount(0))
        ));
        assert!(matches!(
            ServerConfig::try_from(parse(&["--queue-size", "0"])),
            Err(Error::InvalidCapacity(0))
        ));
    }

    #[test]
    fn zero_recv_timeout_is_rejected() {
        assert!(matches!(
            ServerConfig::try_from(parse(&["--recv-timeout-secs", "0"])),
            Err(Error::ZeroRecvTimeout)
        ));

        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.recv_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::ZeroRecvTimeout)));
    }

    #[test]
    fn unresolvable_host_is_rejected() {
        assert!(matches!(
            ServerConfig::try_from(parse(&["--host", "not a host name"])),
            Err(Error::InvalidAddress { .. })
        ));
    }
}
