//! Request handling: validate the request and run the firewall command.

use std::net::Ipv4Addr;
use std::process::Command;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    CODE_EXECUTION_ERROR, CODE_INVALID_HOST, CODE_INVALID_METHOD, Request, Response,
};

/// Computes a response for one parsed request.
///
/// `Err` means the handler itself failed; the connection handler turns it into
/// a generic error response, so the peer always gets an answer.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: &Request) -> Result<Response>;
}

impl<F> RequestHandler for F
where
    F: Fn(&Request) -> Result<Response> + Send + Sync + 'static,
{
    fn handle(&self, request: &Request) -> Result<Response> {
        self(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Append,
    Remove,
}

impl Method {
    fn parse(method: &str) -> Option<Self> {
        match method {
            "append" => Some(Self::Append),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }

    fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Remove => "-D",
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            Self::Append => "added",
            Self::Remove => "removed",
        }
    }
}

/// Accepts or revokes forwarding for a host by invoking an iptables-compatible
/// program: `<program> -A|-D <chain> -s <ip> -j ACCEPT`.
#[derive(Debug, Clone)]
pub struct FirewallRunner {
    program: String,
    chain: String,
}

impl FirewallRunner {
    pub fn new(program: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            chain: chain.into(),
        }
    }

    fn validate(request: &Request) -> core::result::Result<(Method, Ipv4Addr), Response> {
        let method = Method::parse(&request.method).ok_or_else(|| {
            Response::new(
                CODE_INVALID_METHOD,
                format!("Invalid method \"{}\"", request.method),
            )
        })?;
        if request.ip.is_empty() {
            return Err(Response::new(
                CODE_INVALID_HOST,
                "Host address must be specified",
            ));
        }
        let ip = request.ip.parse::<Ipv4Addr>().map_err(|_| {
            Response::new(
                CODE_INVALID_HOST,
                format!("Invalid host address \"{}\"", request.ip),
            )
        })?;
        Ok((method, ip))
    }

    fn run(&self, method: Method, ip: Ipv4Addr) -> Result<Response> {
        let ip_arg = ip.to_string();
        let args: [&str; 6] = [
            method.flag(),
            self.chain.as_str(),
            "-s",
            ip_arg.as_str(),
            "-j",
            "ACCEPT",
        ];
        info!("Execute command: {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| Error::Command {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(Response::ok(format!(
                "Host {ip} has been {}",
                method.past_tense()
            )));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(
            "Return-code: {}; stdout: {:?}; stderr: {:?}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            stderr
        );
        if method == Method::Remove && stderr.contains("does a matching rule exist") {
            return Ok(Response::new(
                CODE_EXECUTION_ERROR,
                format!("No matching rule exists for host {ip}"),
            ));
        }
        Err(Error::CommandFailed {
            program: self.program.clone(),
            status: output.status,
            stderr,
        })
    }
}

impl RequestHandler for FirewallRunner {
    fn handle(&self, request: &Request) -> Result<Response> {
        match Self::validate(request) {
            Ok((method, ip)) => self.run(method, ip),
            Err(rejected) => Ok(rejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CODE_OK;

    #[test]
    fn append_success_reports_added_host() {
        let runner = FirewallRunner::new("true", "FORWARD");
        let resp = runner
            .handle(&Request::new("append", "10.0.0.1"))
            .expect("handle");
        assert_eq!(resp.code, CODE_OK);
        assert!(resp.reason.contains("10.0.0.1"));
        assert!(resp.reason.contains("added"));
    }

    #[test]
    fn remove_success_reports_removed_host() {
        let runner = FirewallRunner::new("true", "FORWARD");
        let resp = runner
            .handle(&Request::new("remove", "10.0.0.2"))
            .expect("handle");
        assert_eq!(resp, Response::ok("Host 10.0.0.2 has been removed"));
    }

    #[test]
    fn unknown_method_is_rejected_by_name() {
        // `false` would fail if it were ever executed.
        let runner = FirewallRunner::new("false", "FORWARD");
        let resp = runner
            .handle(&Request::new("bogus", "10.0.0.1"))
            .expect("handle");
        assert_eq!(resp.code, CODE_INVALID_METHOD);
        assert!(resp.reason.contains("bogus"));
    }

    #[test]
    fn missing_host_is_rejected() {
        let runner = FirewallRunner::new("false", "FORWARD");
        let resp = runner
            .handle(&Request::new("append", ""))
            .expect("handle");
        assert_eq!(resp.code, CODE_INVALID_HOST);
    }

    #[test]
    fn invalid_host_is_rejected() {
        let runner = FirewallRunner::new("false", "FORWARD");
        for ip in ["10.0.0", "256.1.1.1", "example.com", "10.0.0.1; rm -rf /"] {
            let resp = runner
                .handle(&Request::new("append", ip))
                .expect("handle");
            assert_eq!(resp.code, CODE_INVALID_HOST, "ip {ip:?}");
            assert!(resp.reason.contains(ip));
        }
    }

    #[test]
    fn failing_command_is_an_error() {
        let runner = FirewallRunner::new("false", "FORWARD");
        let err = runner
            .handle(&Request::new("append", "10.0.0.1"))
            .expect_err("false exits non-zero");
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn missing_program_is_an_error() {
        let runner = FirewallRunner::new("/nonexistent/gatekeep-iptables", "FORWARD");
        let err = runner
            .handle(&Request::new("remove", "10.0.0.1"))
            .expect_err("program does not exist");
        assert!(matches!(err, Error::Command { .. }));
    }

    #[test]
    fn closures_are_request_handlers() {
        let echo = |req: &Request| -> Result<Response> { Ok(Response::ok(req.ip.clone())) };
        let resp = echo
            .handle(&Request::new("append", "1.2.3.4"))
            .expect("handle");
        assert_eq!(resp.reason, "1.2.3.4");
    }
}
