use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use gatekeep::config::{DEFAULT_HOST, DEFAULT_PORT, MAX_FRAME_SIZE};
use gatekeep::protocol::{self, Request, Response};

#[derive(Parser)]
#[command(about = "Test client for the gatekeep server")]
struct Args {
    /// Server host
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one request and print the response
    Send {
        /// append or remove
        #[arg(short, long)]
        method: String,
        /// Host address the rule applies to
        #[arg(short, long)]
        ip: String,
    },
    /// Open many short-lived connections concurrently and report throughput
    Bench {
        /// Number of concurrent client threads
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Sequential requests (one connection each) per thread
        #[arg(short, long, default_value_t = 100)]
        requests: usize,
        /// Method sent with every request
        #[arg(short, long, default_value = "append")]
        method: String,
    },
}

fn exchange(addr: &str, request: &Request) -> anyhow::Result<Response> {
    let mut stream =
        TcpStream::connect(addr).with_context(|| format!("failed to connect to {addr}"))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.write_all(protocol::compose_request(request).as_bytes())?;
    stream.shutdown(Shutdown::Write)?;

    let mut buf = Vec::with_capacity(MAX_FRAME_SIZE);
    stream.read_to_end(&mut buf)?;
    if buf.is_empty() {
        anyhow::bail!("server closed the connection without a response");
    }
    let text = String::from_utf8_lossy(&buf);
    protocol::parse_response(&text).with_context(|| format!("bad response {text:?}"))
}

fn send(addr: &str, method: String, ip: String) -> anyhow::Result<()> {
    let response = exchange(addr, &Request::new(method, ip))?;
    println!("code={} reason={}", response.code, response.reason);
    if !response.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}

fn bench(addr: &str, num_threads: usize, requests_per_thread: usize, method: String) {
    eprintln!(
        "bench: {} threads x {} connections to {}",
        num_threads, requests_per_thread, addr
    );
    let failures = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let addr = addr.to_string();
            let method = method.clone();
            let failures = Arc::clone(&failures);
            let rejected = Arc::clone(&rejected);
            std::thread::spawn(move || {
                for i in 0..requests_per_thread {
                    // 10.<thread>.<hi>.<lo> keeps every host distinct.
                    let ip = format!("10.{}.{}.{}", t % 256, (i / 256) % 256, i % 256);
                    match exchange(&addr, &Request::new(method.as_str(), ip)) {
                        Ok(response) if response.is_ok() => {}
                        Ok(_) => {
                            rejected.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            failures.fetch_add(1, Ordering::Relaxed);
                            eprintln!("  request failed: {e:#}");
                        }
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    let elapsed = start.elapsed();
    let total = num_threads * requests_per_thread;
    eprintln!(
        "bench: {} requests in {:.2}s = {:.0} req/s, {} rejected, {} failed",
        total,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64(),
        rejected.load(Ordering::Relaxed),
        failures.load(Ordering::Relaxed)
    );
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    match args.command {
        Command::Send { method, ip } => send(&addr, method, ip)?,
        Command::Bench {
            connections,
            requests,
            method,
        } => bench(&addr, connections, requests, method),
    }
    Ok(())
}
