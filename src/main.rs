use anyhow::Context;
use clap::Parser;
use tracing::info;

use gatekeep::config::{CliArgs, ServerConfig};
use gatekeep::connection::ConnectionHandler;
use gatekeep::runner::FirewallRunner;
use gatekeep::server::Server;
use gatekeep::{metrics, signal, telemetry};

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args).context("invalid configuration")?;
    telemetry::init_logging(config.log_level)?;

    // Every thread spawned from here on inherits the blocked mask.
    signal::block_sigint().context("failed to block SIGINT")?;
    metrics::spawn_reporter();

    let runner = FirewallRunner::new(config.firewall_cmd.clone(), config.chain.clone());
    info!(
        "Firewall program {:?}, chain {:?}",
        config.firewall_cmd, config.chain
    );
    let handler = ConnectionHandler::new(runner, config.recv_timeout);
    let server = Server::bind(&config, handler).context("failed to start server")?;

    let watcher = signal::spawn_sigint_watcher(server.shutdown_handle())?;
    server.run();
    server.shutdown();

    if watcher.received() {
        watcher.join();
        signal::reraise().context("failed to re-raise SIGINT")?;
    }
    Ok(())
}
