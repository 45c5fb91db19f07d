//! Log output setup.
//!
//! `RUST_LOG` takes precedence when set; otherwise the level chosen on the
//! command line applies. Thread names are printed so acceptor, dispatcher and
//! worker lines can be told apart.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_logging(level: LevelFilter) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_names(true)
                .with_target(false),
        )
        .try_init()?;
    Ok(())
}
