//! Tracing initialization.
//!
//! Logs go to stderr so the run summary on stdout stays readable. The level
//! is taken from `RUST_LOG` and defaults to `info`:
//!
//! ```bash
//! RUST_LOG=chatsoul_core=debug chatsoul run
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

pub fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(create_fmt_layer())
        .with(create_env_filter()?)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))
}

fn create_env_filter() -> anyhow::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {e}"))
}

fn create_fmt_layer() -> impl Layer<Registry> + Send + Sync {
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
}
