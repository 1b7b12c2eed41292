//! Logging setup. A trimmed-down version of the teacher's tracing
//! bootstrap: structured `fmt` output gated by `RUST_LOG`, no OpenTelemetry
//! export since this core has no admin UI to ship spans to.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber. Call once at process start.
pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();
}
