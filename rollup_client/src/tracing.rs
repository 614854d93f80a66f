use tracing_subscriber::{
    filter::LevelFilter, prelude::*, util::TryInitError, EnvFilter,
};

/// Installs a plain-text subscriber as the global default. `RUST_LOG`
/// selects what is shown. Without it only warnings and errors are.
///
/// Fails if a global subscriber is already installed.
pub fn init() -> Result<(), TryInitError> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_filter(filter),
        )
        .try_init()
}
