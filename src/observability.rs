use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber, honoring `RUST_LOG` and
/// defaulting to `info`. Later calls are no-ops, so embedders and tests
/// can call this unconditionally.
pub fn init_tracing() {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
