#[cfg(feature = "timings")]
use std::time::Instant;

#[cfg(feature = "timings")]
pub(crate) fn time_block<T, F>(label: &'static str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    let value = f();
    let elapsed = start.elapsed();
    tracing::info!(target: "timings", %label, elapsed_ms = elapsed.as_secs_f64() * 1e3);
    value
}

#[cfg(not(feature = "timings"))]
pub(crate) fn time_block<T, F>(_: &'static str, f: F) -> T
where
    F: FnOnce() -> T,
{
    f()
}

/// Install a formatting subscriber so stage timings reach stderr.
///
/// `RUST_LOG` takes precedence over `default_filter`. Returns `false` when a
/// global subscriber was already set.
#[cfg(feature = "timings")]
pub fn init_subscriber(default_filter: &str) -> bool {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
