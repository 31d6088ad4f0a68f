use tracing::dispatcher;
use tracing_subscriber::fmt::time;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Targets the built-in filter covers: this crate and the pairing
/// backend, which logs share verification and DKG phase progress.
const LOG_TARGETS: [&str; 2] = [env!("CARGO_PKG_NAME"), "energon"];

/// Installs the global subscriber once. An explicit `RUST_LOG` wins;
/// otherwise every target in [`LOG_TARGETS`] is filtered at the same
/// level, `debug` when verbose and `info` otherwise.
pub fn setup_tracing(verbose: bool) -> anyhow::Result<()> {
    if !dispatcher::has_been_set() {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(env_filter) => env_filter,
            Err(_) => {
                let level = if verbose { "debug" } else { "info" };
                let directives = LOG_TARGETS
                    .iter()
                    .map(|target| format!("{target}={level}"))
                    .collect::<Vec<_>>()
                    .join(",");
                EnvFilter::builder().parse_lossy(directives)
            }
        };

        let layer = tracing_subscriber::fmt::layer()
            .with_timer(time::time())
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(layer)
            .with(filter)
            .try_init()?;
    }

    Ok(())
}
