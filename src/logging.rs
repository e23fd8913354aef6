//! Tracing setup for embedding applications and tests.
//!
//! The engine itself only emits `tracing` events; installing a subscriber
//! is the consumer's choice. This helper wires up the conventional one:
//! env-filtered, compact by default, with thread names in verbose mode
//! (phase execution is worker-threaded, so they matter there).

use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

/// Check if colored output should be used: stdout is a terminal and
/// `NO_COLOR` is not set.
fn use_color() -> bool {
    std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

/// Initialize the global tracing subscriber.
///
/// Filter precedence: `RUST_LOG` when set, otherwise `galley=debug` in
/// verbose mode and `galley=info` in compact mode. Returns an error when a
/// global subscriber is already installed.
pub fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("galley=debug,info")
            } else {
                EnvFilter::try_new("galley=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(use_color())
        .with_target(verbose);

    if verbose {
        builder.with_thread_names(true).try_init()?;
    } else {
        builder.compact().try_init()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_enough_for_tests() {
        // First call may succeed or fail depending on test ordering; the
        // second must fail cleanly rather than panic.
        let _ = init_tracing(false);
        assert!(init_tracing(true).is_err());
    }
}
