use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use volumetric_cache::config::{Config, LogFormat};
use volumetric_cache::logging::init_json_logging;

/// Crates that log at the configured level when it is `debug` or `trace`.
///
/// Everything else stays at `INFO`, so dependencies do not flood the output.
const OWN_CRATES: &[&str] = &["volumetric_cache", "volumetric_stress"];

/// The `RUST_LOG` directives used when the variable is not set.
fn default_directives(level: LevelFilter) -> String {
    match level {
        LevelFilter::OFF => String::new(),
        level if level <= LevelFilter::INFO => level.to_string(),
        level => std::iter::once("INFO".to_owned())
            .chain(OWN_CRATES.iter().map(|krate| format!("{krate}={level}")))
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Installs the global subscriber of the stresstest.
///
/// `RUST_LOG` takes precedence over the configured level. With
/// [`enable_backtraces`](volumetric_cache::config::Logging::enable_backtraces), `RUST_BACKTRACE`
/// is set as well. Errors become Sentry events, `INFO` and `WARN` become breadcrumbs.
///
/// # Safety
/// Modifies the environment through [`std::env::set_var`], so this must run before any other
/// thread is spawned.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: no other threads exist yet, as documented above.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let directives =
        env::var("RUST_LOG").unwrap_or_else(|_| default_directives(config.logging.level));

    let pretty = match config.logging.format {
        LogFormat::Json => {
            init_json_logging(&directives, std::io::stdout);
            return;
        }
        LogFormat::Auto => console::user_attended(),
        LogFormat::Pretty => true,
        LogFormat::Simplified => false,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let fmt_layer = if pretty {
        layer.pretty().boxed()
    } else {
        layer.compact().with_ansi(false).boxed()
    };

    let sentry_layer = sentry::integrations::tracing::layer().event_filter(|md| {
        match *md.level() {
            Level::ERROR => EventFilter::Event,
            Level::WARN | Level::INFO => EventFilter::Breadcrumb,
            Level::DEBUG | Level::TRACE => EventFilter::Ignore,
        }
    });

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(&directives)))
        .with(sentry_layer)
        .init();
}

/// Reports a fatal error, falling back to `stderr` when errors would not be logged.
pub fn ensure_log_error(error: &anyhow::Error) {
    let logged = Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && Level::ERROR <= LevelFilter::current();
    if logged {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
