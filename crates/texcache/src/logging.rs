use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};

/// Crates whose logs follow the configured level below `INFO`.
const OWN_CRATES: &[&str] = &["texcache", "texcache_stress"];

/// The default `RUST_LOG` directive for `level`.
///
/// Dependencies never log below `INFO`.
fn default_directive(level: LevelFilter) -> String {
    match level {
        LevelFilter::OFF => String::new(),
        level if level <= LevelFilter::INFO => level.to_string(),
        level => std::iter::once("INFO".to_owned())
            .chain(OWN_CRATES.iter().map(|name| format!("{name}={level}")))
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Resolves [`LogFormat::Auto`] depending on whether a user watches the output.
fn resolve_format(format: LogFormat, attended: bool) -> LogFormat {
    match format {
        LogFormat::Auto if attended => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    }
}

/// Installs a JSON-lines subscriber writing to `make_writer`.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}

/// Initializes logging.
///
/// `RUST_LOG` wins over the configured level. Backtraces are forced on when
/// [`enable_backtraces`](crate::config::Logging::enable_backtraces) is set.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log =
        env::var("RUST_LOG").unwrap_or_else(|_| default_directive(config.logging.level));

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let fmt_layer = match resolve_format(config.logging.format, console::user_attended()) {
        LogFormat::Json => {
            init_json_logging(&rust_log, std::io::stdout);
            return;
        }
        LogFormat::Pretty => layer.pretty().boxed(),
        _ => layer.compact().with_ansi(false).boxed(),
    }
    .with_filter(EnvFilter::new(&rust_log));

    // errors become sentry events, warnings and infos breadcrumbs
    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(LevelFilter::OFF), "");
        assert_eq!(default_directive(LevelFilter::WARN), "WARN");
        assert_eq!(default_directive(LevelFilter::INFO), "INFO");
        assert_eq!(
            default_directive(LevelFilter::DEBUG),
            "INFO,texcache=DEBUG,texcache_stress=DEBUG"
        );

        // the directive is accepted by the filter
        let filter = EnvFilter::new(default_directive(LevelFilter::TRACE));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_resolve_format() {
        assert_eq!(resolve_format(LogFormat::Auto, true), LogFormat::Pretty);
        assert_eq!(resolve_format(LogFormat::Auto, false), LogFormat::Simplified);
        assert_eq!(resolve_format(LogFormat::Json, true), LogFormat::Json);
        assert_eq!(resolve_format(LogFormat::Pretty, false), LogFormat::Pretty);
    }
}
