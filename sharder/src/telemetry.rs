//! Tracing setup shared by the manager and worker processes.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level for sharder targets when `RUST_LOG` is unset.
pub const ENV_LOG: &str = "SHARDER_LOG";

/// `json` switches to structured output.
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn default_directives(level: &str) -> String {
    format!("sharder={level},sharder_demo={level},sharder::bridge::codec=warn")
}

/// Initialize tracing to stderr, honoring `RUST_LOG`, `SHARDER_LOG` and `LOG_FORMAT`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(std::env::var(ENV_LOG).ok().as_deref());
        EnvFilter::new(default_directives(level))
    };

    let use_json = std::env::var(ENV_LOG_FORMAT).as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
