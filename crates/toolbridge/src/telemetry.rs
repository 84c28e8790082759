//! Tracing setup for hosts embedding the bridge.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Target carrying child process stderr lines.
pub const STDERR_TARGET: &str = "toolbridge::stderr";

fn base_level(raw: Option<&str>) -> &'static str {
    match raw {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

/// Filter used when `RUST_LOG` is unset. Child stderr is only shown at debug.
fn default_filter(level: &str) -> String {
    let stderr_level = match level {
        "trace" | "debug" => level,
        _ => "off",
    };
    format!("toolbridge={level},{STDERR_TARGET}={stderr_level}")
}

/// Initialize tracing with TOOLBRIDGE_LOG and LOG_FORMAT support.
///
/// `RUST_LOG` takes precedence when set. Does nothing if a global subscriber
/// is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("TOOLBRIDGE_LOG").ok().as_deref());
        EnvFilter::new(default_filter(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

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
