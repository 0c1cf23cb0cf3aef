// Logging module — powered by tracing-subscriber
//
// A compatibility bridge (`tracing_log::LogTracer`) captures the `log::*`
// macro calls the library crates emit and routes them through the tracing
// subscriber, so one filter configuration governs everything.

use crate::config::LoggingSettings;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Build the `EnvFilter` from the base level, hardcoded noisy-crate
/// overrides, and optional per-target overrides from config.
fn build_env_filter(
    level: &str,
    target_levels: &HashMap<String, String>,
) -> anyhow::Result<EnvFilter> {
    let mut directives = vec![level.to_string()];

    // Suppress noisy third-party crates
    let noisy: &[(&str, &str)] = &[
        ("actix_server", "warn"),
        ("actix_web", "warn"),
        ("h2", "warn"),
        ("hyper", "warn"),
        ("sqlx", "warn"),
        ("tracing", "warn"),
    ];
    for (target, lvl) in noisy {
        directives.push(format!("{}={}", target, lvl));
    }
    for (target, lvl) in target_levels {
        directives.push(format!("{}={}", target, lvl));
    }

    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", filter_str, e))
}

/// Initialize logging based on configuration:
///  - colored console layer (when `log_to_console` is true)
///  - optional file layer (compact text or JSON lines)
///  - `tracing_log::LogTracer` bridge for `log::*` calls
pub fn init_logging(settings: &LoggingSettings) -> anyhow::Result<()> {
    // ok() in case already initialized (tests)
    tracing_log::LogTracer::init().ok();

    let console_layer = if settings.log_to_console {
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_target(true)
                .with_filter(build_env_filter(&settings.level, &settings.targets)?),
        )
    } else {
        None
    };

    let file_layer = match &settings.file_path {
        Some(path) => {
            if let Some(parent) = Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            let log_file = OpenOptions::new().create(true).append(true).open(path)?;
            let layer = if settings.format == "json" {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(log_file)
                    .with_target(true)
                    .with_filter(build_env_filter(&settings.level, &settings.targets)?)
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(log_file)
                    .with_target(true)
                    .with_filter(build_env_filter(&settings.level, &settings.targets)?)
                    .boxed()
            };
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}
