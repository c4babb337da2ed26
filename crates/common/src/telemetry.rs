//! Logging initialization.
//!
//! Stdout logging is filtered through `RUST_LOG`. When JSON files are enabled,
//! selected tracing targets are additionally written to daily rolling files:
//!
//! | target    | file            |
//! |-----------|-----------------|
//! | `queries` | `queries.jsonl` |
//! | `cache`   | `cache.jsonl`   |
//! | `jobs`    | `jobs.jsonl`    |
//! | `errors`  | `errors.jsonl`  |
//! | `audit`   | `audit.jsonl`   |

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingSettings;

const JSON_TARGETS: [(&str, &str); 5] = [
    ("queries", "queries.jsonl"),
    ("cache", "cache.jsonl"),
    ("jobs", "jobs.jsonl"),
    ("errors", "errors.jsonl"),
    ("audit", "audit.jsonl"),
];

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let mut layers: Vec<BoxedLayer> = vec![tracing_subscriber::fmt::layer()
        .with_filter(EnvFilter::from_default_env())
        .boxed()];

    if settings.json_files {
        std::fs::create_dir_all(&settings.directory)
            .with_context(|| format!("Failed to create log directory {}", settings.directory))?;

        for (target, file) in JSON_TARGETS {
            let appender = tracing_appender::rolling::daily(&settings.directory, file);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(appender)
                    .with_filter(tracing_subscriber::filter::filter_fn(move |metadata| {
                        metadata.target() == target
                    }))
                    .boxed(),
            );
        }
    }

    // A second init (tests, embedded servers) keeps the first subscriber.
    tracing_subscriber::registry().with(layers).try_init().ok();
    Ok(())
}
