use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_ENV: &str = "SNAPBACK_LOG";

/// Filter directive for the terminal: `SNAPBACK_LOG` wins, then `--verbose`.
pub fn console_directive(env_value: Option<&str>, verbose: bool) -> String {
    match env_value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value.to_string(),
        None if verbose => "debug".to_string(),
        None => "info".to_string(),
    }
}

pub fn init_logging(verbose: bool, debuglog: Option<&Path>) -> Result<()> {
    let env_value = std::env::var(LOG_ENV).ok();
    let directive = console_directive(env_value.as_deref(), verbose);
    let console_filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid {LOG_ENV} filter: '{directive}'"))?;
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let file = match debuglog {
        Some(path) => {
            let handle = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open debug log: {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(handle))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("failed to install log subscriber")?;
    Ok(())
}
