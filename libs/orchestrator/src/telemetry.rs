use crate::error::{Error, Result};

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => "text".fmt(f),
            LogFormat::Json => "json".fmt(f),
        }
    }
}

/// Install the global tracing subscriber.
pub fn init(filter: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_new(filter)
        .map_err(|e| Error::InvalidArgument(format!("invalid log filter {filter}: {e}")))?;
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .flatten_event(true)
            .init(),
    }
    Ok(())
}
