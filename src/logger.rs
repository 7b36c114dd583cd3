//! Tracing setup with a reloadable filter so the log level can be changed at
//! runtime through `put_config("log-level", ..)`.
use crate::{Error, Result};
use std::{env, fs::OpenOptions, str::FromStr, sync::Arc};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

#[derive(Clone)]
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: Level) -> Result<()> {
        self.handle
            .reload(EnvFilter::new(level.to_string()))
            .map_err(|e| Error::key(format!("unable to update log level: {e}")))
    }
}

pub fn parse_level(value: &str) -> Result<Level> {
    Level::from_str(value).map_err(|_| Error::InvalidConfigValue {
        key: "log-level".to_owned(),
        value: value.to_owned(),
    })
}

/// Initialise the global subscriber. `LOG_LEVEL` overrides the given level
/// and `LOG_FILE` redirects output to a file.
pub fn init(level: Level) -> Result<LogHandle> {
    let level = match env::var("LOG_LEVEL") {
        Ok(raw) => parse_level(&raw)?,
        Err(_) => level,
    };

    let (filter, handle) = reload::Layer::new(EnvFilter::new(level.to_string()));

    match env::var("LOG_FILE") {
        Ok(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .init();
        }

        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }

    Ok(LogHandle { handle })
}
