//! The closed set of runtime configuration keys held in the `config` table.
//!
//! Each key has a declared type and a default; values round-trip through
//! string serialization losslessly. Unknown keys are rejected.
use crate::{logger, Error, Result};
use tracing::Level;

/// Bumped when a new migration is added.
pub const CURRENT_SCHEMA_VERSION: i64 = 20240206;

pub const THEMES: &[&str] = &["default", "pink", "blue", "dark", "light"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    Str,
    Int,
    Bool,
    LogLevel,
}

impl ConfigType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::LogLevel => "loglevel",
        }
    }
}

pub const CONFIG_DEFAULTS: &[(&str, ConfigType, &str)] = &[
    ("schema-version", ConfigType::Int, "20240206"),
    ("private-key", ConfigType::Str, ""),
    ("approval-required", ConfigType::Bool, "false"),
    ("whitelist-enabled", ConfigType::Bool, "false"),
    ("log-level", ConfigType::LogLevel, "INFO"),
    ("name", ConfigType::Str, "FediRelay"),
    ("note", ConfigType::Str, "Make a note about your instance here."),
    ("theme", ConfigType::Str, "default"),
];

pub fn default_type(key: &str) -> Result<ConfigType> {
    CONFIG_DEFAULTS
        .iter()
        .find(|(k, _, _)| *k == key)
        .map(|(_, ty, _)| *ty)
        .ok_or_else(|| Error::UnknownConfigKey {
            key: key.to_owned(),
        })
}

pub fn default_value(key: &str) -> Result<&'static str> {
    CONFIG_DEFAULTS
        .iter()
        .find(|(k, _, _)| *k == key)
        .map(|(_, _, default)| *default)
        .ok_or_else(|| Error::UnknownConfigKey {
            key: key.to_owned(),
        })
}

/// Parse a boolean the way fediverse admins tend to write them.
pub fn boolean(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "on" | "y" | "yes" | "true" | "enable" | "enabled" | "1" => Ok(true),
        "off" | "n" | "no" | "false" | "disable" | "disabled" | "0" => Ok(false),
        _ => Err(Error::InvalidConfigValue {
            key: String::new(),
            value: value.to_owned(),
        }),
    }
}

/// Validate and canonicalize a raw value for storage under `key`.
pub fn coerce(key: &str, value: &str) -> Result<String> {
    let invalid = || Error::InvalidConfigValue {
        key: key.to_owned(),
        value: value.to_owned(),
    };

    match default_type(key)? {
        ConfigType::Str => {
            if key == "theme" && !THEMES.contains(&value) {
                return Err(invalid());
            }

            Ok(value.to_owned())
        }

        ConfigType::Int => value
            .parse::<i64>()
            .map(|n| n.to_string())
            .map_err(|_| invalid()),

        ConfigType::Bool => boolean(value).map(|b| b.to_string()),

        ConfigType::LogLevel => logger::parse_level(value).map(|l| l.to_string()),
    }
}

/// The fully materialized runtime configuration, with defaults filled in for
/// keys that were never written.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub schema_version: i64,
    pub private_key: Option<String>,
    pub approval_required: bool,
    pub whitelist_enabled: bool,
    pub log_level: Level,
    pub name: String,
    pub note: String,
    pub theme: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            // a missing schema-version row means an uninitialized database
            schema_version: 0,
            private_key: None,
            approval_required: false,
            whitelist_enabled: false,
            log_level: Level::INFO,
            name: "FediRelay".to_owned(),
            note: "Make a note about your instance here.".to_owned(),
            theme: "default".to_owned(),
        }
    }
}

impl RelaySettings {
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "schema-version" => {
                self.schema_version = value.parse().map_err(|_| Error::InvalidConfigValue {
                    key: key.to_owned(),
                    value: value.to_owned(),
                })?
            }
            "private-key" => {
                self.private_key = (!value.is_empty()).then(|| value.to_owned());
            }
            "approval-required" => self.approval_required = boolean(value)?,
            "whitelist-enabled" => self.whitelist_enabled = boolean(value)?,
            "log-level" => self.log_level = logger::parse_level(value)?,
            "name" => self.name = value.to_owned(),
            "note" => self.note = value.to_owned(),
            "theme" => self.theme = value.to_owned(),
            _ => {
                return Err(Error::UnknownConfigKey {
                    key: key.to_owned(),
                })
            }
        }

        Ok(())
    }
}
