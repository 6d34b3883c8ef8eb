use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use flow_core::{
    config::{DEFAULT_EQUIVALENT, DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_VISIBLE},
    FlowOptions, RoutingMode,
};
use serde::Deserialize;
use shared::domain::{EquivalentCode, ParticipantId};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "flowctl.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub equivalent: String,
    pub max_hops: u8,
    pub history_capacity: usize,
    pub history_visible: usize,
    pub request_timeout_ms: Option<u64>,
    pub actor: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:18000/api/v1".into(),
            equivalent: DEFAULT_EQUIVALENT.into(),
            max_hops: 1,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_visible: DEFAULT_HISTORY_VISIBLE,
            request_timeout_ms: None,
            actor: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    server_url: Option<String>,
    equivalent: Option<String>,
    max_hops: Option<u8>,
    history_capacity: Option<usize>,
    history_visible: Option<usize>,
    request_timeout_ms: Option<u64>,
    actor: Option<String>,
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub server_url: Option<String>,
    pub equivalent: Option<String>,
    pub max_hops: Option<u8>,
    pub request_timeout_ms: Option<u64>,
}

impl Settings {
    pub fn flow_options(&self) -> FlowOptions {
        FlowOptions {
            equivalent: EquivalentCode::new(self.equivalent.clone()),
            routing: RoutingMode::from_max_hops(self.max_hops),
            history_capacity: self.history_capacity,
            history_visible: self.history_visible,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn actor(&self) -> Option<ParticipantId> {
        self.actor.as_deref().map(ParticipantId::new)
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.server_url {
            self.server_url = v;
        }
        if let Some(v) = file.equivalent {
            self.equivalent = v;
        }
        if let Some(v) = file.max_hops {
            self.max_hops = v;
        }
        if let Some(v) = file.history_capacity {
            self.history_capacity = v;
        }
        if let Some(v) = file.history_visible {
            self.history_visible = v;
        }
        if let Some(v) = file.request_timeout_ms {
            self.request_timeout_ms = Some(v);
        }
        if let Some(v) = file.actor {
            self.actor = Some(v);
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), SettingsError> {
        if let Some(v) = env("FLOWCTL_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = env("FLOWCTL_EQUIVALENT") {
            self.equivalent = v;
        }
        if let Some(v) = env("FLOWCTL_MAX_HOPS") {
            self.max_hops = parse_number("FLOWCTL_MAX_HOPS", &v)?;
        }
        if let Some(v) = env("FLOWCTL_HISTORY_CAPACITY") {
            self.history_capacity = parse_number("FLOWCTL_HISTORY_CAPACITY", &v)?;
        }
        if let Some(v) = env("FLOWCTL_HISTORY_VISIBLE") {
            self.history_visible = parse_number("FLOWCTL_HISTORY_VISIBLE", &v)?;
        }
        if let Some(v) = env("FLOWCTL_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = Some(parse_number("FLOWCTL_REQUEST_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = env("FLOWCTL_ACTOR") {
            self.actor = Some(v);
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(v) = &overrides.server_url {
            self.server_url = v.clone();
        }
        if let Some(v) = &overrides.equivalent {
            self.equivalent = v.clone();
        }
        if let Some(v) = overrides.max_hops {
            self.max_hops = v;
        }
        if let Some(v) = overrides.request_timeout_ms {
            self.request_timeout_ms = Some(v);
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.equivalent.trim().is_empty() {
            return Err(SettingsError::InvalidValue {
                key: "equivalent".into(),
                value: self.equivalent.clone(),
            });
        }
        if self.max_hops == 0 {
            return Err(SettingsError::InvalidValue {
                key: "max_hops".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, SettingsError> {
    raw.trim().parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// Defaults, then the config file, then `FLOWCTL_*` variables, then flags.
pub fn load_settings(
    config_path: Option<&Path>,
    overrides: &Overrides,
) -> Result<Settings, SettingsError> {
    load_settings_with(config_path, overrides, |key| std::env::var(key).ok())
}

fn load_settings_with(
    config_path: Option<&Path>,
    overrides: &Overrides,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Settings, SettingsError> {
    let mut settings = Settings::default();

    let (path, required) = match config_path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let file = toml::from_str::<FileSettings>(&raw).map_err(|source| {
                SettingsError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;
            settings.apply_file(file);
        }
        Err(err) if !required && err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(SettingsError::Read { path, source }),
    }

    settings.apply_env(env)?;
    settings.apply_overrides(overrides);
    settings.validate()?;
    Ok(settings)
}
