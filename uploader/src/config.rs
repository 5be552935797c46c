use serde::Deserialize;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("listener port must not be 0")]
    InvalidPort,
    #[error("schedule interval must be at least one second")]
    InvalidInterval,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum DropType {
    /// Each drop host maps to a directory below `base_dir`.
    Filesystem { base_dir: String },
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct DropLocation {
    #[serde(flatten)]
    pub r#type: DropType,
}

fn default_interval_secs() -> u64 {
    60
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Schedule {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule {
            interval_secs: default_interval_secs(),
        }
    }
}

/// Address of the HTTP API. It must not be publicly reachable, as the API
/// is unauthenticated.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub drop: DropLocation,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub listener: Listener,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.listener.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if self.schedule.interval_secs == 0 {
            return Err(ValidationError::InvalidInterval);
        }
        Ok(())
    }
}
