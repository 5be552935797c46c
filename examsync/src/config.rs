use exporter::config::{
    ExamService, Export as ExportConfig, StoreType, ValidationError as ExportValidationError,
};
use serde::Deserialize;
use std::fs::File;
use uploader::config::{Config as UploaderConfig, ValidationError as UploaderValidationError};

#[derive(Deserialize, Debug)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Deserialize, Debug)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Deserialize, Debug)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct StoreConfig {
    #[serde(flatten)]
    pub r#type: StoreType,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub exam_service: ExamService,
    #[serde(default)]
    pub export: ExportConfig,
    pub store: StoreConfig,
    pub uploader: Option<UploaderConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data: Config = serde_yaml::from_reader(file)?;
        data.validate()?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.exam_service.validate()?;
        self.export.validate()?;
        if let Some(uploader) = &self.uploader {
            uploader.validate()?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ExportValidationError),
    #[error("invalid uploader config: {0}")]
    InvalidUploader(#[from] UploaderValidationError),
}
