use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Configuration error: environment variable {0} must be set")]
    EnvVar(String),
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// True for errors detected before any virtual user starts. These map
    /// to exit code 2 instead of a threshold failure.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::EnvVar(_) | Error::Yaml(_) | Error::Io(_)
        )
    }
}
