// error.rs - Error type shared by every stage of the pipeline

use thiserror::Error;

/// Errors raised by generation, exploration, mapping and persistence.
#[derive(Error, Debug)]
pub enum GenexError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid goal: {0}")]
    InvalidGoal(String),

    #[error("Exploration data is empty")]
    EmptyExploration,

    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Malformed data: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, GenexError>;
