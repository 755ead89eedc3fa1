//! Error types for devlink
//!
//! Centralized error handling using thiserror. Device-level failures have
//! their own types in the bridge crate; this covers setup and configuration.

use thiserror::Error;

/// Main error type for devlink
#[derive(Error, Debug)]
pub enum DevlinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias for devlink operations
pub type Result<T> = std::result::Result<T, DevlinkError>;
