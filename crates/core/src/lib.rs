//! devlink core - shared configuration, errors and events
//!
//! This crate provides the pieces every devlink component is built on:
//! application configuration, the error taxonomy, and the snapshot
//! broadcast event bus used to publish device lifecycle changes.

pub mod config;
pub mod error;
pub mod events;

pub use config::{AndroidConfig, AppConfig, DeviceConfig};
pub use error::{DevlinkError, Result};
pub use events::{EventBus, EventSubscription};

/// devlink version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "devlink";
