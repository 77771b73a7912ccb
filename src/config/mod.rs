//! Configuration management for the pairing-room service
//!
//! This module handles configuration loading from environment variables and
//! TOML files, validation, and default values.

pub mod app;

pub use app::{
    validate_config, AmqpSettings, AppConfig, MatchmakingSettings, RatingSettings,
    ServiceSettings, StoreBackend, StoreSettings, TokenSettings,
};
