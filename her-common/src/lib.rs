//! her common - Shared configuration, error types, and logging for the her chat backend.
//!
//! This crate provides:
//! - Configuration types, loading (`.env`, JSON file, environment) and validation
//! - Error types and handling utilities
//! - Logging setup and request tracing helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    Config, LlmConfig, LoadReport, ObservabilityConfig, RedisConfig, ServerConfig, StorageBackend,
    StorageConfig,
};
pub use error::{Error, Result};
