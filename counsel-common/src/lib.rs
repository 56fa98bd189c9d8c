//! Counsel Common - Shared configuration, errors, and logging for the Counsel services.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - The service-level error type and its HTTP status mapping
//! - Logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{
    Config, DialogueConfig, GatewayConfig, LlmConfig, ObservabilityConfig, SafetyConfig,
    SafetyRule, StorageConfig,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};
