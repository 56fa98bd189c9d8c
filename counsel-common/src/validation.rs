//! Configuration validation for Counsel services.
//!
//! Catches configurations that would deserialize fine but make the
//! dialogue core misbehave (zero budgets, dangling blocked categories).

use thiserror::Error;

use crate::config::{
    Config, DialogueConfig, GatewayConfig, LlmConfig, ObservabilityConfig, SafetyConfig,
    StorageConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u16, field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn collect(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult<()> {
        let sections: [&dyn Validate; 6] = [
            &self.gateway,
            &self.dialogue,
            &self.safety,
            &self.llm,
            &self.storage,
            &self.observability,
        ];

        let errors = sections
            .iter()
            .filter_map(|section| section.validate().err())
            .flat_map(|e| match e {
                ValidationError::Multiple(inner) => inner,
                other => vec![other],
            })
            .collect();

        collect(errors)
    }
}

impl Validate for GatewayConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push(ValidationError::InvalidPort {
                port: self.port,
                field: "gateway.port".into(),
            });
        }
        if self.host.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "gateway.host".into(),
            });
        }
        if self.request_timeout_secs == 0 {
            errors.push(invalid("gateway.request_timeout_secs", "must be greater than 0"));
        }

        collect(errors)
    }
}

impl Validate for DialogueConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.context_window_turns == 0 {
            errors.push(invalid("dialogue.context_window_turns", "must be at least 1"));
        }
        if self.context_window_chars == 0 {
            errors.push(invalid("dialogue.context_window_chars", "must be at least 1"));
        }
        if self.session_inactivity_timeout_secs == 0 {
            errors.push(invalid(
                "dialogue.session_inactivity_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.generation_timeout_secs == 0 {
            errors.push(invalid("dialogue.generation_timeout_secs", "must be greater than 0"));
        }
        if self.safe_harbor_reply.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "dialogue.safe_harbor_reply".into(),
            });
        }
        if self.apology_reply.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "dialogue.apology_reply".into(),
            });
        }
        if self.summary_chars == 0 {
            errors.push(invalid("dialogue.summary_chars", "must be at least 1"));
        }

        collect(errors)
    }
}

impl Validate for SafetyConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for category in &self.blocked_categories {
            if !self.categories.iter().any(|rule| &rule.name == category) {
                errors.push(invalid(
                    "safety.blocked_categories",
                    format!("category '{category}' has no matching rule"),
                ));
            }
        }

        for rule in &self.categories {
            if rule.name.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "safety.categories[].name".into(),
                });
            }
            if rule.phrases.iter().any(|p| p.trim().is_empty()) {
                errors.push(invalid(
                    "safety.categories[].phrases",
                    format!("category '{}' contains an empty phrase", rule.name),
                ));
            }
        }

        collect(errors)
    }
}

impl Validate for LlmConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            errors.push(invalid("llm.base_url", "must start with http:// or https://"));
        }
        if self.model.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "llm.model".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            errors.push(invalid("llm.temperature", "must be between 0.0 and 2.0"));
        }

        collect(errors)
    }
}

impl Validate for StorageConfig {
    fn validate(&self) -> ValidationResult<()> {
        match self.backend.as_str() {
            "sqlite" | "memory" => Ok(()),
            other => Err(invalid(
                "storage.backend",
                format!("unknown backend '{other}' (expected sqlite or memory)"),
            )),
        }
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

        if LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            Ok(())
        } else {
            Err(invalid(
                "observability.log_level",
                format!("unknown level '{}'", self.log_level),
            ))
        }
    }
}
