use thiserror::Error;

use crate::validation::ValidationErrors;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid configuration: {0}")]
    Validation(ValidationErrors),
    #[error("Pin {0} is not defined")]
    NotFoundPin(u32),
    #[error("Pin misconfigured: {0}")]
    Misconfigured(String),
    #[error("'{field}' cannot be modified after pin {pin} is created")]
    Immutable { pin: u32, field: &'static str },
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl AppError {
    /// Field-keyed violations when this is a validation failure.
    pub fn violations(&self) -> Option<&ValidationErrors> {
        match self {
            AppError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}
