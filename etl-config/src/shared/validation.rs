use thiserror::Error;

/// Raised by `validate()` on configuration values that deserialize but cannot be used.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },

    #[error("`{0}` must not be empty")]
    EmptyField(String),
}

impl ValidationError {
    pub(crate) fn invalid(field: &str, constraint: &str) -> Self {
        ValidationError::InvalidFieldValue {
            field: field.to_string(),
            constraint: constraint.to_string(),
        }
    }
}
