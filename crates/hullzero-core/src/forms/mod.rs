//! Client-side form validation.
//!
//! Forms are checked before any network call. A failed check yields one
//! `FieldError` per problem, keyed by a dotted field path such as
//! `credentials.email`.

pub mod login;
pub mod register;

pub use login::LoginForm;
pub use register::RegisterForm;

use crate::auth::AuthError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl From<Vec<FieldError>> for AuthError {
    fn from(errors: Vec<FieldError>) -> Self {
        AuthError::Validation(errors.into_iter().map(|e| e.message).collect())
    }
}

/// Messages for a single field, in the order they were found
pub fn messages_for<'a>(errors: &'a [FieldError], field: &str) -> Vec<&'a str> {
    errors
        .iter()
        .filter(|e| e.field == field)
        .map(|e| e.message.as_str())
        .collect()
}
