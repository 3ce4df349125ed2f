use crate::models::{LoginOptions, LoginRequest};

use super::FieldError;

/// The only account the offline validator accepts
const MOCK_USERNAME: &str = "admin";
const MOCK_PASSWORD: &str = "admin123";

#[derive(Debug, Clone, Default)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
    pub remember_me: bool,
}

impl LoginForm {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            remember_me: false,
        }
    }

    pub fn remember_me(mut self, remember: bool) -> Self {
        self.remember_me = remember;
        self
    }

    /// Check the form and produce the login request.
    ///
    /// The email is trimmed; the password is taken verbatim. Until the
    /// backend account flow is wired into the form, only the mock
    /// `admin`/`admin123` account passes.
    pub fn validate(&self) -> Result<(LoginRequest, LoginOptions), Vec<FieldError>> {
        let mut errors = Vec::new();
        let email = self.email.trim();

        if email.is_empty() {
            errors.push(FieldError::new("credentials.email", "Username is required."));
        } else if email != MOCK_USERNAME {
            errors.push(FieldError::new("credentials.email", "Invalid username"));
        }

        if self.password.is_empty() {
            errors.push(FieldError::new("credentials.password", "Password is required."));
        } else if self.password != MOCK_PASSWORD {
            errors.push(FieldError::new("credentials.password", "Invalid password"));
        }

        if errors.is_empty() {
            Ok((
                LoginRequest::new(email, self.password.clone()),
                LoginOptions {
                    remember_me: self.remember_me,
                },
            ))
        } else {
            Err(errors)
        }
    }
}
