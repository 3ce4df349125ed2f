use thiserror::Error;

use crate::api::ApiError;

const DEFAULT_LOGIN_REJECTION: &str = "Invalid email or password";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Form input rejected before any request was made
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// Refresh token missing or rejected; the session has been ended
    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Failed to load user profile: {0}")]
    ProfileFetchFailure(String),

    #[error("Request failed: {0}")]
    Request(String),
}

impl AuthError {
    /// Classify a failed login call
    pub(crate) fn from_login_failure(err: &anyhow::Error) -> Self {
        if let Some(network) = Self::network_failure(err) {
            return network;
        }
        match err.downcast_ref::<ApiError>() {
            Some(ApiError::Unauthorized { detail }) => AuthError::InvalidCredentials(
                detail.clone().unwrap_or_else(|| DEFAULT_LOGIN_REJECTION.to_string()),
            ),
            Some(
                ApiError::BadRequest(m) | ApiError::AccessDenied(m) | ApiError::Unprocessable(m),
            ) => AuthError::InvalidCredentials(if m.is_empty() {
                DEFAULT_LOGIN_REJECTION.to_string()
            } else {
                m.clone()
            }),
            Some(other) => AuthError::Request(other.user_message()),
            None => AuthError::Request(format!("{:#}", err)),
        }
    }

    /// Classify any other failed API call
    pub(crate) fn from_request(err: &anyhow::Error) -> Self {
        if let Some(network) = Self::network_failure(err) {
            return network;
        }
        match err.downcast_ref::<ApiError>() {
            Some(api) => AuthError::Request(api.user_message()),
            None => AuthError::Request(format!("{:#}", err)),
        }
    }

    fn network_failure(err: &anyhow::Error) -> Option<Self> {
        let source = err.downcast_ref::<reqwest::Error>().or_else(|| {
            match err.downcast_ref::<ApiError>() {
                Some(ApiError::NetworkError(e)) => Some(e),
                _ => None,
            }
        })?;

        if source.is_decode() {
            return None;
        }
        let message = if source.is_timeout() {
            "Connection timed out. Please try again."
        } else {
            "Unable to connect to server. Check your internet connection."
        };
        Some(AuthError::NetworkFailure(message.to_string()))
    }

    /// Whether this error ended the session
    pub fn forces_logout(&self) -> bool {
        matches!(
            self,
            AuthError::SessionExpired | AuthError::ProfileFetchFailure(_)
        )
    }

    /// Message suitable for a toast
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Validation(messages) => messages.join("\n"),
            AuthError::InvalidCredentials(m)
            | AuthError::NetworkFailure(m)
            | AuthError::Request(m) => m.clone(),
            AuthError::SessionExpired => self.to_string(),
            AuthError::ProfileFetchFailure(_) => "Could not load your profile".to_string(),
        }
    }
}
