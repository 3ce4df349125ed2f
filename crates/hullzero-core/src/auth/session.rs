use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{TokenResponse, User};

/// Buffer before token expiry at which a proactive refresh is due (5 minutes)
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// Deadline for a token that lives `expires_in` seconds from now.
///
/// A negative lifetime means the token is already due. Lifetimes too large
/// to represent leave the deadline unknown.
fn expiry_deadline(expires_in: i64) -> Option<DateTime<Utc>> {
    let now = Utc::now();
    if expires_in < 0 {
        return Some(now);
    }
    Duration::try_seconds(expires_in).and_then(|lifetime| now.checked_add_signed(lifetime))
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthState::Anonymous => write!(f, "anonymous"),
            AuthState::Authenticating => write!(f, "authenticating"),
            AuthState::Authenticated => write!(f, "authenticated"),
            AuthState::Refreshing => write!(f, "refreshing"),
        }
    }
}

/// In-memory session state. One per process, owned by `SessionManager`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Session {
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub user: Option<User>,
    pub remember_me: bool,
    pub remembered_email: Option<String>,
    pub loading: bool,
    pub refreshing: bool,
    pub last_error: Option<String>,
    /// Access token deadline, when the server reported `expires_in`
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn state(&self) -> AuthState {
        if self.loading {
            AuthState::Authenticating
        } else if self.refreshing {
            AuthState::Refreshing
        } else if self.is_authenticated() {
            AuthState::Authenticated
        } else {
            AuthState::Anonymous
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.user.as_ref().map(|u| u.has_role(role)).unwrap_or(false)
    }

    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        self.user
            .as_ref()
            .map(|u| u.has_any_role(roles))
            .unwrap_or(false)
    }

    /// Install a freshly issued token pair
    pub(crate) fn apply_tokens(&mut self, tokens: &TokenResponse) {
        self.access_token = Some(tokens.access_token.clone());
        self.refresh_token = Some(tokens.refresh_token.clone());
        self.expires_at = tokens.expires_in.and_then(expiry_deadline);
    }

    /// Drop every credential-bearing field. Preferences (remember-me,
    /// remembered email) are kept.
    pub(crate) fn clear_credentials(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.user = None;
        self.expires_at = None;
        self.refreshing = false;
        self.loading = false;
        self.last_error = None;
    }

    /// Check if the access token will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() > at - Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES),
            None => false,
        }
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.expires_at
            .map(|at| (at - Utc::now()).num_minutes().max(0))
    }
}
