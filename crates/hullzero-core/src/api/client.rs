//! HTTP client for the hullzero authentication API.
//!
//! `ApiClient` is stateless with respect to credentials: every call that
//! needs authorization takes the bearer token explicitly. Token storage,
//! refresh and retry live in `auth::SessionManager`.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::models::{
    LoginRequest, PasswordChange, RefreshRequest, RegisterRequest, TokenResponse, User,
};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/api/auth/login";
const REFRESH_PATH: &str = "/api/auth/refresh";
const ME_PATH: &str = "/api/auth/me";
const CHANGE_PASSWORD_PATH: &str = "/api/auth/change-password";
const REGISTER_PATH: &str = "/api/auth/register";

/// Default HTTP request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// API client for the hullzero backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client rooted at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn auth_headers(token: Option<&str>) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))
                    .context("Access token is not a valid header value")?,
            );
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Exchange email/password for a token pair.
    /// The endpoint is OAuth2 password-flow style and takes a form body.
    pub async fn authenticate(&self, credentials: &LoginRequest) -> Result<TokenResponse> {
        let url = self.url(LOGIN_PATH);

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("username", credentials.email.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await
            .context("Failed to send authentication request")?;

        let response = Self::check_response(response).await?;
        response.json().await.context("Failed to parse auth response")
    }

    /// Exchange a refresh token for a new token pair
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let url = self.url(REFRESH_PATH);

        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .context("Failed to send token refresh request")?;

        let response = Self::check_response(response).await?;
        response.json().await.context("Failed to parse refresh response")
    }

    /// Fetch the profile of the user the token belongs to
    pub async fn fetch_current_user(&self, token: Option<&str>) -> Result<User> {
        self.request(Method::GET, ME_PATH, token, None::<&()>).await
    }

    pub async fn change_password(&self, token: Option<&str>, change: &PasswordChange) -> Result<()> {
        self.request_empty(Method::POST, CHANGE_PASSWORD_PATH, token, Some(change))
            .await
    }

    /// Create an account. No token is involved; the caller logs in afterwards.
    pub async fn register(&self, request: &RegisterRequest) -> Result<()> {
        self.request_empty(Method::POST, REGISTER_PATH, None, Some(request))
            .await
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let url = self.url(path);
        debug!(%method, url = %url, authorized = token.is_some(), "Sending request");

        let mut builder = self
            .client
            .request(method.clone(), &url)
            .headers(Self::auth_headers(token)?);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to {}", method, url))?;

        Self::check_response(response).await
    }

    /// Send a request and decode a JSON response body
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<&B>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.send(method, path, token, body).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    /// Send a request whose response body is ignored
    pub async fn request_empty<B>(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<&B>,
    ) -> Result<()>
    where
        B: Serialize + ?Sized,
    {
        self.send(method, path, token, body).await?;
        Ok(())
    }
}

/// Classify an error from `ApiClient` as a rejected bearer token
pub fn is_unauthorized(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .map(ApiError::is_unauthorized)
        .unwrap_or(false)
}
