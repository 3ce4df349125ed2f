//! REST API client module for the hullzero backend.
//!
//! This module provides the `ApiClient` for the authentication endpoints
//! (`/api/auth/login`, `/api/auth/refresh`, `/api/auth/me`,
//! `/api/auth/change-password`) and the `ApiError` classification of
//! failed responses.
//!
//! The API uses bearer token authentication obtained through the
//! OAuth2 password-flow login endpoint.

pub mod client;
pub mod error;

pub use client::{is_unauthorized, ApiClient, DEFAULT_TIMEOUT_SECS};
pub use error::{extract_error_messages, ApiError};
