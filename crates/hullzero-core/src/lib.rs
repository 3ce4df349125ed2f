//! hullzero-core - client library for the hullzero fleet tracking API.
//!
//! This crate provides:
//! - `api`: HTTP client for the authentication endpoints
//! - `auth`: the process-wide `SessionManager`, session state and secret storage
//! - `forms`: client-side login and registration validation
//! - `models`: user, token and registration payloads
//! - `config`: configuration loading
//! - `utils`: display helpers

pub mod api;
pub mod auth;
pub mod config;
pub mod forms;
pub mod models;
pub mod utils;

pub use api::{ApiClient, ApiError};
pub use auth::{AuthError, AuthState, Session, SessionManager};
pub use config::Config;
pub use models::{LoginOptions, LoginRequest, PasswordChange, RegisterRequest, User};
