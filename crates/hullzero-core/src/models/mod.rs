//! Data models exchanged with the hullzero API.
//!
//! - `User`: the authenticated user's profile and roles
//! - `TokenResponse`, `LoginRequest`, `PasswordChange`: authentication payloads
//! - `RegisterRequest`: account creation payload

pub mod auth;
pub mod register;
pub mod user;

pub use auth::{LoginOptions, LoginRequest, PasswordChange, TokenResponse};
pub(crate) use auth::RefreshRequest;
pub use register::RegisterRequest;
pub use user::User;
