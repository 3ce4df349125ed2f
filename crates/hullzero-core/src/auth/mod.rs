//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `SessionManager`: login, logout, token refresh on 401 and role queries
//! - `Session`: the in-memory session state and its `AuthState`
//! - `SecretStore`: durable storage for tokens and remember-me preferences,
//!   backed by a JSON file, the OS keychain or memory
//! - `Notifier`: the channel for user-visible messages
//!
//! Tokens are persisted only when the user asked to be remembered.

pub mod error;
pub mod manager;
pub mod notify;
pub mod session;
pub mod store;

pub use error::AuthError;
pub use manager::SessionManager;
pub use notify::{LogNotifier, NotificationLevel, Notifier};
pub use session::{AuthState, Session};
pub use store::{FileStore, KeyringStore, MemoryStore, SecretStore};
