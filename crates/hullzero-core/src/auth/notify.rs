//! User-visible notifications (the toast layer of a UI front-end).

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Success,
    Error,
}

/// Receives messages meant for the user. Front-ends render them; the
/// library never prints anything itself.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotificationLevel, message: &str);
}

/// Routes notifications into the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: NotificationLevel, message: &str) {
        match level {
            NotificationLevel::Success => info!(message, "Notification"),
            NotificationLevel::Error => warn!(message, "Error notification"),
        }
    }
}
