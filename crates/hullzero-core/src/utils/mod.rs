//! Utility functions for formatting session data for display.

pub mod format;

pub use format::*;
