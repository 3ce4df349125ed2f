use std::collections::BTreeSet;

/// Number of leading characters of a secret left visible
const VISIBLE_SECRET_CHARS: usize = 6;

/// Format an optional string, returning a default if None
pub fn format_optional(value: &Option<String>, default: &str) -> String {
    value.as_deref().unwrap_or(default).to_string()
}

/// Show only the start of a token, e.g. `eyJhbG…`
pub fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= VISIBLE_SECRET_CHARS {
        "*".repeat(secret.chars().count())
    } else {
        let visible: String = secret.chars().take(VISIBLE_SECRET_CHARS).collect();
        format!("{}…", visible)
    }
}

/// Comma-separated role list, or "none"
pub fn format_roles(roles: &BTreeSet<String>) -> String {
    if roles.is_empty() {
        "none".to_string()
    } else {
        roles.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
    }
}

/// Human readable time left on a token
pub fn format_expiry(minutes: Option<i64>) -> String {
    match minutes {
        None => "unknown".to_string(),
        Some(m) if m <= 0 => "expired".to_string(),
        Some(m) if m < 60 => format!("{}m", m),
        Some(m) => format!("{}h {}m", m / 60, m % 60),
    }
}
