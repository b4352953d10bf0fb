//! Argument helpers shared by command handlers.

use harmony_core::{HarmonyError, Result};
use ruma::UserId;

/// Parse a yes/no style argument.
pub fn str_arg_to_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "t" | "on" | "1" => Ok(true),
        "no" | "n" | "false" | "f" | "off" | "0" | "" => Ok(false),
        other => Err(HarmonyError::Command(format!("expected yes or no, got {other:?}"))),
    }
}

/// Split a comma and/or whitespace separated list.
pub fn str_arg_to_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Expand `@` to `current` and `@name` to `@name:<server of current>`.
pub fn expand_user(value: &str, current: &UserId) -> String {
    match value {
        "@" => current.to_string(),
        v if v.starts_with('@') && !v.contains(':') => format!("{v}:{}", current.server_name()),
        v => v.to_owned(),
    }
}
