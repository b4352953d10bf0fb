//! Composer text → message or command.

use std::collections::BTreeMap;

use harmony_core::{HarmonyError, Result};

/// What the user typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// Send as a chat message
    Message(String),
    /// `/name rest of line`
    Command { name: String, args: String },
}

/// Classify composer input.
///
/// `//x` and `\/x` send the literal `/x`; a lone `/` is sent as-is.
pub fn parse(text: &str) -> Parsed {
    if text.starts_with("//") || text.starts_with("\\/") {
        return Parsed::Message(text[1..].to_owned());
    }
    let Some(command) = text.strip_prefix('/') else {
        return Parsed::Message(text.to_owned());
    };

    let command = command.trim_start();
    let (name, args) = command
        .split_once(char::is_whitespace)
        .unwrap_or((command, ""));
    if name.is_empty() {
        return Parsed::Message(text.to_owned());
    }
    Parsed::Command {
        name: name.to_owned(),
        args: args.trim().to_owned(),
    }
}

/// Arguments split into positionals and `key=value` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitArgs {
    pub positional: Vec<String>,
    pub keyword: BTreeMap<String, String>,
}

fn is_keyword_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.chars().next().is_some_and(|c| !c.is_ascii_digit())
}

/// Shell-like split of a command line.
pub fn split_args(args: &str) -> Result<SplitArgs> {
    let words = shell_words::split(args).map_err(|e| HarmonyError::Command(format!("cannot parse arguments: {e}")))?;

    let mut split = SplitArgs::default();
    for word in words {
        match word.split_once('=') {
            Some((key, value)) if is_keyword_name(key) => {
                split.keyword.insert(key.to_owned(), value.to_owned());
            }
            _ => split.positional.push(word),
        }
    }
    Ok(split)
}
