//! Command table and dispatcher.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex as StdMutex},
};

use futures::future::BoxFuture;
use harmony_core::{HarmonyError, Result, Severity};
use tracing::{debug, instrument};

use super::parse::{parse, split_args, Parsed};
use crate::service::{display::ChatView, Services};

/// Aliases may refer to other aliases up to this depth.
pub const MAX_ALIAS_DEPTH: usize = 8;

/// Everything a handler may touch.
#[derive(Clone)]
pub struct CommandContext {
    pub services: Arc<Services>,
    /// View the command was typed into
    pub view: Arc<ChatView>,
}

pub type Handler = fn(CommandContext, Arguments) -> BoxFuture<'static, Result<()>>;

/// One declared parameter.
#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub name: &'static str,
    /// `None` means required
    pub default: Option<&'static str>,
    /// Takes the remaining text of the line
    pub rest: bool,
}

impl Param {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            default: None,
            rest: false,
        }
    }

    pub const fn optional(name: &'static str, default: &'static str) -> Self {
        Self {
            name,
            default: Some(default),
            rest: false,
        }
    }

    pub const fn rest(name: &'static str, default: Option<&'static str>) -> Self {
        Self { name, default, rest: true }
    }
}

/// Static description of a command.
#[derive(Clone)]
pub struct CommandDescriptor {
    pub name: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
    /// Run on a spawned task instead of inline
    pub runs_async: bool,
    pub params: &'static [Param],
    pub handler: Handler,
}

impl std::fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("usage", &self.usage)
            .field("runs_async", &self.runs_async)
            .finish()
    }
}

/// Bound argument values, defaults applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments {
    values: BTreeMap<&'static str, String>,
}

impl Arguments {
    pub fn get(&self, name: &str) -> &str {
        self.values.get(name).map(String::as_str).unwrap_or_default()
    }
}

/// User-defined alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    /// Command line without the leading `/`; `{}` marks where arguments go
    pub command: String,
    /// Pass all arguments as one quoted argument
    pub single_arg: bool,
}

impl Alias {
    fn expand(&self, args: &str) -> String {
        let args = if self.single_arg && !args.is_empty() {
            shell_words::quote(args).into_owned()
        } else {
            args.to_owned()
        };
        if self.command.contains("{}") {
            self.command.replace("{}", &args)
        } else if args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, args)
        }
    }
}

/// Name → descriptor, plus aliases.
#[derive(Debug, Default)]
pub struct CommandTable {
    commands: BTreeMap<&'static str, CommandDescriptor>,
    aliases: StdMutex<BTreeMap<String, Alias>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: CommandDescriptor) {
        self.commands.insert(descriptor.name, descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &CommandDescriptor> {
        self.commands.values()
    }

    pub fn alias(&self, name: &str) -> Option<Alias> {
        self.aliases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn aliases(&self) -> Vec<(String, Alias)> {
        self.aliases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, alias)| (name.clone(), alias.clone()))
            .collect()
    }

    pub fn set_alias(&self, name: &str, command: &str, single_arg: bool) -> Result<()> {
        let name = name.trim_start_matches('/');
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(HarmonyError::Command(format!("invalid alias name {name:?}")));
        }
        if self.commands.contains_key(name) {
            return Err(HarmonyError::Command(format!("`/{name}` is a built-in command")));
        }
        let command = command.trim().trim_start_matches('/');
        if command.is_empty() {
            return Err(HarmonyError::Command(format!("alias `/{name}` needs a command")));
        }
        self.aliases.lock().unwrap_or_else(|e| e.into_inner()).insert(
            name.to_owned(),
            Alias {
                command: command.to_owned(),
                single_arg,
            },
        );
        Ok(())
    }

    pub fn remove_alias(&self, name: &str) -> bool {
        self.aliases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name.trim_start_matches('/'))
            .is_some()
    }

    /// Resolve aliases until a built-in command is reached.
    pub fn expand(&self, name: &str, args: &str) -> Result<(String, String)> {
        let (mut name, mut args) = (name.to_owned(), args.to_owned());
        for _ in 0..=MAX_ALIAS_DEPTH {
            if self.commands.contains_key(name.as_str()) {
                return Ok((name, args));
            }
            let Some(alias) = self.alias(&name) else {
                return Err(HarmonyError::CommandNotFound(name));
            };
            let expanded = alias.expand(&args);
            debug!("🔧 Alias /{} expands to /{}", name, expanded);
            match parse(&format!("/{expanded}")) {
                Parsed::Command { name: next, args: next_args } => {
                    name = next;
                    args = next_args;
                }
                Parsed::Message(_) => {
                    return Err(HarmonyError::Command(format!("alias `/{name}` does not expand to a command")))
                }
            }
        }
        Err(HarmonyError::Command(format!(
            "alias expansion of `/{name}` is nested deeper than {MAX_ALIAS_DEPTH}"
        )))
    }

    /// Run `/name args` in `ctx`.
    #[instrument(level = "debug", skip(self, ctx))]
    pub async fn dispatch(&self, ctx: CommandContext, name: &str, args: &str) -> Result<()> {
        let (name, args) = self.expand(name, args)?;
        let descriptor = self
            .get(&name)
            .ok_or_else(|| HarmonyError::CommandNotFound(name.clone()))?;
        let arguments = bind(descriptor, &args)?;
        let run = (descriptor.handler)(ctx.clone(), arguments);

        if descriptor.runs_async {
            let view = ctx.view;
            tokio::spawn(async move {
                if let Err(e) = run.await {
                    view.system_print(&format!("({}) {}", e.kind_label(), e), Severity::Error)
                        .await;
                }
            });
            Ok(())
        } else {
            run.await
        }
    }
}

fn missing(descriptor: &CommandDescriptor, param: &Param) -> HarmonyError {
    HarmonyError::Command(format!(
        "missing argument `{}`; usage: /{}",
        param.name, descriptor.usage
    ))
}

/// Bind an argument line to the declared parameters.
///
/// Commands with a rest parameter take their text verbatim (no shell
/// quoting), so apostrophes in chat text do not need escaping; only
/// `name=value` words naming a declared parameter are pulled out.
pub fn bind(descriptor: &CommandDescriptor, args: &str) -> Result<Arguments> {
    let params = descriptor.params;
    let mut values: BTreeMap<&'static str, String> = BTreeMap::new();
    let keyword_param = |key: &str| params.iter().find(|p| !p.rest && p.name == key);

    if params.iter().any(|p| p.rest) {
        let mut positional = Vec::new();
        for word in args.split_whitespace() {
            match word.split_once('=').and_then(|(key, value)| keyword_param(key).map(|p| (p, value))) {
                Some((param, value)) => {
                    values.insert(param.name, value.to_owned());
                }
                None => positional.push(word),
            }
        }
        let mut words = positional.into_iter();
        for param in params {
            if param.rest {
                let text = words.by_ref().collect::<Vec<_>>().join(" ");
                if !text.is_empty() {
                    values.insert(param.name, text);
                }
            } else if !values.contains_key(param.name) {
                if let Some(word) = words.next() {
                    values.insert(param.name, word.to_owned());
                }
            }
        }
    } else {
        let split = split_args(args)?;
        for (key, value) in split.keyword {
            let param = keyword_param(&key)
                .ok_or_else(|| HarmonyError::Command(format!("unknown argument `{key}`; usage: /{}", descriptor.usage)))?;
            values.insert(param.name, value);
        }
        let mut words = split.positional.into_iter();
        for param in params {
            if !values.contains_key(param.name) {
                if let Some(word) = words.next() {
                    values.insert(param.name, word);
                }
            }
        }
        if words.next().is_some() {
            return Err(HarmonyError::Command(format!(
                "too many arguments; usage: /{}",
                descriptor.usage
            )));
        }
    }

    for param in params {
        if !values.contains_key(param.name) {
            let default = param.default.ok_or_else(|| missing(descriptor, param))?;
            values.insert(param.name, default.to_owned());
        }
    }
    Ok(Arguments { values })
}
