//! Built-in commands.

use futures::{future::BoxFuture, FutureExt};
use harmony_core::{HarmonyError, Result, Severity};
use ruma::UserId;

use super::{
    autorun::run_commands,
    table::{Arguments, CommandContext, CommandDescriptor, CommandTable, Param},
    utils::{expand_user, str_arg_to_bool, str_arg_to_list},
};
use crate::{markdown::render_outgoing, service::sending::SendRequest};

const SAY_PARAMS: &[Param] = &[Param::rest("text", None), Param::optional("with_accounts", "@")];
const HELP_PARAMS: &[Param] = &[Param::optional("commands", ""), Param::optional("full", "no")];
const ALIAS_PARAMS: &[Param] = &[Param::rest("args", Some(""))];
const AUTORUN_PARAMS: &[Param] = &[Param::rest("args", Some(""))];
const NICK_PARAMS: &[Param] = &[
    Param::optional("name", ""),
    Param::optional("only_for_room", "no"),
    Param::optional("user", "@"),
];

/// Table with every built-in command registered.
pub fn builtin_table() -> CommandTable {
    let mut table = CommandTable::new();
    table.register(CommandDescriptor {
        name: "say",
        usage: "say TEXT [with_accounts=@]",
        summary: "Send TEXT as a message, from this account or each of with_accounts (`@` is this account).",
        runs_async: false,
        params: SAY_PARAMS,
        handler: say,
    });
    table.register(CommandDescriptor {
        name: "help",
        usage: "help [commands] [full=no]",
        summary: "List commands, or show the usage of the given commands.",
        runs_async: false,
        params: HELP_PARAMS,
        handler: help,
    });
    table.register(CommandDescriptor {
        name: "alias",
        usage: "alias [-s|--single-arg] [-r|--remove] [ALIAS [COMMAND]]",
        summary: "Define, show or remove an alias. `{}` in COMMAND is replaced by the alias arguments.",
        runs_async: false,
        params: ALIAS_PARAMS,
        handler: alias,
    });
    table.register(CommandDescriptor {
        name: "autorun",
        usage: "autorun [-r|--reload] [--reset] [COMMAND]...",
        summary: "Show the commands run when the client starts, add COMMANDs to them, run them again or reset them.",
        runs_async: false,
        params: AUTORUN_PARAMS,
        handler: autorun,
    });
    table.register(CommandDescriptor {
        name: "nick",
        usage: "nick [name] [only_for_room=no] [user=@]",
        summary: "Set the display name of user, in every room or only this one. An empty name resets it to the user id.",
        runs_async: false,
        params: NICK_PARAMS,
        handler: nick,
    });
    table
}

fn say(ctx: CommandContext, args: Arguments) -> BoxFuture<'static, Result<()>> {
    async move {
        let text = args.get("text").to_owned();
        let current = ctx.view.user_id().to_owned();

        for account in str_arg_to_list(args.get("with_accounts")) {
            let account = UserId::parse(expand_user(&account, &current))?;
            if account == current {
                ctx.view.send_markdown(&text)?;
                continue;
            }
            if !ctx.services.router.is_registered(&account) {
                return Err(HarmonyError::UnknownAccount(account.to_string()));
            }

            let view = ctx.view.clone();
            ctx.services.sending.send(
                &account,
                ctx.view.room_id(),
                SendRequest {
                    html: render_outgoing(&text),
                    body: text.clone(),
                    txn_id: uuid::Uuid::new_v4().simple().to_string(),
                },
                Box::new(move |err: HarmonyError| {
                    tokio::spawn(async move {
                        view.system_print(&format!("Sending failed ({}): {}", err.kind_label(), err), Severity::Error)
                            .await;
                    });
                }),
            );
        }
        Ok(())
    }
    .boxed()
}

fn help(ctx: CommandContext, args: Arguments) -> BoxFuture<'static, Result<()>> {
    async move {
        let table = &ctx.services.commands;
        let full = str_arg_to_bool(args.get("full"))?;
        let requested = str_arg_to_list(args.get("commands"));

        let mut lines = Vec::new();
        if requested.is_empty() {
            lines.push("Commands:".to_owned());
            for descriptor in table.descriptors() {
                lines.push(format!("  /{:<8} {}", descriptor.name, descriptor.summary));
            }
            let aliases = table.aliases();
            if !aliases.is_empty() {
                lines.push("Aliases:".to_owned());
                for (name, alias) in aliases {
                    lines.push(format!("  /{:<8} /{}", name, alias.command));
                }
            }
        } else {
            for name in requested {
                let name = name.trim_start_matches('/');
                if let Some(descriptor) = table.get(name) {
                    lines.push(format!("/{}", descriptor.usage));
                    if full {
                        lines.push(format!("  {}", descriptor.summary));
                    }
                } else if let Some(alias) = table.alias(name) {
                    lines.push(format!("/{name} is an alias for /{}", alias.command));
                } else {
                    return Err(HarmonyError::CommandNotFound(name.to_owned()));
                }
            }
        }

        ctx.view.system_print(&lines.join("\n"), Severity::Info).await;
        Ok(())
    }
    .boxed()
}

fn alias(ctx: CommandContext, args: Arguments) -> BoxFuture<'static, Result<()>> {
    async move {
        let table = &ctx.services.commands;
        let words = shell_words::split(args.get("args"))
            .map_err(|e| HarmonyError::Command(format!("cannot parse arguments: {e}")))?;

        let mut single_arg = false;
        let mut remove = false;
        let mut rest = words.into_iter().peekable();
        while let Some(flag) = rest.next_if(|w| w.starts_with('-')) {
            match flag.as_str() {
                "-s" | "--single-arg" => single_arg = true,
                "-r" | "--remove" => remove = true,
                other => return Err(HarmonyError::Command(format!("unknown option {other}"))),
            }
        }
        let name = rest.next();
        let command: Vec<String> = rest.collect();

        let message = match (name, remove) {
            (None, _) => {
                let aliases = table.aliases();
                if aliases.is_empty() {
                    "No aliases defined".to_owned()
                } else {
                    aliases
                        .into_iter()
                        .map(|(name, alias)| format!("/{name} → /{}", alias.command))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            (Some(name), true) => {
                if !table.remove_alias(&name) {
                    return Err(HarmonyError::Command(format!("no alias named `/{name}`")));
                }
                format!("Removed alias /{name}")
            }
            (Some(name), false) if command.is_empty() => match table.alias(&name) {
                Some(alias) => format!("/{name} → /{}", alias.command),
                None => return Err(HarmonyError::Command(format!("no alias named `/{name}`"))),
            },
            (Some(name), false) => {
                let command = command.join(" ");
                table.set_alias(&name, &command, single_arg)?;
                format!("Alias /{} → /{}", name.trim_start_matches('/'), command.trim_start_matches('/'))
            }
        };

        ctx.view.system_print(&message, Severity::Info).await;
        Ok(())
    }
    .boxed()
}

fn autorun(ctx: CommandContext, args: Arguments) -> BoxFuture<'static, Result<()>> {
    async move {
        let store = &ctx.services.autorun;
        let words = shell_words::split(args.get("args"))
            .map_err(|e| HarmonyError::Command(format!("cannot parse arguments: {e}")))?;

        let mut reload = false;
        let mut reset = false;
        let mut rest = words.into_iter().peekable();
        while let Some(flag) = rest.next_if(|w| w.starts_with('-')) {
            match flag.as_str() {
                "-r" | "--reload" => reload = true,
                "--reset" => reset = true,
                other => return Err(HarmonyError::Command(format!("unknown option {other}"))),
            }
        }
        let added: Vec<String> = rest.collect();

        let mut commands = if reset { store.reset().await? } else { store.read().await? };
        if !added.is_empty() {
            commands = store.add(added.clone()).await?;
        }

        let mut lines = vec![format!("Autorun file: {}", store.path().display())];
        lines.extend(commands.iter().map(|c| format!("  {c}")));
        ctx.view.system_print(&lines.join("\n"), Severity::Info).await;

        if reload {
            run_commands(&ctx, &commands).await;
        } else if !added.is_empty() {
            run_commands(&ctx, &added).await;
        }
        Ok(())
    }
    .boxed()
}

fn nick(ctx: CommandContext, args: Arguments) -> BoxFuture<'static, Result<()>> {
    async move {
        let current = ctx.view.user_id().to_owned();
        let user_id = UserId::parse(expand_user(args.get("user"), &current))?;
        let account = ctx
            .services
            .accounts
            .get(&user_id)
            .ok_or_else(|| HarmonyError::UnknownAccount(user_id.to_string()))?;

        let name = match args.get("name") {
            "" => user_id.to_string(),
            name => name.to_owned(),
        };
        let only_for_room = str_arg_to_bool(args.get("only_for_room"))?;
        let room_id = only_for_room.then(|| ctx.view.room_id());
        account.session.set_display_name(&name, room_id).await?;

        let scope = if only_for_room { " in this room" } else { "" };
        ctx.view
            .system_print(&format!("Display name of {user_id} set to {name}{scope}"), Severity::Info)
            .await;
        Ok(())
    }
    .boxed()
}
