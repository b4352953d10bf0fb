// =============================================================================
// Harmony Matrix Client - Command Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Evaluates composer input: plain text is sent as a message, `/name ...`
//   runs a command from the command table. Failures are printed into the
//   chat view as error lines.
//
// =============================================================================

pub mod autorun;
pub mod builtins;
pub mod parse;
pub mod table;
pub mod utils;

pub use autorun::AutorunStore;
pub use builtins::builtin_table;
pub use parse::{parse, split_args, Parsed, SplitArgs};
pub use table::{Alias, Arguments, CommandContext, CommandDescriptor, CommandTable, Handler, Param};

use harmony_core::{Result, Severity};
use tracing::debug;

/// Evaluate one line of composer input in `ctx`.
pub async fn eval(ctx: CommandContext, text: &str) -> Result<()> {
    let result = match parse(text) {
        Parsed::Message(message) => ctx.view.send_markdown(&message),
        Parsed::Command { name, args } => {
            debug!("🔧 Running /{} in {}", name, ctx.view.room_id());
            ctx.services.commands.dispatch(ctx.clone(), &name, &args).await
        }
    };

    if let Err(e) = &result {
        ctx.view
            .system_print(&format!("({}) {}", e.kind_label(), e), Severity::Error)
            .await;
    }
    result
}
