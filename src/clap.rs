// =============================================================================
// Harmony Matrix Client - Clap Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Command line interface of the terminal client.
//
// =============================================================================

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, instrument};

/// Returns the current version of the crate with extra info if supplied
///
/// Set the environment variable `HARMONY_VERSION_EXTRA` at build time to any
/// UTF-8 string to include it in parenthesis after the SemVer version.
pub fn version() -> String {
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    match option_env!("HARMONY_VERSION_EXTRA") {
        Some(x) => format!("{} ({})", cargo_pkg_version, x),
        None => cargo_pkg_version.to_owned(),
    }
}

/// Harmony - multi-account Matrix chat client
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(about, version, name = "harmony")]
pub struct Args {
    /// Path to configuration file
    #[clap(short, long, env = "HARMONY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Tracing filter override (e.g. `debug`, `harmony=trace`)
    #[clap(short, long, global = true)]
    pub log_level: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Log in every remembered account and print incoming events
    Run,

    /// Chat in one room: lines read from stdin are sent or run as commands
    Chat {
        /// Account to chat as
        #[clap(long, short)]
        user: String,

        /// Room id (`!room:server`)
        #[clap(long, short)]
        room: String,
    },

    /// Log in once to check the credentials, optionally remembering them
    Login {
        /// Homeserver base URL
        #[clap(long, short)]
        server: String,

        /// `name`, `@name` or `@name:server`
        #[clap(long, short)]
        user: String,

        #[clap(long, env = "HARMONY_PASSWORD", hide_env_values = true)]
        password: String,

        #[clap(long)]
        device_name: Option<String>,

        /// Store the account in the credential file
        #[clap(long)]
        remember: bool,
    },

    /// List remembered accounts
    Accounts,

    /// Forget a remembered account
    Forget {
        /// Full user id
        user: String,
    },
}

/// Parse the process arguments.
#[instrument(level = "debug")]
pub fn parse() -> Args {
    let args = Args::parse();
    debug!("🔧 Command line arguments parsed: {:?}", args.command);
    args
}
