// =============================================================================
// Harmony Matrix Client - Main Entry Point
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Terminal front end. Loads the configuration, sets up tracing, builds the
//   services and drains the UI channel to stdout.
//
// =============================================================================

use std::{process::ExitCode, sync::Arc};

use colored::Colorize;
use harmony::{
    core::{HarmonyConfig, LoginRequest, Result},
    service::accounts::CredentialStore,
    HttpSessionFactory, Notification, RenderUpdate, Services, UiEvent, UiReceiver,
};
use ruma::{RoomId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
    task::JoinHandle,
};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

mod clap;

#[tokio::main]
async fn main() -> ExitCode {
    let args = clap::parse();

    let config = match HarmonyConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(args.log_level.as_deref().unwrap_or(&config.log));
    info!("🚀 Starting Harmony {}", clap::version());

    let result = match args.command {
        clap::Commands::Run => run(config).await,
        clap::Commands::Chat { user, room } => chat(config, &user, &room).await,
        clap::Commands::Login {
            server,
            user,
            password,
            device_name,
            remember,
        } => {
            let request = LoginRequest {
                server_url: server,
                user,
                password,
                device_name,
                remember,
            };
            login(config, request).await
        }
        clap::Commands::Accounts => list_accounts(&config).await,
        clap::Commands::Forget { user } => forget(&config, &user).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {}", e);
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(filter: &str) {
    let filter_layer = match EnvFilter::try_new(filter) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your log filter is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::new("warn")
        }
    };
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let subscriber = tracing_subscriber::registry().with(filter_layer).with(fmt_layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Cannot install tracing subscriber: {e}");
    }
}

async fn build(config: HarmonyConfig) -> Result<(Arc<Services>, UiReceiver)> {
    let factory = Arc::new(HttpSessionFactory::new(config.sync.clone())?);
    Services::build(config, factory).await
}

fn spawn_printer(ui: UiReceiver) -> JoinHandle<()> {
    tokio::spawn(ui.run(|event| print_event(&event)))
}

fn print_event(event: &UiEvent) {
    match event {
        UiEvent::Notification(notification) => print_notification(notification),
        UiEvent::Render { room_id, update, .. } => match update {
            RenderUpdate::Inserted { block, .. } => {
                println!("{} {}", format!("[{room_id}]").dimmed(), block.html);
            }
            RenderUpdate::HistoryExhausted => {
                println!("{}", format!("[{room_id}] beginning of history").dimmed());
            }
            RenderUpdate::Confirmed { .. } | RenderUpdate::Scrolled { .. } => {}
        },
        UiEvent::Error { scope, kind, message } => {
            eprintln!("{} [{}] {}: {}", "error".red().bold(), scope, kind, message);
        }
    }
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::NewAccount { user_id } => println!("{} {}", "logged in".green(), user_id),
        Notification::AccountGone { user_id } => println!("{} {}", "logged out".yellow(), user_id),
        Notification::LoginFailed { user_id, kind, message } => {
            println!("{} {} ({}): {}", "login failed".red(), user_id, kind, message);
        }
        Notification::NewRoom { user_id, room_id } => println!("{} {} joined {}", "room".cyan(), user_id, room_id),
        Notification::RoomRename { room_id, name, .. } => println!("{} {} is now {}", "room".cyan(), room_id, name.bold()),
        Notification::LeftRoom { user_id, room_id } => println!("{} {} left {}", "room".cyan(), user_id, room_id),
        Notification::NewInvite {
            user_id,
            room_id,
            display_name,
            invited_by,
            ..
        } => {
            let by = invited_by.as_ref().map(|u| format!(" by {u}")).unwrap_or_default();
            println!("{} {} to {} ({}){}", "invite".magenta(), user_id, display_name.bold(), room_id, by);
        }
        Notification::NewMessage { room_id, sender, .. } => {
            println!("{} {} in {}", "message".blue(), sender, room_id);
        }
        Notification::AccountChange { .. } | Notification::Presence { .. } | Notification::Ephemeral { .. } => {}
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("⚠️ Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("⚠️ Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;
    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }
    warn!("Received {}, shutting down...", sig);
}

async fn run(config: HarmonyConfig) -> Result<()> {
    let (services, ui) = build(config).await?;
    let printer = spawn_printer(ui);

    let pending = services.accounts.login_using_config().await?;
    if pending.is_empty() {
        println!("No remembered accounts. Use `harmony login --remember` first.");
    }

    shutdown_signal().await;
    services.shutdown();
    printer.abort();
    Ok(())
}

async fn chat(config: HarmonyConfig, user: &str, room: &str) -> Result<()> {
    let user_id = UserId::parse(user)?;
    let room_id = RoomId::parse(room)?;
    let (services, ui) = build(config).await?;
    let printer = spawn_printer(ui);

    for login in services.accounts.login_using_config().await? {
        if login.user_id == user_id {
            login.wait().await?;
        }
    }
    let view = services.open_chat(&user_id, &room_id)?;
    info!("✅ Chatting in {} as {}", room_id, user_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                // Failures are already printed into the view
                Some(line) => {
                    let _ = services.eval(view.clone(), &line).await;
                }
                None => break,
            },
        }
    }

    services.shutdown();
    printer.abort();
    Ok(())
}

async fn login(config: HarmonyConfig, request: LoginRequest) -> Result<()> {
    let remember = request.remember;
    let (services, ui) = build(config).await?;
    let printer = spawn_printer(ui);

    let user_id = services.accounts.login(request, |_| {})?.wait().await?;
    if remember {
        println!("{} {}", "remembered".green(), user_id);
        services.shutdown();
    } else {
        services.logout(&user_id).await?;
    }
    printer.abort();
    Ok(())
}

async fn list_accounts(config: &HarmonyConfig) -> Result<()> {
    let store = CredentialStore::new(config.accounts_file.clone());
    let credentials = store.read().await?;
    if credentials.is_empty() {
        println!("No remembered accounts in {}", store.path().display());
    }
    for credential in credentials {
        println!("{} {}", credential.user_id.bold(), credential.server_url.dimmed());
    }
    Ok(())
}

async fn forget(config: &HarmonyConfig, user: &str) -> Result<()> {
    let store = CredentialStore::new(config.accounts_file.clone());
    if store.remove(user).await? {
        println!("{} {}", "forgot".yellow(), user);
    } else {
        println!("{} is not remembered", user);
    }
    Ok(())
}
