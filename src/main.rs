//! keygate - time-bounded access keys with seat limits and a blacklist

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use keygate::{
    blacklist::format_instant,
    cli::{BansCommand, Cli, Command, KeysCommand},
    clock::{Clock, SystemClock},
    config::Config,
    server::{AppState, Server},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let Some(config) = load_config(&cli) else {
        return ExitCode::FAILURE;
    };

    // Handle subcommands
    match cli.command {
        Some(Command::Keys(cmd)) => run_keys_command(cmd, &config).await,
        Some(Command::Bans(cmd)) => run_bans_command(cmd, &config).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if let Some(ref dir) = cli.data_dir {
                config.storage.data_dir = dir.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Open the collections without serving
async fn open_state(config: &Config) -> Option<AppState> {
    match AppState::open(config, Arc::new(SystemClock)).await {
        Ok(state) => Some(state),
        Err(e) => {
            eprintln!("❌ Failed to open collections: {e}");
            None
        }
    }
}

/// Run key maintenance commands
async fn run_keys_command(cmd: KeysCommand, config: &Config) -> ExitCode {
    let Some(state) = open_state(config).await else {
        return ExitCode::FAILURE;
    };

    match cmd {
        KeysCommand::List { format } => {
            let keys = state.keys.store().list().await;
            if format == "json" {
                match serde_json::to_string_pretty(&keys) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("❌ Failed to serialize to JSON: {e}");
                        return ExitCode::FAILURE;
                    }
                }
                return ExitCode::SUCCESS;
            }

            if keys.is_empty() {
                println!("No keys stored.");
                return ExitCode::SUCCESS;
            }

            let now = state.clock.now();
            println!("{} key(s):\n", keys.len());
            for key in &keys {
                let status = if key.is_active(now) { "active" } else { "expired" };
                println!("  {}  [{status}]", key.token);
                println!("     Owner:   {}", key.identity);
                println!(
                    "     Seats:   {}/{}",
                    key.consumed_by.len(),
                    key.max_users
                );
                println!("     Expires: {}", format_instant(key.expires_at));
                if !key.consumed_by.is_empty() {
                    let players: Vec<&str> = key.consumed_by.iter().map(String::as_str).collect();
                    println!("     Players: {}", players.join(", "));
                }
            }
            ExitCode::SUCCESS
        }
        KeysCommand::Purge => match state.keys.purge_expired().await {
            Ok(count) => {
                println!("✅ Removed {count} expired key(s)");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ Purge failed: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Run blacklist inspection commands
async fn run_bans_command(cmd: BansCommand, config: &Config) -> ExitCode {
    let Some(state) = open_state(config).await else {
        return ExitCode::FAILURE;
    };

    match cmd {
        BansCommand::List { format } => {
            let bans = state.blacklist.list().await;
            if format == "json" {
                match serde_json::to_string_pretty(&bans) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("❌ Failed to serialize to JSON: {e}");
                        return ExitCode::FAILURE;
                    }
                }
                return ExitCode::SUCCESS;
            }

            if bans.is_empty() {
                println!("Blacklist is empty.");
                return ExitCode::SUCCESS;
            }

            let now = state.clock.now();
            println!("{} ban(s):\n", bans.len());
            for ban in &bans {
                let status = if ban.expiry.is_active(now) { "active" } else { "lapsed" };
                println!("  {:<6} {}  [{status}]  {}", ban.scope.to_string(), ban.value, ban.expiry);
            }
            ExitCode::SUCCESS
        }
    }
}

/// Run the HTTP server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        data_dir = %config.storage.data_dir.display(),
        "Starting keygate"
    );

    let server = match Server::new(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to start server: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
