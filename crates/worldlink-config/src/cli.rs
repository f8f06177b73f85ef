//! Command-line argument parsing for the world client.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// World client command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "worldlink", about = "Real-time world client")]
pub struct CliArgs {
    /// Account token.
    #[arg(long)]
    pub token: Option<String>,

    /// Account email (used with --password).
    #[arg(long)]
    pub email: Option<String>,

    /// Account password.
    #[arg(long)]
    pub password: Option<String>,

    /// World to join.
    #[arg(long)]
    pub world: Option<String>,

    /// Account API base URL.
    #[arg(long)]
    pub api: Option<String>,

    /// Game server WebSocket URL.
    #[arg(long)]
    pub game_ws: Option<String>,

    /// Do not retry failed joins or rejoin after drops.
    #[arg(long)]
    pub no_reconnect: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref token) = args.token {
            self.account.token = Some(token.clone());
        }
        if let Some(ref email) = args.email {
            self.account.email = Some(email.clone());
        }
        if let Some(ref password) = args.password {
            self.account.password = Some(password.clone());
        }
        if let Some(ref world) = args.world {
            self.account.world_id = Some(world.clone());
        }
        if let Some(ref api) = args.api {
            self.endpoints.api = api.clone();
        }
        if let Some(ref ws) = args.game_ws {
            self.endpoints.game_ws = ws.clone();
        }
        if args.no_reconnect {
            self.client.reconnectable = false;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
