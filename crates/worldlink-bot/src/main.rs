//! Small chat bot built on the world client.
//!
//! Joins the configured world, logs chat with the sender's name, and answers
//! `!ping`. Configuration is loaded from `config.ron` and can be overridden
//! via CLI flags, e.g. `worldlink-bot --world <id> --token <token>`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use parking_lot::RwLock;
use worldlink_api::{ApiClient, ApiEndpoints};
use worldlink_config::{CliArgs, Config, default_config_dir};
use worldlink_net::{
    Event, EventKind, Flow, GameClient, HookState, PacketKind, Reconnect, WorldPacket,
};

/// Player names by id, kept current from init/join/leave packets.
#[derive(Default)]
struct Roster {
    names: RwLock<HashMap<u32, String>>,
}

impl Roster {
    /// Track roster changes and expose the sender's name as `username`.
    fn observe(&self, event: &Event) -> HookState {
        let mut state = HookState::new();
        match event.packet() {
            Some(WorldPacket::PlayerInit(init)) => {
                let me = &init.properties;
                self.names.write().insert(me.player_id, me.username.clone());
            }
            Some(WorldPacket::PlayerJoined(joined)) => {
                let p = &joined.properties;
                self.names.write().insert(p.player_id, p.username.clone());
            }
            Some(WorldPacket::PlayerLeft(left)) => {
                if let Some(name) = self.names.write().remove(&left.player_id) {
                    state.insert("username", name);
                }
            }
            Some(WorldPacket::PlayerChat(chat)) => {
                if let Some(name) = self.names.read().get(&chat.player_id) {
                    state.insert("username", name.clone());
                }
            }
            _ => {}
        }
        state
    }
}

/// Bot reply for a chat line, if any.
fn reply_for(message: &str) -> Option<String> {
    match message.split_whitespace().next()? {
        "!ping" => Some("pong".to_string()),
        _ => None,
    }
}

fn build_api(config: &Config) -> anyhow::Result<ApiClient> {
    let endpoints = ApiEndpoints {
        api: config.endpoints.api.clone(),
        game_http: config.endpoints.game_http.clone(),
    };
    let account = &config.account;
    match (&account.token, &account.email, &account.password) {
        (Some(token), _, _) => Ok(ApiClient::with_token(token, endpoints)),
        (None, Some(email), Some(password)) => {
            Ok(ApiClient::with_credentials(email, password, endpoints))
        }
        _ => bail!("no account token or email/password configured"),
    }
}

fn register_handlers(client: &GameClient, roster: Arc<Roster>) {
    let pipeline = client.pipeline();

    pipeline.add_hook(move |event: &Event| anyhow::Ok(roster.observe(event)));

    let responder = client.clone();
    pipeline.add_callback(
        PacketKind::PlayerChat,
        move |event: &mut Event, state: &HookState| {
            if let Some(WorldPacket::PlayerChat(chat)) = event.packet() {
                let name = state
                    .get_as::<String>("username")
                    .unwrap_or_else(|| format!("#{}", chat.player_id));
                tracing::info!("{}: {}", name, chat.message);
                if let Some(reply) = reply_for(&chat.message) {
                    responder.send(WorldPacket::chat(reply));
                }
            }
            anyhow::Ok(Flow::Continue)
        },
    );

    pipeline.add_callback(
        PacketKind::PlayerJoined,
        |event: &mut Event, _: &HookState| {
            if let Some(WorldPacket::PlayerJoined(joined)) = event.packet() {
                tracing::info!("{} joined", joined.properties.username);
            }
            anyhow::Ok(Flow::Continue)
        },
    );

    pipeline.add_callback(
        PacketKind::PlayerLeft,
        |_: &mut Event, state: &HookState| {
            if let Some(name) = state.get_as::<String>("username") {
                tracing::info!("{} left", name);
            }
            anyhow::Ok(Flow::Continue)
        },
    );

    pipeline.add_callback(EventKind::Error, |event: &mut Event, _: &HookState| {
        if let Event::Error(failure) = event {
            tracing::warn!("Handler failed: {}", failure);
        }
        anyhow::Ok(Flow::Continue)
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone() {
        Some(dir) => dir,
        None => default_config_dir()?,
    };

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    worldlink_log::init_logging(cfg!(debug_assertions).then_some(log_dir.as_path()), Some(&config))
        .context("failed to initialise logging")?;

    let world_id = config
        .account
        .world_id
        .clone()
        .context("no world configured, pass --world <id>")?;

    let api = build_api(&config)?;
    if !api.logged_in() {
        api.authenticate().await.context("authentication failed")?;
    }
    match api.game_version(false).await {
        Ok(version) => tracing::info!("Game version {}", version),
        Err(e) => tracing::warn!("Could not fetch game version: {}", e),
    }

    let client = GameClient::new(config.to_client_settings(), Arc::new(api));
    register_handlers(&client, Arc::new(Roster::default()));

    client.join(&world_id, None).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    client.disconnect(Reconnect::No).await;
    Ok(())
}
