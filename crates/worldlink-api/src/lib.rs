//! Account API client: authentication, join keys, and the game server's
//! public metadata routes.
//!
//! [`ApiClient`] implements [`worldlink_net::JoinKeyProvider`], so a
//! `GameClient` built on it fetches a fresh join key for every join and
//! can rejoin on its own after a drop.

mod client;
mod error;

pub use client::{ApiCache, ApiClient, ApiEndpoints, AuthSession, DEFAULT_API, DEFAULT_GAME_HTTP};
pub use error::ApiError;
