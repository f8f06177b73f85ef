//! Configuration for the world client.
//!
//! Settings persist to disk as RON, can be overridden from the command line
//! via clap, and map onto [`worldlink_net::ClientSettings`].

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    AccountConfig, ClientConfig, Config, DebugConfig, EndpointConfig, RateLimitConfig,
    default_config_dir,
};
pub use error::ConfigError;
