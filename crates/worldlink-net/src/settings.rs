//! Runtime settings for a [`GameClient`](crate::GameClient).

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reconnection::ReconnectPolicy;

/// Default game WebSocket endpoint (staging).
pub const DEFAULT_GAME_WS: &str = "wss://server.pw-staging.rnc.priddle.nl";

/// Protocol chores the client answers on the application's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandledPacket {
    /// Echo pings immediately, bypassing the buckets.
    Ping,
    /// Acknowledge the init frame with `PlayerInitReceived`.
    Init,
}

/// Bucket ceilings. The init frame picks the default or elevated pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimits {
    pub interval: Duration,
    pub bulk_initial: u32,
    pub chat_initial: u32,
    pub bulk_default: u32,
    pub bulk_elevated: u32,
    pub chat_default: u32,
    pub chat_elevated: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            bulk_initial: 100,
            chat_initial: 10,
            bulk_default: 125,
            bulk_elevated: 200,
            chat_default: 5,
            chat_elevated: 10,
        }
    }
}

impl RateLimits {
    /// `(bulk, chat)` limits for a session.
    pub fn for_role(&self, elevated: bool) -> (u32, u32) {
        if elevated {
            (self.bulk_elevated, self.chat_elevated)
        } else {
            (self.bulk_default, self.chat_default)
        }
    }
}

/// Everything a session needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub reconnect: ReconnectPolicy,
    pub handle_packets: HashSet<HandledPacket>,
    /// How long an open socket may go without an init frame.
    pub handshake_timeout: Duration,
    /// Delay before the init event is delivered a second time.
    pub init_redelivery: Duration,
    pub rate_limits: RateLimits,
    /// Base WebSocket URL, without the `/ws` path.
    pub game_ws: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            handle_packets: HashSet::from([HandledPacket::Ping]),
            handshake_timeout: Duration::from_secs(10),
            init_redelivery: Duration::from_millis(1500),
            rate_limits: RateLimits::default(),
            game_ws: DEFAULT_GAME_WS.to_string(),
        }
    }
}

impl ClientSettings {
    pub fn handles(&self, packet: HandledPacket) -> bool {
        self.handle_packets.contains(&packet)
    }
}
