//! Join credentials and the socket URL derived from them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;
use futures::future::BoxFuture;
use url::Url;

use crate::error::{CredentialError, JoinError};

/// Supplies a short-lived join key for a world.
pub trait JoinKeyProvider: Send + Sync {
    /// Fetch a join key for `room_id`.
    fn join_key<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<String, CredentialError>>;

    /// Whether a fresh key can be fetched after a drop. One-shot keys
    /// cannot, so a client built on one does not rejoin automatically.
    fn supports_rejoin(&self) -> bool {
        true
    }
}

/// A join key obtained out of band. Usable once.
#[derive(Debug, Clone)]
pub struct FixedJoinKey {
    key: String,
}

impl FixedJoinKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl JoinKeyProvider for FixedJoinKey {
    fn join_key<'a>(&'a self, _room_id: &'a str) -> BoxFuture<'a, Result<String, CredentialError>> {
        let result = if self.key.is_empty() {
            Err(CredentialError::Missing)
        } else {
            Ok(self.key.clone())
        };
        futures::future::ready(result).boxed()
    }

    fn supports_rejoin(&self) -> bool {
        false
    }
}

/// Build `{game_ws}/ws?joinKey=<key>[&joinData=<base64(json)>]`.
pub fn join_url(
    game_ws: &str,
    join_key: &str,
    join_data: Option<&serde_json::Value>,
) -> Result<Url, JoinError> {
    let base = format!("{}/ws", game_ws.trim_end_matches('/'));
    let mut url = Url::parse(&base).map_err(|e| JoinError::InvalidEndpoint(e.to_string()))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("joinKey", join_key);
        if let Some(data) = join_data {
            query.append_pair("joinData", &STANDARD.encode(data.to_string()));
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fixed_key_is_one_shot() {
        let provider = FixedJoinKey::new("abc");
        assert_eq!(provider.join_key("world").await.unwrap(), "abc");
        assert!(!provider.supports_rejoin());
    }

    #[tokio::test]
    async fn test_empty_fixed_key_is_missing() {
        let provider = FixedJoinKey::new("");
        assert!(matches!(
            provider.join_key("world").await,
            Err(CredentialError::Missing)
        ));
    }

    #[test]
    fn test_url_without_join_data() {
        let url = join_url("wss://game.example/", "k3y", None).unwrap();
        assert_eq!(url.as_str(), "wss://game.example/ws?joinKey=k3y");
    }

    #[test]
    fn test_url_carries_base64_join_data() {
        let data = json!({"world_title": "Test"});
        let url = join_url("wss://game.example", "k3y", Some(&data)).unwrap();
        let encoded = url
            .query_pairs()
            .find(|(k, _)| k == "joinData")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&decoded).unwrap(),
            data
        );
    }

    #[test]
    fn test_bad_endpoint_rejected() {
        assert!(matches!(
            join_url("not a url", "k", None),
            Err(JoinError::InvalidEndpoint(_))
        ));
    }
}
