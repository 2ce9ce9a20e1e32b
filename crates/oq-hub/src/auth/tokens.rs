//! Token checkers: static hashed session tokens and signed service tokens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{TokenChecker, TokenData};

/// A configured session token. Only the SHA-256 hex digest is stored.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub sha256: String,
    pub user_id: String,
    #[serde(default)]
    pub is_server: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct StaticTokens {
    entries: Vec<TokenEntry>,
}

impl StaticTokens {
    pub fn new(entries: Vec<TokenEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|mut e| {
                e.sha256 = e.sha256.trim().to_ascii_lowercase();
                e
            })
            .collect();
        Self { entries }
    }
}

#[async_trait::async_trait]
impl TokenChecker for StaticTokens {
    async fn check(&self, token: &str) -> Option<TokenData> {
        let hash = sha256_hex(token);
        let now = Utc::now();
        let entry = self.entries.iter().find(|e| {
            constant_time_eq(&e.sha256, &hash) && e.expires_at.map_or(true, |at| at > now)
        })?;
        Some(TokenData {
            user_id: entry.user_id.clone(),
            is_server: entry.is_server,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    srv: bool,
    exp: i64,
}

/// HS256 tokens signed with the shared server secret.
pub struct ServerJwt {
    key: DecodingKey,
    validation: Validation,
}

impl ServerJwt {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Sign a token for `user_id` that expires after `ttl`.
    pub fn issue(
        secret: &str,
        user_id: &str,
        is_server: bool,
        ttl: chrono::Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: user_id.to_string(),
            srv: is_server,
            exp: (Utc::now() + ttl).timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
    }
}

#[async_trait::async_trait]
impl TokenChecker for ServerJwt {
    async fn check(&self, token: &str) -> Option<TokenData> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Some(TokenData {
                user_id: data.claims.sub,
                is_server: data.claims.srv,
            }),
            Err(e) => {
                tracing::debug!("Rejected signed token: {}", e);
                None
            }
        }
    }
}

/// Asks each checker in turn; the first to accept wins.
pub struct TokenChain {
    checkers: Vec<Arc<dyn TokenChecker>>,
}

impl TokenChain {
    pub fn new(checkers: Vec<Arc<dyn TokenChecker>>) -> Self {
        Self { checkers }
    }
}

#[async_trait::async_trait]
impl TokenChecker for TokenChain {
    async fn check(&self, token: &str) -> Option<TokenData> {
        for checker in &self.checkers {
            if let Some(data) = checker.check(token).await {
                return Some(data);
            }
        }
        None
    }
}

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    format!("{:x}", digest)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(token: &str, user: &str) -> TokenEntry {
        TokenEntry {
            sha256: sha256_hex(token).to_ascii_uppercase(),
            user_id: user.into(),
            is_server: false,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_static_token_matches_digest() {
        let tokens = StaticTokens::new(vec![entry("s3cret", "u1")]);
        let data = tokens.check("s3cret").await.unwrap();
        assert_eq!(data.user_id, "u1");
        assert!(!data.is_server);
        assert!(tokens.check("wrong").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_static_token_is_rejected() {
        let mut e = entry("old", "u1");
        e.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let tokens = StaticTokens::new(vec![e]);
        assert!(tokens.check("old").await.is_none());
    }

    #[tokio::test]
    async fn test_server_jwt_round_trip() {
        let token = ServerJwt::issue("secret", "svc", true, chrono::Duration::hours(1)).unwrap();
        let data = ServerJwt::new("secret").check(&token).await.unwrap();
        assert_eq!(data.user_id, "svc");
        assert!(data.is_server);
        assert!(ServerJwt::new("other").check(&token).await.is_none());
    }

    #[tokio::test]
    async fn test_chain_falls_through() {
        let chain = TokenChain::new(vec![
            Arc::new(StaticTokens::new(vec![entry("a", "ua")])),
            Arc::new(StaticTokens::new(vec![entry("b", "ub")])),
        ]);
        assert_eq!(chain.check("b").await.unwrap().user_id, "ub");
        assert!(chain.check("c").await.is_none());
    }
}
