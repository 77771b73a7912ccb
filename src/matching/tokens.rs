//! Scoped room access tokens
//!
//! Each party of a match receives an HS256 token naming the user and the
//! match. Tokens minted for a pending match expire with the handshake
//! window; promotion re-mints them for the room's lifetime.

use crate::error::{MatchmakingError, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Claims carried by a room token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomClaims {
    pub sub: String,
    pub match_id: String,
    pub iat: usize,
    pub exp: usize,
}

/// Mints and verifies room tokens with a shared secret
pub struct RoomTokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl RoomTokenIssuer {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mint a token for `user_id` in `match_id` valid for `ttl` from `issued_at`
    pub fn mint(
        &self,
        user_id: &str,
        match_id: &str,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<String> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| MatchmakingError::TokenError {
            reason: format!("Token lifetime out of range: {}", e),
        })?;
        let claims = RoomClaims {
            sub: user_id.to_string(),
            match_id: match_id.to_string(),
            iat: issued_at.timestamp().max(0) as usize,
            exp: (issued_at + ttl).timestamp().max(0) as usize,
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            MatchmakingError::TokenError {
                reason: format!("Failed to encode room token: {}", e),
            }
            .into()
        })
    }

    /// Verify signature and expiry, returning the claims
    pub fn verify(&self, token: &str) -> Result<RoomClaims> {
        match decode::<RoomClaims>(token, &self.decoding_key, &Validation::default()) {
            Ok(data) => Ok(data.claims),
            Err(err) => {
                let reason = match err.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        "Room token expired".to_string()
                    }
                    _ => format!("Invalid room token: {}", err),
                };
                debug!("Room token rejected: {}", reason);
                Err(MatchmakingError::TokenError { reason }.into())
            }
        }
    }

    /// Verify a token and check it grants access to `match_id`
    pub fn verify_for_match(&self, token: &str, match_id: &str) -> Result<RoomClaims> {
        let claims = self.verify(token)?;
        if claims.match_id != match_id {
            return Err(MatchmakingError::TokenError {
                reason: format!("Token is not valid for match {}", match_id),
            }
            .into());
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_and_verify() {
        let issuer = RoomTokenIssuer::new("test-secret");
        let token = issuer
            .mint("alice", "m1", Utc::now(), Duration::from_secs(30))
            .unwrap();

        let claims = issuer.verify_for_match(&token, "m1").unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.exp - claims.iat, 30);
        assert!(issuer.verify_for_match(&token, "m2").is_err());
    }

    #[test]
    fn test_rejects_expired_and_foreign_tokens() {
        let issuer = RoomTokenIssuer::new("test-secret");
        let issued = Utc::now() - chrono::Duration::hours(2);
        let stale = issuer
            .mint("alice", "m1", issued, Duration::from_secs(60))
            .unwrap();
        assert!(issuer.verify(&stale).is_err());

        let other = RoomTokenIssuer::new("other-secret");
        let foreign = other
            .mint("alice", "m1", Utc::now(), Duration::from_secs(60))
            .unwrap();
        assert!(issuer.verify(&foreign).is_err());
    }
}
