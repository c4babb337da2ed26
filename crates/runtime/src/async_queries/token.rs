//! Async query tokens.
//!
//! An HS256 JWT stored in a cookie that binds a browser session to an event
//! channel. Job events are published to that channel.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use chartdata_error::{ChartDataError, ErrorCode, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncClaims {
    /// Event channel id
    pub channel: String,
    /// User id; empty for anonymous sessions
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

pub struct AsyncTokenCodec {
    secret: SecretString,
    ttl: Duration,
    cookie_name: String,
}

impl AsyncTokenCodec {
    pub fn new(secret: SecretString, ttl: Duration, cookie_name: impl Into<String>) -> Self {
        Self {
            secret,
            ttl,
            cookie_name: cookie_name.into(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// New token on a fresh channel.
    pub fn issue(&self, user_id: &str) -> Result<(String, AsyncClaims)> {
        self.issue_for_channel(&uuid::Uuid::new_v4().to_string(), user_id)
    }

    pub fn issue_for_channel(&self, channel: &str, user_id: &str) -> Result<(String, AsyncClaims)> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ChartDataError::internal(e.to_string()))?
            .as_secs();
        let claims = AsyncClaims {
            channel: channel.to_string(),
            sub: user_id.to_string(),
            iat: now,
            exp: now + self.ttl.as_secs(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.expose_secret().as_bytes()),
        )
        .map_err(|e| ChartDataError::internal(format!("Failed to encode async token: {}", e)))?;

        Ok((token, claims))
    }

    /// Validate a token taken from the request cookie.
    pub fn parse(&self, token: Option<&str>) -> Result<AsyncClaims> {
        let token = token.filter(|t| !t.is_empty()).ok_or_else(|| {
            ChartDataError::new(ErrorCode::AsyncTokenInvalid, "Missing async token")
        })?;

        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<AsyncClaims>(
            token,
            &DecodingKey::from_secret(self.secret.expose_secret().as_bytes()),
            &validation,
        )
        .map_err(|e| {
            ChartDataError::new(ErrorCode::AsyncTokenInvalid, "Invalid async token")
                .with_hint(e.to_string())
        })?;

        if data.claims.channel.is_empty() {
            return Err(ChartDataError::new(
                ErrorCode::AsyncTokenInvalid,
                "Async token has no channel",
            ));
        }
        Ok(data.claims)
    }
}
