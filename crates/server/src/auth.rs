use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use chartdata_common::auth::AuthenticatedUser;
use chartdata_common::config::{ApiKeyConfig, AuthSettings};
use chartdata_error::{ChartDataError, ErrorCode, Result};

use crate::error::ApiError;

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedUser>;
}

fn unauthorized(message: &str) -> ChartDataError {
    ChartDataError::new(ErrorCode::Unauthorized, message)
}

/// API keys from configuration, verified against their Argon2 hashes.
pub struct ApiKeyAuthenticator {
    keys: Vec<ApiKeyConfig>,
    cache: Cache<String, AuthenticatedUser>,
}

impl ApiKeyAuthenticator {
    pub fn new(keys: Vec<ApiKeyConfig>, ttl_secs: u64, capacity: u64) -> Self {
        let cache = Cache::builder()
            .time_to_live(Duration::from_secs(ttl_secs))
            .max_capacity(capacity)
            .build();
        Self { keys, cache }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(
            settings.api_keys.clone(),
            settings.cache_ttl_secs,
            settings.cache_max_capacity,
        )
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedUser> {
        let token = match headers.get(header::AUTHORIZATION) {
            Some(t) => t
                .to_str()
                .map_err(|_| unauthorized("Invalid auth header"))?,
            None => return Err(unauthorized("Missing authorization header")),
        };

        let token = token.strip_prefix("Bearer ").unwrap_or(token);

        if let Some(user) = self.cache.get(token).await {
            return Ok(user);
        }

        let argon2 = Argon2::default();

        for key in &self.keys {
            let parsed_hash = match PasswordHash::new(&key.key_hash) {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::error!(user_id = %key.user_id, "Invalid API key hash in configuration: {}", e);
                    continue;
                }
            };

            if argon2.verify_password(token.as_bytes(), &parsed_hash).is_ok() {
                let user = AuthenticatedUser {
                    id: key.user_id.clone(),
                    username: key.username.clone(),
                    permissions: key.permissions.clone(),
                };
                self.cache.insert(token.to_string(), user.clone()).await;
                tracing::debug!(target: "audit", user_id = %user.id, "API key accepted");
                return Ok(user);
            }
        }

        Err(unauthorized("Invalid API Key"))
    }
}

/// Attach the caller to the request. Without an authenticator every caller is
/// anonymous.
pub async fn axum_auth_middleware(
    mut req: Request,
    next: Next,
    authenticator: Option<Arc<dyn Authenticator>>,
) -> Response {
    let user = match authenticator {
        Some(auth) => match auth.authenticate(req.headers()).await {
            Ok(user) => user,
            Err(e) => {
                tracing::info!(target: "audit", path = %req.uri().path(), "Rejected request: {}", e.message);
                return ApiError(e).into_response();
            }
        },
        None => AuthenticatedUser::anonymous(),
    };

    req.extensions_mut().insert(user);
    next.run(req).await
}
