//! Cross-cutting request handling applied uniformly to the router.

use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;

use chartdata_common::auth::AuthenticatedUser;

use crate::state::AppState;
use crate::{ACTIVE_REQUESTS, HTTP_REQUESTS};

/// The async token a handler should use, resolved by [`async_token_cookie`].
/// `None` means the caller presented no token, or one that is invalid or not
/// theirs.
#[derive(Debug, Clone)]
pub struct AsyncToken(pub Option<String>);

/// Value of cookie `name` in the request headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

pub async fn track_requests(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().clone();
    let start = Instant::now();

    ACTIVE_REQUESTS.inc();
    let response = next.run(req).await;
    ACTIVE_REQUESTS.dec();

    let status = response.status();
    HTTP_REQUESTS
        .with_label_values(&[route.as_str(), status.as_str()])
        .inc();
    tracing::debug!(
        method = %method,
        route = %route,
        status = status.as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request handled"
    );
    response
}

/// Keep the caller's async session token valid.
///
/// With async queries enabled, a caller without a valid token gets a fresh
/// one in the response cookie. The current request only ever sees the token
/// the caller presented, so it fails async checks until the cookie is sent
/// back.
pub async fn async_token_cookie(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let manager = match state.gateway.async_queries() {
        Some(manager) if state.flags().global_async_queries => manager.clone(),
        _ => return next.run(req).await,
    };
    let user_id = req
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|u| u.id.clone())
        .unwrap_or_else(|| AuthenticatedUser::anonymous().id);

    let tokens = manager.tokens();
    let presented = cookie_value(req.headers(), tokens.cookie_name());
    let presented_valid = presented.as_deref().is_some_and(|token| {
        tokens
            .parse(Some(token))
            .is_ok_and(|claims| claims.sub == user_id)
    });

    if presented_valid {
        req.extensions_mut().insert(AsyncToken(presented));
        return next.run(req).await;
    }

    let issued = match tokens.issue(&user_id) {
        Ok((token, _claims)) => Some(token),
        Err(e) => {
            tracing::error!(target: "errors", user_id = %user_id, "Failed to issue async token: {}", e);
            None
        }
    };

    req.extensions_mut().insert(AsyncToken(None));
    let mut response = next.run(req).await;

    if let Some(token) = issued {
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            tokens.cookie_name(),
            token,
            tokens.ttl().as_secs()
        );
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::error!(target: "errors", "Invalid async token cookie: {}", e),
        }
    }
    response
}
