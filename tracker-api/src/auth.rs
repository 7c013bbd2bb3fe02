use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, StatusCode},
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::ApiContext;

/// JWT claims issued by the dashboard; `sub` is the user id.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Who is calling an authenticated endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    User(String),
    /// The external scheduler, authenticated with the cron secret.
    Scheduler,
}

impl Caller {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Caller::User(id) => Some(id),
            Caller::Scheduler => None,
        }
    }
}

/// Endpoints hit by mail clients, browsers and the provider.
fn is_passive(path: &str) -> bool {
    path == "/health"
        || path == "/webhooks/incoming"
        || path.starts_with("/pixel/")
        || path.starts_with("/click/")
}

/// Endpoints the scheduler may call with the cron secret.
fn accepts_cron_secret(path: &str) -> bool {
    matches!(path, "/replies/sync" | "/tracking/status" | "/subscriptions/renew")
}

fn extract_token(auth_header: Option<&str>) -> Option<String> {
    auth_header?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
}

/// The user a dashboard token was issued for, if the token is valid.
fn token_user(token: &str, secret: &str) -> Option<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "sub"]);

    match decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
        Ok(data) if !data.claims.sub.is_empty() => Some(data.claims.sub),
        Ok(_) => {
            tracing::debug!("Rejecting token without a subject");
            None
        }
        Err(e) => {
            tracing::debug!("Rejecting token: {}", e);
            None
        }
    }
}

/// Dashboard tokens are minted by the dashboard; tests mint their own.
#[cfg(test)]
pub(crate) fn issue_token(user_id: &str, secret: &str, ttl: chrono::Duration) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        sub: user_id.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp().max(0) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .unwrap_or_default()
}

pub async fn auth_middleware(
    mut req: Request,
    next: axum::middleware::Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path().to_string();
    if is_passive(&path) {
        return Ok(next.run(req).await);
    }

    let token = match extract_token(req.headers().get(AUTHORIZATION).and_then(|h| h.to_str().ok())) {
        Some(t) => t,
        None => {
            tracing::debug!("Missing Authorization header on {}", path);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let ctx = req
        .extensions()
        .get::<ApiContext>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;
    let server = &ctx.tracker.config.server;

    let caller = match &server.cron_secret {
        Some(secret) if accepts_cron_secret(&path) && token == *secret => Caller::Scheduler,
        _ => Caller::User(token_user(&token, &server.jwt_secret).ok_or(StatusCode::UNAUTHORIZED)?),
    };

    tracing::debug!("Authenticated {:?} for {}", caller, path);
    req.extensions_mut().insert(caller);

    Ok(next.run(req).await)
}
