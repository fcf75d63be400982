use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity, as asserted by the upstream gateway.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .ok_or((StatusCode::UNAUTHORIZED, "missing X-User-Id header".into()))?;

        let user_id = Uuid::parse_str(raw.trim())
            .map_err(|_| (StatusCode::UNAUTHORIZED, "invalid X-User-Id header".into()))?;

        Ok(AuthUser(user_id))
    }
}
