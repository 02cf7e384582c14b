use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;

use crate::auth::{self, AuthResult};
use crate::state::AppState;

/// Extractor that validates the Bearer header against configured API keys.
pub struct Authenticated(pub AuthResult);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = StatusCode;

    fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let bearer = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "));

        let result = auth::validate_auth(&state.config, bearer);

        async move {
            match result {
                Some(auth) => Ok(Authenticated(auth)),
                None => Err(StatusCode::UNAUTHORIZED),
            }
        }
    }
}
