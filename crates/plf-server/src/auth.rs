use crate::error::ServerError;
use crate::routes::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use plf_proto::SYNC_TOKEN_HEADER;
use sha2::{Digest, Sha256};

/// SHA-256 of the accepted shared token. Presented tokens are hashed and
/// compared digest to digest.
#[derive(Clone)]
pub struct TokenDigest([u8; 32]);

impl TokenDigest {
    pub fn new(token: &str) -> Self {
        Self(Sha256::digest(token.as_bytes()).into())
    }

    pub fn matches(&self, presented: &str) -> bool {
        let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        presented
            .iter()
            .zip(self.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for TokenDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenDigest(..)")
    }
}

// --- Sync token middleware ---
pub async fn require_sync_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let presented = req
        .headers()
        .get(SYNC_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());

    match presented {
        Some(token) if state.token.matches(token) => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "rejected request with wrong sync token");
            Err(ServerError::Unauthorized)
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "rejected request without sync token");
            Err(ServerError::Unauthorized)
        }
    }
}
