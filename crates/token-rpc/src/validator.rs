//! # Token Validator
//!
//! Thin adapter from "validate this token string" to an RPC call.

use crate::client::RpcClient;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identifier of an authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validates access tokens against the auth service over RPC.
///
/// Every failure mode collapses to `None`: a timed-out validation, a lost
/// connection, and a genuinely invalid token are indistinguishable to the
/// caller, so infrastructure state never leaks through the auth surface.
/// Callers that need the distinction use [`RpcClient::call`] directly.
#[derive(Clone)]
pub struct TokenValidator {
    client: Arc<RpcClient>,
}

impl TokenValidator {
    /// Wrap an RPC client.
    #[must_use]
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    /// Resolve a token to the user it authenticates, or `None`.
    ///
    /// Uses the client's default timeout. The reply is expected to be a
    /// UTF-8 decimal user id.
    pub async fn validate(&self, token: &str) -> Option<UserId> {
        let reply = match self
            .client
            .call_default(Bytes::copy_from_slice(token.as_bytes()))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "Token validation call failed");
                return None;
            }
        };

        let Ok(text) = std::str::from_utf8(&reply) else {
            warn!("Validation reply is not UTF-8");
            return None;
        };

        match text.trim().parse::<u64>() {
            Ok(id) => Some(UserId(id)),
            Err(_) => {
                warn!(reply = %text, "Malformed validation reply");
                None
            }
        }
    }
}
