//! Synchronous request validation performed before any ticket exists.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::provider::Action;

/// Errors detected before a job is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// No provider with this name is configured.
    #[error("'{name}' is not a valid Target name.")]
    UnknownProvider {
        /// The requested provider name.
        name: String,
    },

    /// The provider does not declare the requested action.
    #[error("'{provider}' does not support the action '{action}'.")]
    UnsupportedAction {
        /// Provider name.
        provider: String,
        /// Requested action.
        action: Action,
    },

    /// A required token was not supplied.
    #[error("'{token_name}' missing in the request.")]
    MissingToken {
        /// Which token was missing (source or destination).
        token_name: &'static str,
    },

    /// The token presented to a status poll does not own the ticket.
    #[error("Token provided does not match the token used to create ticket '{ticket_id}'.")]
    TokenMismatch {
        /// The ticket being polled.
        ticket_id: String,
    },
}

impl ValidationError {
    /// Returns the client-error status code for this failure.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownProvider { .. } => 404,
            Self::UnsupportedAction { .. } | Self::MissingToken { .. } => 400,
            Self::TokenMismatch { .. } => 401,
        }
    }
}

/// Rejects a blank token and returns the trimmed value.
///
/// # Errors
///
/// Returns [`ValidationError::MissingToken`] when the token is absent or blank.
pub fn require_token<'a>(token: &'a str, token_name: &'static str) -> Result<&'a str, ValidationError> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingToken { token_name });
    }
    Ok(trimmed)
}

/// Hashes one or more tokens for storage on a ticket.
///
/// Tokens are joined in order so a transfer's source/destination pair hashes
/// differently from either token alone.
#[must_use]
pub fn hash_tokens(tokens: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (index, token) in tokens.iter().enumerate() {
        if index > 0 {
            hasher.update(b"\0");
        }
        hasher.update(token.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
