//! Error types for provider capability calls.
//!
//! Every failure a provider adapter reports back to the engine is one of these
//! variants. Each carries enough context to be written into a terminal
//! `failed` progress record via [`ProviderError::status_code`].

use thiserror::Error;

/// Message recorded when a provider rejects the caller's token.
pub const INVALID_TOKEN_MESSAGE: &str = "Token is invalid. Response returned a 401 status code.";

/// Errors returned by [`ProviderCapability`](super::ProviderCapability) implementations.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The provider rejected the token (401) or denied access (403).
    #[error("{message}")]
    Auth {
        /// HTTP status reported by the provider.
        status: u16,
        /// Human-readable reason.
        message: String,
    },

    /// The resource id is unknown to the provider for this user.
    #[error("Resource with id '{resource_id}' not found for this user.")]
    NotFound {
        /// The resource id that could not be found.
        resource_id: String,
    },

    /// The resource existed once but is no longer available.
    #[error("The requested resource '{resource_id}' is no longer available.")]
    Gone {
        /// The resource id that is gone.
        resource_id: String,
    },

    /// The provider refused the request as malformed or not allowed.
    #[error("{message}")]
    BadRequest {
        /// Human-readable reason.
        message: String,
    },

    /// Network failure or 5xx response.
    #[error("provider request to {url} failed{}: {message}", status_suffix(.status))]
    Transport {
        /// The request URL.
        url: String,
        /// HTTP status if the provider answered at all.
        status: Option<u16>,
        /// Underlying error text.
        message: String,
    },

    /// The provider adapter does not implement this operation.
    #[error("provider '{provider}' does not implement '{operation}'")]
    Unsupported {
        /// Provider name.
        provider: String,
        /// Operation that was requested.
        operation: &'static str,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with HTTP {s}")).unwrap_or_default()
}

impl ProviderError {
    /// Creates the canonical invalid-token error.
    #[must_use]
    pub fn invalid_token() -> Self {
        Self::Auth {
            status: 401,
            message: INVALID_TOKEN_MESSAGE.to_string(),
        }
    }

    /// Creates the canonical access-denied error.
    #[must_use]
    pub fn forbidden() -> Self {
        Self::Auth {
            status: 403,
            message: "User does not have access to this resource with the token provided."
                .to_string(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource_id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_id: resource_id.into(),
        }
    }

    /// Creates a bad-request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(url: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            status,
            message: message.into(),
        }
    }

    /// Creates an unsupported-operation error.
    #[must_use]
    pub fn unsupported(provider: impl Into<String>, operation: &'static str) -> Self {
        Self::Unsupported {
            provider: provider.into(),
            operation,
        }
    }

    /// Maps an HTTP error status from a provider to the matching variant.
    #[must_use]
    pub fn from_status(status: u16, url: &str, resource_id: &str) -> Self {
        match status {
            401 => Self::invalid_token(),
            403 => Self::forbidden(),
            404 => Self::not_found(resource_id),
            410 => Self::Gone {
                resource_id: resource_id.to_string(),
            },
            400..=499 => Self::bad_request(format!(
                "Response has status code {status} for resource '{resource_id}'"
            )),
            _ => Self::transport(url, Some(status), "provider returned an error status"),
        }
    }

    /// Returns the semantic status code recorded on a failed ticket.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Auth { status, .. } => *status,
            Self::NotFound { .. } => 404,
            Self::Gone { .. } => 410,
            Self::BadRequest { .. } | Self::Unsupported { .. } => 400,
            Self::Transport { status, .. } => match status {
                Some(s) if *s >= 500 => *s,
                _ => 502,
            },
        }
    }

    /// Returns true when the provider rejected the credentials.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}
