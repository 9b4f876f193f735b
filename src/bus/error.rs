// Bus error types
//
// Every failed bus request carries the HTTP method and endpoint it was made
// against, so a log line is enough to tell which call broke.

/// Errors returned by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus answered with a non-2xx status.
    #[error("{method} {endpoint} failed with status {status}: {body}")]
    Http {
        method: &'static str,
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The bus rejected the credential (401/403).
    #[error("{method} {endpoint} rejected the credential (status {status})")]
    Unauthorized {
        method: &'static str,
        endpoint: String,
        status: u16,
    },

    /// The request never produced a response (connect, TLS, body read).
    #[error("{method} {endpoint} transport error: {source}")]
    Transport {
        method: &'static str,
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The response body did not have the expected shape.
    #[error("failed to decode response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
}

impl BusError {
    /// HTTP status code, when the bus produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            BusError::Http { status, .. } | BusError::Unauthorized { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Endpoint the failing request targeted.
    pub fn endpoint(&self) -> &str {
        match self {
            BusError::Http { endpoint, .. }
            | BusError::Unauthorized { endpoint, .. }
            | BusError::Transport { endpoint, .. }
            | BusError::Decode { endpoint, .. } => endpoint,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, BusError::Unauthorized { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, BusError::Transport { .. })
    }
}

/// Result type for bus operations.
pub type BusResult<T> = std::result::Result<T, BusError>;
