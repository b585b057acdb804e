use std::time::Duration;

/// Provider failures, classified so callers can tell "already gone" and
/// "no capacity for this type" apart from everything else.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("out of stock: {0}")]
    OutOfStock(String),

    /// Resource is in a transient state or the API asked us to back off.
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("call deadline exceeded")]
    DeadlineExceeded,

    /// Resource reached a state the caller was not waiting for.
    #[error("unexpected state: {0}")]
    UnexpectedState(String),

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("provider api error: status={status} message={message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode provider response: {0}")]
    Decode(String),

    /// Client could not be built from the given credentials or endpoint.
    #[error("invalid provider configuration: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    pub fn is_out_of_stock(&self) -> bool {
        matches!(self, ProviderError::OutOfStock(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// True when the caller's context ended the call, not the provider.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProviderError::Cancelled | ProviderError::DeadlineExceeded)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_predicates() {
        assert!(ProviderError::NotFound("server 1".into()).is_not_found());
        assert!(ProviderError::OutOfStock("PRO2-XS".into()).is_out_of_stock());
        assert!(ProviderError::Transient("locked".into()).is_transient());
        assert!(ProviderError::Cancelled.is_cancellation());
        assert!(ProviderError::DeadlineExceeded.is_cancellation());

        let fatal = ProviderError::Api {
            status: 500,
            message: "boom".into(),
        };
        assert!(!fatal.is_not_found());
        assert!(!fatal.is_out_of_stock());
        assert!(!fatal.is_cancellation());
    }
}
