use bytes::Bytes;
use thiserror::Error;

/// The terminal error of a logical fetch, as seen by every caller that was waiting on it.
///
/// All callers that joined the same fetch receive a clone of the same value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Every attempt failed with a retryable error, like connection loss, a timeout or a 5xx
    /// server response.
    ///
    /// The attached string describes the failure of the last attempt.
    #[error("transient failure after {attempts} attempts: {reason}")]
    TransientFailure { attempts: u32, reason: String },
    /// The transport completed, but answered with a status that is not usable and not worth
    /// retrying.
    #[error("invalid response: status {0}")]
    InvalidResponse(u16),
    /// The request can never succeed, for example because it is malformed or the response
    /// envelope could not be decoded.
    #[error("permanent failure: {0}")]
    PermanentFailure(String),
    /// Every caller interested in the fetch retracted its interest.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in fetchcache itself.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// A short, stable name of the variant, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::TransientFailure { .. } => "transient",
            Self::InvalidResponse(_) => "invalid_response",
            Self::PermanentFailure(_) => "permanent",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internal",
        }
    }
}

/// The result of a fetch, containing either the payload or the reason why it could not be
/// fetched.
pub type CacheContents<T = Bytes> = Result<T, CacheError>;
