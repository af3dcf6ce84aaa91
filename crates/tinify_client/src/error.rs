use reqwest::StatusCode;

/// Errors returned by the remote compression service or the transport
/// underneath it.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The API key was rejected (HTTP 401).
    #[error("tinypng: api key is unauthorized")]
    Unauthorized,

    /// The per-key rate limit was exceeded (HTTP 429).
    #[error("tinypng: too many requests (rate limit exceeded)")]
    TooManyRequests,

    /// The service rejected the input (HTTP 400).
    #[error("tinypng: bad request")]
    BadRequest,

    /// Any other 4xx/5xx, with the message from the service's
    /// `{error, message}` envelope.
    #[error("tinypng: remote error: {0}")]
    Remote(String),

    /// A status code the protocol does not account for.
    #[error("tinypng: unexpected status code {0}")]
    UnexpectedStatus(StatusCode),

    /// The request never produced a usable response.
    #[error("tinypng: transport error")]
    Transport(#[from] reqwest::Error),

    /// The response body could not be decoded.
    #[error("tinypng: failed to decode response body")]
    Decode(#[source] serde_json::Error),

    /// Reading the source or writing the destination failed.
    #[error("tinypng: io error")]
    Io(#[from] std::io::Error),

    /// The `Compression-Count` header was absent or unparsable.
    #[error("tinypng: compression count header is missing or malformed")]
    QuotaHeaderMissing,
}

impl ClientError {
    /// Whether this error means the API key itself is no longer usable
    /// for the remainder of the run (as opposed to a transient failure).
    pub fn is_key_rejection(&self) -> bool {
        matches!(
            self,
            ClientError::Unauthorized | ClientError::TooManyRequests
        )
    }
}
