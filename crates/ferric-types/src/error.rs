use std::fmt;

/// Conditions that are not failures: the caller must re-invoke the same
/// operation with identical arguments to make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// The transport needs readable data before the operation can continue.
    WantRead,
    /// The transport needs write capacity before the operation can continue.
    WantWrite,
    /// An out-of-band condition (e.g. an external lookup) must be satisfied.
    WantEvent,
    /// A cooperative job suspended at a blocking boundary; resume it.
    AsyncPaused,
    /// The cooperative scheduler has no free job slots; apply backpressure.
    AsyncNoJobs,
}

impl fmt::Display for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Retry::WantRead => "want read",
            Retry::WantWrite => "want write",
            Retry::WantEvent => "want event",
            Retry::AsyncPaused => "async job paused",
            Retry::AsyncNoJobs => "no async jobs available",
        };
        f.write_str(s)
    }
}

/// TLS control-plane errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Invalid setup (missing method, disabled matching table, bad lengths
    /// in configuration calls). Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed record or data supplied by the caller. The caller may retry
    /// with corrected input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation invoked out of the required state-machine order.
    #[error("operation out of sequence: {0}")]
    Sequence(String),

    /// Allocation or internal-invariant failure. Abandon the operation.
    #[error("resource error: {0}")]
    Resource(String),

    /// Terminal protocol state for the connection (e.g. write after the
    /// shutdown alert was sent).
    #[error("fatal protocol state: {0}")]
    Fatal(String),

    /// Retryable condition; re-invoke with identical arguments.
    #[error("retryable condition: {0}")]
    Retry(Retry),
}

impl TlsError {
    /// Whether this error is a retryable sentinel rather than a true failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TlsError::Retry(_))
    }

    /// The retry hint, if this is a retryable condition.
    pub fn retry_hint(&self) -> Option<Retry> {
        match self {
            TlsError::Retry(r) => Some(*r),
            _ => None,
        }
    }
}
