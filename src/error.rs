use std::io;

pub type Result<T> = std::result::Result<T, ProxyCacheError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transient failure talking to the origin. Counted by the reader and
    /// surfaced to blocked readers as a retryable error.
    #[error("error reading source {url}: {message}")]
    Source { url: String, message: String },

    #[error("too many redirects for {url}: {count}")]
    TooManyRedirects { url: String, count: usize },

    #[error("unexpected cache: cache [{cached} bytes] > source [{source_len} bytes]")]
    Inconsistent { cached: u64, source_len: u64 },

    #[error("error reading source {0} times")]
    ReadAttemptsExceeded(usize),

    #[error("cache is completed, appending is not allowed")]
    AlreadyCompleted,

    #[error("reading is interrupted")]
    Interrupted,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyCacheError {
    pub fn upstream(url: &str, message: impl Into<String>) -> Self {
        ProxyCacheError::Source {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ProxyCacheError::Interrupted)
    }

    /// The caller may invoke the failed operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyCacheError::Source { .. } | ProxyCacheError::ReadAttemptsExceeded(_)
        )
    }

    /// Permanent failures are never retried; every reader of the resource
    /// gets its own copy.
    pub fn fatal_copy(&self) -> Option<Self> {
        match self {
            ProxyCacheError::TooManyRedirects { url, count } => Some(ProxyCacheError::TooManyRedirects {
                url: url.clone(),
                count: *count,
            }),
            ProxyCacheError::Inconsistent { cached, source_len } => Some(ProxyCacheError::Inconsistent {
                cached: *cached,
                source_len: *source_len,
            }),
            _ => None,
        }
    }

    pub fn is_client_disconnect(&self) -> bool {
        match self {
            ProxyCacheError::Io(err) => is_disconnect(err),
            _ => false,
        }
    }
}

pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
