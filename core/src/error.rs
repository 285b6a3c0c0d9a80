use thiserror::Error;

/// Failures at the streaming boundary. Everything inside the engine is total.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("producer queue is full")]
    QueueFull,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("operation timed out")]
    Timeout,
}

impl TransportError {
    /// Fatal errors stop a consumer loop; the rest are logged and retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::UnknownChannel(_))
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_closed_and_unknown_channels_are_fatal() {
        assert!(TransportError::Closed.is_fatal());
        assert!(TransportError::UnknownChannel("x".into()).is_fatal());
        assert!(!TransportError::Timeout.is_fatal());
        assert!(!TransportError::QueueFull.is_fatal());
    }

    #[test]
    fn codec_errors_convert() {
        let err: TransportError = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert!(matches!(err, TransportError::Codec(_)));
        assert!(err.to_string().starts_with("codec error"));
    }
}
