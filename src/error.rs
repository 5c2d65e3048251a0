use thiserror::Error;

/// Errors surfaced by the facade. Mirrors the shape of the teacher crate's
/// `RabbitMQError`: broker/codec errors are wrapped via `#[from]`, the
/// remaining variants describe facade-level invalid-state transitions.
#[derive(Error, Debug, Clone)]
pub enum FacadeError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("reconnect attempts exhausted: {0}")]
    ReconnectExhausted(String),
    #[error("consumer already defined")]
    ConsumerAlreadyDefined,
    #[error("no consumer defined")]
    NoConsumerDefined,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl From<lapin::Error> for FacadeError {
    fn from(err: lapin::Error) -> Self {
        FacadeError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for FacadeError {
    fn from(err: serde_json::Error) -> Self {
        FacadeError::Serialization(err.to_string())
    }
}

impl From<std::str::Utf8Error> for FacadeError {
    fn from(err: std::str::Utf8Error) -> Self {
        FacadeError::InvalidPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_errors_have_stable_messages() {
        assert_eq!(
            FacadeError::ConsumerAlreadyDefined.to_string(),
            "consumer already defined"
        );
        assert_eq!(
            FacadeError::NoConsumerDefined.to_string(),
            "no consumer defined"
        );
    }
}
