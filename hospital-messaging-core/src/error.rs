// hospital-messaging-core/src/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    /// Broker unreachable or the session dropped; the owning role goes inert.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("handler error: {0}")]
    Handler(String),

    /// A delivery lacks metadata its consumer depends on (e.g. no `reply_to`).
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid routing key {key:?}: {reason}")]
    InvalidRoutingKey { key: String, reason: &'static str },

    #[error("configuration error: {0}")]
    Config(String),
}

impl MessagingError {
    /// Errors after which the session cannot be used any more.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MessagingError::Connection(_))
    }

    /// Short stable label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            MessagingError::Connection(_) => "connection",
            MessagingError::Publish(_) => "publish",
            MessagingError::Subscribe(_) => "subscribe",
            MessagingError::Handler(_) => "handler",
            MessagingError::Malformed(_) => "malformed",
            MessagingError::InvalidRoutingKey { .. } => "invalid_routing_key",
            MessagingError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_errors_are_fatal() {
        assert!(MessagingError::Connection("refused".into()).is_fatal());
        assert!(!MessagingError::Publish("closed".into()).is_fatal());
        assert!(!MessagingError::Malformed("no reply_to".into()).is_fatal());
    }

    #[test]
    fn invalid_key_message_names_the_key() {
        let err = MessagingError::InvalidRoutingKey {
            key: "knee.hip".into(),
            reason: "must be a single word",
        };
        assert_eq!(
            err.to_string(),
            "invalid routing key \"knee.hip\": must be a single word"
        );
        assert_eq!(err.as_label(), "invalid_routing_key");
    }
}
