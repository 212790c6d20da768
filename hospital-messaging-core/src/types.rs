// hospital-messaging-core/src/types.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque token matching a reply to the request that caused it.
///
/// Generated from a random UUID so that several requesters sharing one
/// exchange never hand out the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, enough to tell requests apart in logs.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Metadata travelling next to a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<CorrelationId>,
}

impl MessageProperties {
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// A message as handed to a [`DeliveryHandler`](crate::DeliveryHandler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub routing_key: String,
    /// Queue the message was taken from.
    pub queue: String,
    pub body: String,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

impl Delivery {
    /// Decodes a raw payload; broker bodies are text but are not trusted to be UTF-8.
    pub fn from_raw(
        routing_key: impl Into<String>,
        queue: impl Into<String>,
        data: &[u8],
        properties: MessageProperties,
        redelivered: bool,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            queue: queue.into(),
            body: String::from_utf8_lossy(data).into_owned(),
            properties,
            redelivered,
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.properties.correlation_id.as_ref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }
}

/// One line of the administrator's traffic log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observed {
    pub routing_key: String,
    pub body: String,
    pub correlation_id: Option<CorrelationId>,
    pub observed_at_utc: DateTime<Utc>,
}

impl Observed {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            routing_key: delivery.routing_key.clone(),
            body: delivery.body.clone(),
            correlation_id: delivery.properties.correlation_id.clone(),
            observed_at_utc: Utc::now(),
        }
    }
}

impl fmt::Display for Observed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.correlation_id {
            Some(id) => write!(
                f,
                "[{}] {} (request id: {})",
                self.routing_key,
                self.body,
                id.short()
            ),
            None => write!(f, "[{}] {}", self.routing_key, self.body),
        }
    }
}
