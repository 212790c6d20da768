pub mod bus;
pub mod error;
pub mod handler;
pub mod logging;
pub mod memory;
pub mod pending;
pub mod roles;
pub mod routing;
pub mod types;

pub use bus::{Binding, Connector, Consumer, ConsumerTask, Producer, QueueName};
pub use error::MessagingError;
pub use handler::{AckHandle, DeliveryHandler, Settle};
pub use memory::MemoryExchange;
pub use pending::{PendingRequests, ReplyOutcome};
pub use routing::Specialization;
pub use types::{CorrelationId, Delivery, MessageProperties, Observed};
