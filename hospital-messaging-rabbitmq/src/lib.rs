mod options;
mod rabbit_broker;

pub use options::RabbitMqOptions;
pub use rabbit_broker::{RabbitConnector, RabbitConsumer, RabbitProducer};
