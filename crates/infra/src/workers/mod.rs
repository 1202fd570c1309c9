//! Background workers.

pub mod order_events;

pub use order_events::{
    ConsumerConfig, ConsumerHandle, ConsumerStats, HandlerError, LoggingOrderHandler, OrderEventConsumer,
    OrderEventHandler,
};
