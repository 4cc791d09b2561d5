//! Message broker
//!
//! A small AMQP-flavoured broker: named queues, fanout exchanges, consumer
//! prefetch and explicit acknowledgements. It runs inside the coordinator
//! process and is reachable by workers over TCP.

pub mod client;
pub mod core;
pub mod protocol;
pub mod server;

pub use client::{Channel, Connection, Consumer};
pub use self::core::{Broker, ChannelId, Delivery, DeliveryTag, Properties, QueueOptions};
pub use server::BrokerServer;
