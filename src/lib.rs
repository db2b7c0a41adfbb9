//! This crate provides an in-process broker core in the style of [Apache RocketMQ](http://rocketmq.apache.org):
//! queues with acknowledgment tracking, topics routed into queues through SQL-like filter
//! operators, and push consumers with at-least-once delivery.
//!
//! ```no_run
//! use rocketmq_broker_core::broker::Broker;
//! use rocketmq_broker_core::config::{BrokerConfig, KeyValue};
//! use rocketmq_broker_core::listener::AutoAckListener;
//! use rocketmq_broker_core::message::Message;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::new(BrokerConfig::default());
//!     broker.startup();
//!     broker.create_and_update_queue("HELLO_QUEUE", KeyValue::new())?;
//!
//!     let consumer = broker.create_push_consumer();
//!     consumer.attach_queue(
//!         "HELLO_QUEUE",
//!         AutoAckListener::new(|message: &Message| {
//!             println!("Received one message: {:?}", message.body());
//!             Ok(())
//!         }),
//!     )?;
//!     consumer.startup();
//!
//!     broker.send("HELLO_QUEUE", Message::new("Hello"))?;
//!
//!     consumer.shutdown().await;
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```
pub mod broker;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod listener;
pub mod message;
pub mod queue;
pub mod route;
pub mod topic;
