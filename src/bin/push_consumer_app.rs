//! Attaches push consumers to a plain queue and to a queue fed by a filtered routing,
//! publishes a few messages and shuts everything down.
//!
//! Usage: `push_consumer_app [broker-config.json]`, log level through `RUST_LOG`.
use rocketmq_broker_core::broker::Broker;
use rocketmq_broker_core::config::{BrokerConfig, KeyValue, DST_QUEUE, SRC_TOPIC};
use rocketmq_broker_core::consumer::PushConsumer;
use rocketmq_broker_core::error::Result;
use rocketmq_broker_core::listener::AutoAckListener;
use rocketmq_broker_core::message::Message;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SIMPLE_QUEUE: &str = "HELLO_QUEUE";
const COMPLEX_QUEUE: &str = "QUEUE_HAS_SOURCE_TOPIC";
const SOURCE_TOPIC: &str = "SOURCE_TOPIC";

fn printing_listener(
    queue: &'static str,
) -> AutoAckListener<impl Fn(&Message) -> std::result::Result<(), rocketmq_broker_core::listener::ListenerError>>
{
    AutoAckListener::new(move |message: &Message| {
        info!(
            queue,
            message_id = %message.id(),
            tag = message.tag().unwrap_or_default(),
            "Received one message"
        );
        Ok(())
    })
}

fn setup(broker: &Broker, consumer: &PushConsumer, another: &PushConsumer) -> Result<()> {
    // This queue has no source topic, so only messages sent to it directly are consumed.
    broker.create_and_update_queue(SIMPLE_QUEUE, KeyValue::new())?;
    consumer.attach_queue(SIMPLE_QUEUE, printing_listener(SIMPLE_QUEUE))?;
    consumer.startup();
    info!("Consumer startup OK");

    broker.create_and_update_queue(COMPLEX_QUEUE, KeyValue::new())?;
    broker.create_and_update_topic(SOURCE_TOPIC, KeyValue::new())?;
    let routing = broker.create_and_update_routing_with(
        "HELLO_ROUTING",
        KeyValue::new()
            .put(SRC_TOPIC, SOURCE_TOPIC)
            .put(DST_QUEUE, COMPLEX_QUEUE),
    )?;
    let operator = broker.create_and_update_operator(
        "SQL_OPERATOR",
        "TAGS is not null and TAGS in ('TagA', 'TagB')",
        KeyValue::new(),
    )?;
    broker.add_operator(routing.name(), &operator)?;

    another.attach_queue(COMPLEX_QUEUE, printing_listener(COMPLEX_QUEUE))?;
    another.startup();

    broker.send(SIMPLE_QUEUE, Message::new("Hello"))?;
    for tag in ["TagA", "TagB", "TagC"] {
        let enqueued = broker.publish(SOURCE_TOPIC, Message::new("Routed").with_tag(tag))?;
        info!(tag, copies = enqueued.len(), "Published");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::default(),
    };
    let broker = Broker::new(config);
    broker.startup();
    info!("Broker startup OK");

    let consumer = broker.create_push_consumer();
    let another = broker.create_push_consumer();
    let outcome = setup(&broker, &consumer, &another);
    if outcome.is_ok() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Teardown runs on every path, including a failed setup.
    consumer.shutdown().await;
    another.shutdown().await;
    broker.shutdown().await;

    if let Err(e) = &outcome {
        error!("Setup failed: {}", e);
    }
    outcome
}
