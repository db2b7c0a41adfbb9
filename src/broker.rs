//!
//! This module defines the Broker: the registry of queues, topics, routings and
//! operators, and the entry point for publishing messages.
//!
//! Resources follow create-or-update semantics: creating a resource that already
//! exists updates it in place.
//!
use crate::config::{BrokerConfig, KeyValue, QueueConfig, DST_QUEUE, SRC_TOPIC};
use crate::consumer::PushConsumer;
use crate::error::{BrokerError, Result};
use crate::filter::Filter;
use crate::message::{Message, MessageId};
use crate::queue::Queue;
use crate::route::{Operator, Router, Routing};
use crate::topic::Topic;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// A copy of a published message placed into a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub routing: String,
    pub queue: String,
    pub message_id: MessageId,
}

struct Reaper {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

// Lock order: topics, router, operators, queues.
struct Inner {
    config: BrokerConfig,
    topics: RwLock<HashMap<String, Topic>>,
    router: RwLock<Router>,
    operators: RwLock<HashMap<String, Arc<Operator>>>,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    reaper: Mutex<Option<Reaper>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| {
        warn!("Registry lock is poisoned, recovering");
        e.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| {
        warn!("Registry lock is poisoned, recovering");
        e.into_inner()
    })
}

/// Cheaply cloneable handle to a broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Broker {
            inner: Arc::new(Inner {
                config,
                topics: RwLock::new(HashMap::new()),
                router: RwLock::new(Router::new()),
                operators: RwLock::new(HashMap::new()),
                queues: RwLock::new(HashMap::new()),
                reaper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Create `name`, or update its configuration if it exists. Messages of an existing
    /// queue are kept.
    ///
    /// # Errors
    /// Raise BrokerError::InvalidConfig if `DELIVERY_TIMEOUT_MS` is not a positive integer.
    pub fn create_and_update_queue(&self, name: &str, config: KeyValue) -> Result<Arc<Queue>> {
        let queue_config = QueueConfig::try_from(&config)?;
        let mut queues = write(&self.inner.queues);
        match queues.get(name) {
            Some(queue) => {
                queue.update_config(queue_config);
                info!(queue = name, "Queue updated");
                Ok(Arc::clone(queue))
            }
            None => {
                let queue = Arc::new(Queue::new(name, queue_config));
                queues.insert(name.to_owned(), Arc::clone(&queue));
                info!(queue = name, "Queue created");
                Ok(queue)
            }
        }
    }

    /// Create `name`, or update its configuration if it exists. Routings of an existing
    /// topic are kept.
    pub fn create_and_update_topic(&self, name: &str, config: KeyValue) -> Result<Topic> {
        let mut topics = write(&self.inner.topics);
        let topic = topics
            .entry(name.to_owned())
            .and_modify(|topic| topic.set_config(config.clone()))
            .or_insert_with(|| Topic::new(name, config));
        info!(topic = name, "Topic created or updated");
        Ok(topic.clone())
    }

    /// Create a routing from `source` to `destination`, or re-point an existing one.
    /// The operator chain of an existing routing is kept.
    ///
    /// # Errors
    /// Raise BrokerError::NotFound if either the topic or the queue does not exist.
    pub fn create_and_update_routing(
        &self,
        name: &str,
        source: &str,
        destination: &str,
        config: KeyValue,
    ) -> Result<Routing> {
        let mut topics = write(&self.inner.topics);
        let mut router = write(&self.inner.router);
        if !topics.contains_key(source) {
            return Err(BrokerError::not_found("topic", source));
        }
        if !read(&self.inner.queues).contains_key(destination) {
            return Err(BrokerError::not_found("queue", destination));
        }

        if let Some(previous) = router.upsert(name, source, destination, config) {
            if previous != source {
                if let Some(topic) = topics.get_mut(&previous) {
                    topic.detach_routing(name);
                }
            }
        }
        if let Some(topic) = topics.get_mut(source) {
            topic.attach_routing(name);
        }
        info!(routing = name, source, destination, "Routing created or updated");

        router
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::not_found("routing", name))
    }

    /// Like [`Broker::create_and_update_routing`], reading the source topic from
    /// `SRC_TOPIC` and the destination queue from `DST_QUEUE`.
    pub fn create_and_update_routing_with(&self, name: &str, config: KeyValue) -> Result<Routing> {
        let source = config.require_str(SRC_TOPIC)?.to_owned();
        let destination = config.require_str(DST_QUEUE)?.to_owned();
        self.create_and_update_routing(name, &source, &destination, config)
    }

    /// Compile `expression` and register it under `name`, replacing the expression of
    /// an existing operator in every routing that holds it.
    ///
    /// # Errors
    /// Raise BrokerError::FilterSyntax if the expression is malformed; nothing is
    /// registered or changed in that case.
    pub fn create_and_update_operator(
        &self,
        name: &str,
        expression: &str,
        config: KeyValue,
    ) -> Result<Arc<Operator>> {
        let filter = Filter::compile(expression)?;
        let mut operators = write(&self.inner.operators);
        let operator = match operators.get(name) {
            Some(operator) => {
                operator.update(filter, config);
                Arc::clone(operator)
            }
            None => {
                let operator = Arc::new(Operator::new(name, filter, config));
                operators.insert(name.to_owned(), Arc::clone(&operator));
                operator
            }
        };
        info!(operator = name, expression, "Operator created or updated");
        Ok(operator)
    }

    /// Append `operator` to the chain of `routing`.
    pub fn add_operator(&self, routing: &str, operator: &Arc<Operator>) -> Result<()> {
        write(&self.inner.router).add_operator(routing, Arc::clone(operator))?;
        debug!(routing, operator = operator.name(), "Operator appended");
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        read(&self.inner.queues)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::not_found("queue", name))
    }

    pub fn topic(&self, name: &str) -> Result<Topic> {
        read(&self.inner.topics)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::not_found("topic", name))
    }

    pub fn routing(&self, name: &str) -> Result<Routing> {
        read(&self.inner.router)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::not_found("routing", name))
    }

    pub fn operator(&self, name: &str) -> Result<Arc<Operator>> {
        read(&self.inner.operators)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::not_found("operator", name))
    }

    /// Remove a queue. Consumers already attached keep draining it.
    ///
    /// # Errors
    /// Raise BrokerError::InUse if a routing still delivers into the queue.
    pub fn delete_queue(&self, name: &str) -> Result<()> {
        let router = read(&self.inner.router);
        if router.targets_queue(name) {
            return Err(BrokerError::InUse {
                kind: "queue",
                name: name.to_owned(),
            });
        }
        write(&self.inner.queues)
            .remove(name)
            .ok_or_else(|| BrokerError::not_found("queue", name))?;
        info!(queue = name, "Queue deleted");
        Ok(())
    }

    /// Remove a topic together with every routing fed by it.
    pub fn delete_topic(&self, name: &str) -> Result<()> {
        let mut topics = write(&self.inner.topics);
        let topic = topics
            .remove(name)
            .ok_or_else(|| BrokerError::not_found("topic", name))?;
        let mut router = write(&self.inner.router);
        for routing in topic.routings() {
            router.remove(routing);
        }
        info!(topic = name, "Topic deleted");
        Ok(())
    }

    pub fn delete_routing(&self, name: &str) -> Result<()> {
        let mut topics = write(&self.inner.topics);
        let routing = write(&self.inner.router)
            .remove(name)
            .ok_or_else(|| BrokerError::not_found("routing", name))?;
        if let Some(topic) = topics.get_mut(routing.source()) {
            topic.detach_routing(name);
        }
        info!(routing = name, "Routing deleted");
        Ok(())
    }

    /// Publish `message` to `topic`. Every routing of the topic whose operator chain
    /// accepts the message receives its own copy, in routing order. Returns without
    /// waiting for any delivery.
    ///
    /// # Errors
    /// Raise BrokerError::NotFound if the topic, or the destination queue of a
    /// matching routing, does not exist. Nothing is enqueued in that case.
    pub fn publish(&self, topic: &str, message: Message) -> Result<Vec<Enqueued>> {
        let targets: Vec<(String, Arc<Queue>)> = {
            let topics = read(&self.inner.topics);
            let source = topics
                .get(topic)
                .ok_or_else(|| BrokerError::not_found("topic", topic))?;
            let router = read(&self.inner.router);
            let queues = read(&self.inner.queues);

            let mut targets = Vec::new();
            for routing in source.routings().iter().filter_map(|name| router.get(name)) {
                if !routing.route(&message) {
                    debug!(
                        topic,
                        routing = routing.name(),
                        message_id = %message.id(),
                        "Message filtered out"
                    );
                    continue;
                }
                let queue = queues
                    .get(routing.destination())
                    .ok_or_else(|| BrokerError::not_found("queue", routing.destination()))?;
                targets.push((routing.name().to_owned(), Arc::clone(queue)));
            }
            targets
        };

        let enqueued: Vec<Enqueued> = targets
            .into_iter()
            .map(|(routing, queue)| Enqueued {
                message_id: queue.enqueue(message.fork()),
                queue: queue.name().to_owned(),
                routing,
            })
            .collect();
        debug!(
            topic,
            message_id = %message.id(),
            copies = enqueued.len(),
            "Message published"
        );
        Ok(enqueued)
    }

    /// Enqueue `message` directly into `queue`, bypassing topics and routings.
    pub fn send(&self, queue: &str, message: Message) -> Result<MessageId> {
        Ok(self.queue(queue)?.enqueue(message))
    }

    pub fn create_push_consumer(&self) -> PushConsumer {
        PushConsumer::new(self.clone())
    }

    /// Return expired in-flight messages of every queue to pending. Returns how many
    /// were moved.
    pub fn reap_expired(&self) -> usize {
        let queues: Vec<Arc<Queue>> = read(&self.inner.queues).values().cloned().collect();
        let default_timeout = self.inner.config.delivery_timeout();
        queues
            .iter()
            .map(|queue| queue.requeue_expired(queue.delivery_timeout().unwrap_or(default_timeout)))
            .sum()
    }

    /// Start the background reaper that redelivers expired in-flight messages.
    /// Calling it on a started broker does nothing.
    ///
    /// Must be called within a tokio runtime.
    pub fn startup(&self) {
        let mut reaper = match self.inner.reaper.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };
        if reaper.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(reap_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.reap_interval(),
            stop_rx,
        ));
        *reaper = Some(Reaper {
            stop: stop_tx,
            join,
        });
        info!("Broker started");
    }

    /// Stop the reaper. Queues and their messages are kept.
    pub async fn shutdown(&self) {
        let reaper = match self.inner.reaper.lock() {
            Ok(mut guard) => guard.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(reaper) = reaper {
            let _ = reaper.stop.send(true);
            if let Err(e) = reaper.join.await {
                warn!("Reaper task terminated abnormally: {}", e);
            }
        }
        info!("Broker shut down");
    }
}

async fn reap_loop(inner: Weak<Inner>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        match inner.upgrade() {
            Some(inner) => {
                let moved = Broker { inner }.reap_expired();
                if moved > 0 {
                    debug!(moved, "Expired deliveries returned to their queues");
                }
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> Broker {
        Broker::new(BrokerConfig::default())
    }

    #[test]
    fn test_create_and_update_queue_keeps_messages() -> Result<()> {
        let broker = broker();
        let queue = broker.create_and_update_queue("HELLO_QUEUE", KeyValue::new())?;
        broker.send("HELLO_QUEUE", Message::new("Hello"))?;

        let updated = broker.create_and_update_queue(
            "HELLO_QUEUE",
            KeyValue::new().put(crate::config::DELIVERY_TIMEOUT_MS, 100),
        )?;
        assert!(Arc::ptr_eq(&queue, &updated));
        assert_eq!(updated.pending_len(), 1);
        assert_eq!(updated.delivery_timeout(), Some(Duration::from_millis(100)));
        Ok(())
    }

    #[test]
    fn test_routing_requires_existing_resources() -> Result<()> {
        let broker = broker();
        broker.create_and_update_topic("SOURCE_TOPIC", KeyValue::new())?;
        let result = broker.create_and_update_routing("R", "SOURCE_TOPIC", "MISSING", KeyValue::new());
        assert!(matches!(result, Err(BrokerError::NotFound { kind: "queue", .. })));

        broker.create_and_update_queue("Q", KeyValue::new())?;
        let result = broker.create_and_update_routing("R", "MISSING", "Q", KeyValue::new());
        assert!(matches!(result, Err(BrokerError::NotFound { kind: "topic", .. })));
        assert!(broker.topic("SOURCE_TOPIC")?.routings().is_empty());
        Ok(())
    }

    #[test]
    fn test_routing_from_config_keys() -> Result<()> {
        let broker = broker();
        broker.create_and_update_topic("SOURCE_TOPIC", KeyValue::new())?;
        broker.create_and_update_queue("QUEUE_HAS_SOURCE_TOPIC", KeyValue::new())?;
        let routing = broker.create_and_update_routing_with(
            "HELLO_ROUTING",
            KeyValue::new()
                .put(SRC_TOPIC, "SOURCE_TOPIC")
                .put(DST_QUEUE, "QUEUE_HAS_SOURCE_TOPIC"),
        )?;
        assert_eq!(routing.source(), "SOURCE_TOPIC");
        assert_eq!(routing.destination(), "QUEUE_HAS_SOURCE_TOPIC");

        let result = broker.create_and_update_routing_with(
            "BROKEN",
            KeyValue::new().put(SRC_TOPIC, "SOURCE_TOPIC"),
        );
        assert!(matches!(result, Err(BrokerError::InvalidConfig(_))));
        Ok(())
    }

    #[test]
    fn test_routing_update_moves_topic() -> Result<()> {
        let broker = broker();
        broker.create_and_update_topic("T1", KeyValue::new())?;
        broker.create_and_update_topic("T2", KeyValue::new())?;
        broker.create_and_update_queue("Q", KeyValue::new())?;
        broker.create_and_update_routing("R", "T1", "Q", KeyValue::new())?;
        broker.create_and_update_routing("R", "T1", "Q", KeyValue::new())?;
        assert_eq!(broker.topic("T1")?.routings(), ["R"]);

        broker.create_and_update_routing("R", "T2", "Q", KeyValue::new())?;
        assert!(broker.topic("T1")?.routings().is_empty());
        assert_eq!(broker.topic("T2")?.routings(), ["R"]);

        assert!(broker.publish("T1", Message::new("a"))?.is_empty());
        assert_eq!(broker.publish("T2", Message::new("b"))?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_malformed_operator_is_rejected() -> Result<()> {
        let broker = broker();
        let result = broker.create_and_update_operator("OP", "TAGS in (", KeyValue::new());
        assert!(matches!(result, Err(BrokerError::FilterSyntax { .. })));
        assert!(broker.operator("OP").is_err());

        let op = broker.create_and_update_operator("OP", "TAGS is not null", KeyValue::new())?;
        let result = broker.create_and_update_operator("OP", "TAGS is", KeyValue::new());
        assert!(result.is_err());
        assert_eq!(op.expression(), "TAGS is not null");
        Ok(())
    }

    #[test]
    fn test_add_operator_to_unknown_routing() -> Result<()> {
        let broker = broker();
        let op = broker.create_and_update_operator("OP", "TAGS is not null", KeyValue::new())?;
        assert!(matches!(
            broker.add_operator("MISSING", &op),
            Err(BrokerError::NotFound { kind: "routing", .. })
        ));
        Ok(())
    }

    #[test]
    fn test_publish_to_unknown_topic() {
        let broker = broker();
        let result = broker.publish("MISSING", Message::new("a"));
        assert!(matches!(result, Err(BrokerError::NotFound { kind: "topic", .. })));
    }

    #[test]
    fn test_publish_fans_out_with_fresh_ids() -> Result<()> {
        let broker = broker();
        broker.create_and_update_topic("T", KeyValue::new())?;
        let q1 = broker.create_and_update_queue("Q1", KeyValue::new())?;
        let q2 = broker.create_and_update_queue("Q2", KeyValue::new())?;
        broker.create_and_update_routing("R1", "T", "Q1", KeyValue::new())?;
        broker.create_and_update_routing("R2", "T", "Q2", KeyValue::new())?;

        let message = Message::new("a");
        let original = message.id();
        let enqueued = broker.publish("T", message)?;
        assert_eq!(enqueued.len(), 2);
        assert_eq!(enqueued[0].routing, "R1");
        assert_eq!(enqueued[1].queue, "Q2");
        assert_ne!(enqueued[0].message_id, enqueued[1].message_id);
        assert!(enqueued.iter().all(|e| e.message_id != original));

        assert!(q1.is_pending(enqueued[0].message_id));
        assert!(!q2.is_pending(enqueued[0].message_id));
        assert!(q2.is_pending(enqueued[1].message_id));
        Ok(())
    }

    #[test]
    fn test_delete_queue_in_use() -> Result<()> {
        let broker = broker();
        broker.create_and_update_topic("T", KeyValue::new())?;
        broker.create_and_update_queue("Q", KeyValue::new())?;
        broker.create_and_update_routing("R", "T", "Q", KeyValue::new())?;
        assert!(matches!(broker.delete_queue("Q"), Err(BrokerError::InUse { .. })));

        broker.delete_routing("R")?;
        assert!(broker.topic("T")?.routings().is_empty());
        broker.delete_queue("Q")?;
        assert!(matches!(broker.queue("Q"), Err(BrokerError::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn test_delete_topic_drops_routings() -> Result<()> {
        let broker = broker();
        broker.create_and_update_topic("T", KeyValue::new())?;
        broker.create_and_update_queue("Q", KeyValue::new())?;
        broker.create_and_update_routing("R", "T", "Q", KeyValue::new())?;
        broker.delete_topic("T")?;
        assert!(broker.routing("R").is_err());
        broker.delete_queue("Q")?;
        Ok(())
    }

    #[tokio::test]
    async fn test_reaper_redelivers_expired() -> Result<()> {
        let broker = Broker::new(BrokerConfig {
            delivery_timeout_ms: 30,
            reap_interval_ms: 10,
        });
        let queue = broker.create_and_update_queue("Q", KeyValue::new())?;
        let id = broker.send("Q", Message::new("a"))?;
        queue.dequeue_for_delivery();

        broker.startup();
        broker.startup();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_pending(id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expired delivery not reaped in time");
        assert!(!queue.is_in_flight(id));
        broker.shutdown().await;
        Ok(())
    }
}
