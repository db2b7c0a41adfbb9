//!
//! This module defines the push consumer, which attaches listeners to queues and
//! runs one dispatcher per attachment.
//!
use crate::broker::Broker;
use crate::dispatcher::{DispatcherHandle, DispatcherState, PushDispatcher};
use crate::error::{BrokerError, Result};
use crate::listener::MessageListener;
use crate::queue::Queue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

struct Attachment {
    queue: Arc<Queue>,
    listener: Arc<dyn MessageListener>,
    dispatcher: Option<DispatcherHandle>,
}

#[derive(Default)]
struct ConsumerState {
    started: bool,
    attachments: HashMap<String, Attachment>,
}

/// Consumer that has messages pushed to its listeners.
///
/// Dropping a consumer asks every delivery loop to stop; call
/// [`PushConsumer::shutdown`] to also wait for them to finish.
pub struct PushConsumer {
    broker: Broker,
    state: Mutex<ConsumerState>,
}

impl PushConsumer {
    pub(crate) fn new(broker: Broker) -> Self {
        PushConsumer {
            broker,
            state: Mutex::new(ConsumerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConsumerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        }
    }

    /// Attach `listener` to `queue`. Deliveries begin on startup, or immediately if the
    /// consumer is already started.
    ///
    /// # Errors
    /// Raise BrokerError::NotFound if the queue does not exist and
    /// BrokerError::AlreadyExists if this consumer already has a listener on it.
    pub fn attach_queue(
        &self,
        queue: &str,
        listener: impl MessageListener + 'static,
    ) -> Result<()> {
        self.attach_shared(queue, Arc::new(listener))
    }

    pub fn attach_shared(&self, queue: &str, listener: Arc<dyn MessageListener>) -> Result<()> {
        let target = self.broker.queue(queue)?;
        let mut state = self.lock();
        if state.attachments.contains_key(queue) {
            return Err(BrokerError::already_exists("attachment", queue));
        }
        let dispatcher = if state.started {
            Some(PushDispatcher::spawn(
                Arc::clone(&target),
                Arc::clone(&listener),
                self.broker.config().delivery_timeout(),
            ))
        } else {
            None
        };
        state.attachments.insert(
            queue.to_owned(),
            Attachment {
                queue: target,
                listener,
                dispatcher,
            },
        );
        info!(queue, "Queue attached");
        Ok(())
    }

    /// Stop deliveries from `queue` and forget its listener. Queued and in-flight
    /// messages are left untouched.
    pub async fn detach_queue(&self, queue: &str) -> Result<()> {
        let attachment = self
            .lock()
            .attachments
            .remove(queue)
            .ok_or_else(|| BrokerError::not_found("attachment", queue))?;
        if let Some(dispatcher) = attachment.dispatcher {
            dispatcher.stop().await;
        }
        info!(queue, "Queue detached");
        Ok(())
    }

    /// Start a delivery loop for every attachment.
    ///
    /// Must be called within a tokio runtime.
    pub fn startup(&self) {
        let default_timeout = self.broker.config().delivery_timeout();
        let mut state = self.lock();
        state.started = true;
        for (name, attachment) in state.attachments.iter_mut() {
            if attachment.dispatcher.is_none() {
                attachment.dispatcher = Some(PushDispatcher::spawn(
                    Arc::clone(&attachment.queue),
                    Arc::clone(&attachment.listener),
                    default_timeout,
                ));
                info!(queue = %name, "Dispatcher spawned");
            }
        }
    }

    /// Stop every delivery loop, waiting for in-progress deliveries to complete.
    /// Attachments are kept, so the consumer may be started again.
    pub async fn shutdown(&self) {
        let dispatchers: Vec<DispatcherHandle> = {
            let mut state = self.lock();
            state.started = false;
            state
                .attachments
                .values_mut()
                .filter_map(|attachment| attachment.dispatcher.take())
                .collect()
        };
        for dispatcher in &dispatchers {
            dispatcher.signal_stop();
        }
        for dispatcher in dispatchers {
            dispatcher.stop().await;
        }
        info!("Push consumer shut down");
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    /// Names of attached queues.
    pub fn attached_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().attachments.keys().cloned().collect();
        names.sort();
        names
    }

    /// State of the delivery loop for `queue`, if one is running.
    pub fn dispatcher_state(&self, queue: &str) -> Option<DispatcherState> {
        self.lock()
            .attachments
            .get(queue)
            .and_then(|attachment| attachment.dispatcher.as_ref())
            .map(|dispatcher| dispatcher.state())
    }
}

impl Drop for PushConsumer {
    fn drop(&mut self) {
        for attachment in self.lock().attachments.values() {
            if let Some(dispatcher) = attachment.dispatcher.as_ref() {
                dispatcher.signal_stop();
            }
        }
    }
}
