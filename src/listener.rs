//!
//! This module defines the push-consumer callback and the context through which
//! a listener acknowledges a delivery.
//!
use crate::error::Result;
use crate::message::{Message, MessageId};
use crate::queue::Queue;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::warn;

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Handle to one delivery. Cloning yields another handle to the same delivery.
#[derive(Clone)]
pub struct OnMessageContext {
    queue: Arc<Queue>,
    message_id: MessageId,
    attempt: u32,
}

impl OnMessageContext {
    pub(crate) fn new(queue: Arc<Queue>, message_id: MessageId, attempt: u32) -> Self {
        OnMessageContext {
            queue,
            message_id,
            attempt,
        }
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    /// Raise BrokerError::UnknownInFlight if the delivery was already acknowledged or
    /// rejected, or has expired and gone back to the queue.
    pub fn ack(&self) -> Result<()> {
        self.queue.settle(self.message_id, self.attempt, true)
    }

    /// Reject the delivery, returning the message to the queue for redelivery.
    pub fn nack(&self) -> Result<()> {
        self.queue.settle(self.message_id, self.attempt, false)
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// 1 for the first delivery of the message, incremented on every redelivery.
    pub fn delivery_attempt(&self) -> u32 {
        self.attempt
    }

    pub fn queue(&self) -> &str {
        self.queue.name()
    }
}

/// Callback invoked by a push consumer for every message delivered from an attached queue.
///
/// Returning an error is an implicit rejection: the message is not acknowledged and
/// gets redelivered once its delivery times out.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(
        &self,
        message: Message,
        context: OnMessageContext,
    ) -> std::result::Result<(), ListenerError>;
}

/// Runs a handler and acknowledges the delivery as soon as it succeeds.
pub struct AutoAckListener<F> {
    handler: F,
}

impl<F> AutoAckListener<F>
where
    F: Fn(&Message) -> std::result::Result<(), ListenerError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        AutoAckListener { handler }
    }
}

#[async_trait]
impl<F> MessageListener for AutoAckListener<F>
where
    F: Fn(&Message) -> std::result::Result<(), ListenerError> + Send + Sync,
{
    async fn on_message(
        &self,
        message: Message,
        context: OnMessageContext,
    ) -> std::result::Result<(), ListenerError> {
        (self.handler)(&message)?;
        context.ack()?;
        Ok(())
    }
}

/// Runs a handler and holds acknowledgments back until `batch_size` deliveries
/// have been handled, then acknowledges them together.
pub struct BatchAckListener<F> {
    handler: F,
    batch_size: usize,
    unacked: Mutex<Vec<OnMessageContext>>,
}

impl<F> BatchAckListener<F>
where
    F: Fn(&Message) -> std::result::Result<(), ListenerError> + Send + Sync,
{
    pub fn new(batch_size: usize, handler: F) -> Self {
        BatchAckListener {
            handler,
            batch_size: batch_size.max(1),
            unacked: Mutex::new(Vec::new()),
        }
    }

    /// Acknowledge every held delivery. Returns how many were acknowledged; deliveries
    /// that expired in the meantime are skipped.
    pub fn flush(&self) -> usize {
        let batch: Vec<OnMessageContext> = match self.unacked.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(e) => e.into_inner().drain(..).collect(),
        };
        batch
            .iter()
            .filter(|context| match context.ack() {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        queue = context.queue(),
                        message_id = %context.message_id(),
                        "Batch acknowledgment skipped: {}",
                        e
                    );
                    false
                }
            })
            .count()
    }

    pub fn held(&self) -> usize {
        match self.unacked.lock() {
            Ok(guard) => guard.len(),
            Err(e) => e.into_inner().len(),
        }
    }
}

#[async_trait]
impl<F> MessageListener for BatchAckListener<F>
where
    F: Fn(&Message) -> std::result::Result<(), ListenerError> + Send + Sync,
{
    async fn on_message(
        &self,
        message: Message,
        context: OnMessageContext,
    ) -> std::result::Result<(), ListenerError> {
        (self.handler)(&message)?;
        let full = {
            let mut unacked = match self.unacked.lock() {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
            unacked.push(context);
            unacked.len() >= self.batch_size
        };
        if full {
            self.flush();
        }
        Ok(())
    }
}

/// Rejects every delivery so it goes straight back to the queue.
#[derive(Debug, Default)]
pub struct RejectListener;

#[async_trait]
impl MessageListener for RejectListener {
    async fn on_message(
        &self,
        _message: Message,
        context: OnMessageContext,
    ) -> std::result::Result<(), ListenerError> {
        context.nack()?;
        Ok(())
    }
}
