//!
//! This module defines the push dispatcher: one delivery loop per attached queue
//! that hands messages to the consumer's listener, one invocation at a time.
//!
use crate::listener::{MessageListener, OnMessageContext};
use crate::queue::{Delivery, Queue};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Waiting for a message to become available.
    Idle,
    /// A listener invocation is in progress.
    Delivering,
    Stopped,
}

impl DispatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DispatcherState::Idle,
            1 => DispatcherState::Delivering,
            _ => DispatcherState::Stopped,
        }
    }
}

/// Owning handle to a running delivery loop.
pub(crate) struct DispatcherHandle {
    state: Arc<AtomicU8>,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    pub(crate) fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Ask the loop to stop once its current delivery, if any, completes.
    pub(crate) fn signal_stop(&self) {
        // Fails only if the loop already exited.
        let _ = self.stop.send(true);
    }

    /// Signal the loop and wait for it to exit.
    pub(crate) async fn stop(self) {
        self.signal_stop();
        if let Err(e) = self.join.await {
            warn!("Dispatcher task terminated abnormally: {}", e);
        }
    }
}

pub(crate) struct PushDispatcher {
    queue: Arc<Queue>,
    listener: Arc<dyn MessageListener>,
    /// Used when the queue does not override its delivery timeout.
    default_timeout: Duration,
    state: Arc<AtomicU8>,
    stop: watch::Receiver<bool>,
}

impl PushDispatcher {
    /// Spawn a delivery loop draining `queue` into `listener`.
    pub(crate) fn spawn(
        queue: Arc<Queue>,
        listener: Arc<dyn MessageListener>,
        default_timeout: Duration,
    ) -> DispatcherHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = Arc::new(AtomicU8::new(DispatcherState::Idle as u8));
        let dispatcher = PushDispatcher {
            queue,
            listener,
            default_timeout,
            state: Arc::clone(&state),
            stop: stop_rx,
        };
        let join = tokio::spawn(dispatcher.run());
        DispatcherHandle {
            state,
            stop: stop_tx,
            join,
        }
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.store(state as u8, Ordering::Release);
    }

    async fn run(mut self) {
        info!(queue = %self.queue.name(), "Dispatcher started");
        loop {
            if *self.stop.borrow() {
                break;
            }

            match self.queue.dequeue_for_delivery() {
                Some(delivery) => self.deliver(delivery).await,
                None => {
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        changed = self.stop.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.set_state(DispatcherState::Stopped);
        info!(queue = %self.queue.name(), "Dispatcher stopped");
    }

    async fn deliver(&self, delivery: Delivery) {
        let Delivery { message, attempt } = delivery;
        let message_id = message.id();
        let context = OnMessageContext::new(Arc::clone(&self.queue), message_id, attempt);
        debug!(
            queue = %self.queue.name(),
            message_id = %message_id,
            attempt,
            "Delivering message"
        );

        self.set_state(DispatcherState::Delivering);
        // Run on its own task so that a panicking listener cannot take the loop down,
        // and so that neither a stop nor a timeout cancels an invocation half way.
        let listener = Arc::clone(&self.listener);
        let invocation = tokio::spawn(async move { listener.on_message(message, context).await });
        let timeout = self.queue.delivery_timeout().unwrap_or(self.default_timeout);
        let outcome = tokio::time::timeout(timeout, invocation).await;
        self.set_state(DispatcherState::Idle);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                // The invocation keeps running detached; its message is redelivered once
                // the reaper finds it expired.
                warn!(
                    queue = %self.queue.name(),
                    message_id = %message_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Listener did not return in time, moving on"
                );
                return;
            }
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                queue = %self.queue.name(),
                message_id = %message_id,
                "Listener failed, message will be redelivered after timeout: {}",
                e
            ),
            Err(e) => warn!(
                queue = %self.queue.name(),
                message_id = %message_id,
                "Listener panicked, message will be redelivered after timeout: {}",
                e
            ),
        }
    }
}
