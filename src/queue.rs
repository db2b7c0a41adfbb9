//!
//! This module defines the queue: a FIFO of pending messages plus the set of
//! messages delivered to a consumer but not yet acknowledged.
//!
use crate::config::QueueConfig;
use crate::error::{BrokerError, Result};
use crate::message::{Message, MessageId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

struct Pending {
    message: Message,
    attempts: u32,
}

struct InFlight {
    message: Message,
    attempts: u32,
    delivered_at: Instant,
}

/// A message handed out for delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,

    /// 1 for the first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// Where a message currently lives within its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Pending,
    InFlight,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    in_flight: HashMap<MessageId, InFlight>,
}

#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued_total: AtomicU64,
    delivered_total: AtomicU64,
    acked_total: AtomicU64,
    redelivered_total: AtomicU64,
}

impl QueueStats {
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_total.load(Ordering::Relaxed)
    }

    pub fn delivered_total(&self) -> u64 {
        self.delivered_total.load(Ordering::Relaxed)
    }

    pub fn acked_total(&self) -> u64 {
        self.acked_total.load(Ordering::Relaxed)
    }

    /// Messages returned to pending by a nack or an expired delivery.
    pub fn redelivered_total(&self) -> u64 {
        self.redelivered_total.load(Ordering::Relaxed)
    }
}

pub struct Queue {
    name: String,
    config: RwLock<QueueConfig>,
    state: Mutex<QueueState>,
    stats: QueueStats,
    notify: Notify,
}

impl Queue {
    pub(crate) fn new(name: &str, config: QueueConfig) -> Self {
        Queue {
            name: name.to_owned(),
            config: RwLock::new(config),
            state: Mutex::new(QueueState::default()),
            stats: QueueStats::default(),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every mutation leaves the state consistent before it can panic.
        self.state.lock().unwrap_or_else(|e| {
            warn!(queue = %self.name, "Queue lock is poisoned, recovering");
            e.into_inner()
        })
    }

    pub(crate) fn update_config(&self, config: QueueConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(e) => *e.into_inner() = config,
        }
    }

    /// Per-queue redelivery timeout override, if configured.
    pub fn delivery_timeout(&self) -> Option<Duration> {
        match self.config.read() {
            Ok(guard) => guard.delivery_timeout,
            Err(e) => e.into_inner().delivery_timeout,
        }
    }

    /// Append `message` to the pending sequence and wake a waiting dispatcher.
    pub fn enqueue(&self, message: Message) -> MessageId {
        let id = message.id();
        self.lock().pending.push_back(Pending {
            message,
            attempts: 0,
        });
        self.stats.enqueued_total.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.name, message_id = %id, "Message enqueued");
        self.notify.notify_one();
        id
    }

    /// Pop the oldest pending message and mark it in flight.
    pub fn dequeue_for_delivery(&self) -> Option<Delivery> {
        let mut state = self.lock();
        let Pending { message, attempts } = state.pending.pop_front()?;
        let attempts = attempts + 1;
        state.in_flight.insert(
            message.id(),
            InFlight {
                message: message.clone(),
                attempts,
                delivered_at: Instant::now(),
            },
        );
        drop(state);

        self.stats.delivered_total.fetch_add(1, Ordering::Relaxed);
        Some(Delivery {
            message,
            attempt: attempts,
        })
    }

    /// Acknowledge an in-flight message, forgetting it for good.
    ///
    /// # Errors
    /// Raise BrokerError::UnknownInFlight if the message is not in flight, e.g. it was
    /// already acknowledged or its delivery expired and it went back to pending.
    pub fn ack(&self, id: MessageId) -> Result<()> {
        take_in_flight(&mut self.lock(), id, None)?;
        self.acked(id);
        Ok(())
    }

    fn acked(&self, id: MessageId) {
        self.stats.acked_total.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.name, message_id = %id, "Message acknowledged");
    }

    /// Settle delivery `attempt` of `id`: acknowledge it, or return it to the queue.
    /// A listener still holding an expired delivery cannot settle a later one.
    pub(crate) fn settle(&self, id: MessageId, attempt: u32, ack: bool) -> Result<()> {
        if ack {
            take_in_flight(&mut self.lock(), id, Some(attempt))?;
            self.acked(id);
            Ok(())
        } else {
            self.requeue(id, Some(attempt))
        }
    }

    /// Return an in-flight message to the tail of the pending sequence, so a rejected
    /// message never starves the ones queued behind it.
    ///
    /// # Errors
    /// Raise BrokerError::UnknownInFlight if the message is not in flight.
    pub fn nack(&self, id: MessageId) -> Result<()> {
        self.requeue(id, None)
    }

    fn requeue(&self, id: MessageId, attempt: Option<u32>) -> Result<()> {
        {
            let mut state = self.lock();
            let entry = take_in_flight(&mut state, id, attempt)?;
            state.pending.push_back(Pending {
                message: entry.message,
                attempts: entry.attempts,
            });
        }
        self.stats.redelivered_total.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.name, message_id = %id, "Message returned for redelivery");
        self.notify.notify_one();
        Ok(())
    }

    /// Return every in-flight message delivered at least `timeout` ago to the tail of
    /// the pending sequence, oldest delivery first. Returns how many were moved.
    pub fn requeue_expired(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let ids: Vec<MessageId> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.delivered_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        let mut expired: Vec<InFlight> = ids
            .iter()
            .filter_map(|id| state.in_flight.remove(id))
            .collect();

        expired.sort_by(|a, b| {
            a.delivered_at
                .cmp(&b.delivered_at)
                .then(a.message.id().cmp(&b.message.id()))
        });
        let count = expired.len();
        for entry in expired {
            warn!(
                queue = %self.name,
                message_id = %entry.message.id(),
                attempt = entry.attempts,
                "Delivery was not acknowledged in time, redelivering"
            );
            state.pending.push_back(Pending {
                message: entry.message,
                attempts: entry.attempts,
            });
        }
        drop(state);

        if count > 0 {
            self.stats
                .redelivered_total
                .fetch_add(count as u64, Ordering::Relaxed);
            self.notify.notify_one();
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_pending(&self, id: MessageId) -> bool {
        self.lock().pending.iter().any(|p| p.message.id() == id)
    }

    pub fn is_in_flight(&self, id: MessageId) -> bool {
        self.lock().in_flight.contains_key(&id)
    }

    /// Location of `id` in this queue, observed under a single lock.
    pub fn location(&self, id: MessageId) -> Option<Location> {
        let state = self.lock();
        if state.in_flight.contains_key(&id) {
            Some(Location::InFlight)
        } else if state.pending.iter().any(|p| p.message.id() == id) {
            Some(Location::Pending)
        } else {
            None
        }
    }

    /// Identifiers of pending messages, head first.
    pub fn pending_ids(&self) -> Vec<MessageId> {
        self.lock().pending.iter().map(|p| p.message.id()).collect()
    }

    /// Wait until a message may be available.
    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Remove `id` from in flight, provided it is still on delivery `attempt` when one is
/// given.
fn take_in_flight(state: &mut QueueState, id: MessageId, attempt: Option<u32>) -> Result<InFlight> {
    match state.in_flight.get(&id) {
        Some(entry) if attempt.map_or(true, |a| a == entry.attempts) => {}
        _ => return Err(BrokerError::UnknownInFlight(id)),
    }
    state
        .in_flight
        .remove(&id)
        .ok_or(BrokerError::UnknownInFlight(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Queue {
        Queue::new("HELLO_QUEUE", QueueConfig::default())
    }

    #[test]
    fn test_fifo() {
        let queue = queue();
        let ids: Vec<_> = (0..3)
            .map(|i| queue.enqueue(Message::new(format!("m{}", i))))
            .collect();
        assert_eq!(queue.pending_ids(), ids);

        for id in &ids {
            let delivery = queue.dequeue_for_delivery().expect("pending message");
            assert_eq!(delivery.message.id(), *id);
            assert_eq!(delivery.attempt, 1);
        }
        assert!(queue.dequeue_for_delivery().is_none());
        assert_eq!(queue.in_flight_len(), 3);
    }

    #[test]
    fn test_single_location() {
        let queue = queue();
        let id = queue.enqueue(Message::new("a"));
        assert!(queue.is_pending(id) && !queue.is_in_flight(id));
        assert_eq!(queue.location(id), Some(Location::Pending));

        queue.dequeue_for_delivery();
        assert!(!queue.is_pending(id) && queue.is_in_flight(id));
        assert_eq!(queue.location(id), Some(Location::InFlight));

        queue.nack(id).expect("in flight");
        assert!(queue.is_pending(id) && !queue.is_in_flight(id));

        queue.dequeue_for_delivery();
        queue.ack(id).expect("in flight");
        assert_eq!(queue.location(id), None);
    }

    #[test]
    fn test_double_ack() -> Result<()> {
        let queue = queue();
        let id = queue.enqueue(Message::new("a"));
        queue.dequeue_for_delivery();
        queue.ack(id)?;
        assert!(matches!(queue.ack(id), Err(BrokerError::UnknownInFlight(i)) if i == id));
        assert_eq!(queue.stats().acked_total(), 1);
        Ok(())
    }

    #[test]
    fn test_ack_pending_message_is_rejected() {
        let queue = queue();
        let id = queue.enqueue(Message::new("a"));
        assert!(matches!(queue.ack(id), Err(BrokerError::UnknownInFlight(_))));
        assert!(matches!(queue.nack(id), Err(BrokerError::UnknownInFlight(_))));
        assert!(queue.is_pending(id));
    }

    #[test]
    fn test_nack_goes_to_tail() -> Result<()> {
        let queue = queue();
        let first = queue.enqueue(Message::new("a"));
        let second = queue.enqueue(Message::new("b"));
        queue.dequeue_for_delivery();
        queue.nack(first)?;
        assert_eq!(queue.pending_ids(), vec![second, first]);

        let delivery = queue.dequeue_for_delivery().expect("pending message");
        assert_eq!(delivery.message.id(), second);
        assert_eq!(delivery.attempt, 1);
        let delivery = queue.dequeue_for_delivery().expect("pending message");
        assert_eq!(delivery.message.id(), first);
        assert_eq!(delivery.attempt, 2);
        assert_eq!(queue.stats().redelivered_total(), 1);
        Ok(())
    }

    #[test]
    fn test_repeated_nack_does_not_starve_others() -> Result<()> {
        let queue = queue();
        let poison = queue.enqueue(Message::new("poison"));
        let good: Vec<_> = (0..3)
            .map(|i| queue.enqueue(Message::new(format!("m{}", i))))
            .collect();

        let mut acked = Vec::new();
        while let Some(delivery) = queue.dequeue_for_delivery() {
            let id = delivery.message.id();
            if id == poison {
                queue.nack(id)?;
                if acked.len() == good.len() {
                    break;
                }
            } else {
                queue.ack(id)?;
                acked.push(id);
            }
        }
        assert_eq!(acked, good);
        assert_eq!(queue.pending_ids(), vec![poison]);
        Ok(())
    }

    #[test]
    fn test_settle_ignores_stale_attempt() -> Result<()> {
        let queue = queue();
        let id = queue.enqueue(Message::new("a"));
        queue.dequeue_for_delivery();
        queue.requeue_expired(Duration::ZERO);
        let redelivery = queue.dequeue_for_delivery().expect("pending message");
        assert_eq!(redelivery.attempt, 2);

        assert!(matches!(queue.settle(id, 1, true), Err(BrokerError::UnknownInFlight(_))));
        assert!(matches!(queue.settle(id, 1, false), Err(BrokerError::UnknownInFlight(_))));
        assert_eq!(queue.location(id), Some(Location::InFlight));
        queue.settle(id, 2, true)?;
        assert_eq!(queue.location(id), None);
        Ok(())
    }

    #[test]
    fn test_requeue_expired() {
        let queue = queue();
        let first = queue.enqueue(Message::new("a"));
        let second = queue.enqueue(Message::new("b"));
        let third = queue.enqueue(Message::new("c"));
        queue.dequeue_for_delivery();
        queue.dequeue_for_delivery();

        assert_eq!(queue.requeue_expired(Duration::from_secs(60)), 0);
        assert_eq!(queue.requeue_expired(Duration::ZERO), 2);
        assert_eq!(queue.pending_ids(), vec![third, first, second]);
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.stats().redelivered_total(), 2);
    }
}
