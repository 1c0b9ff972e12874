//! Snapshot fan-out to live subscribers.
//!
//! Each subscriber owns the receiving half of a bounded queue. A publish
//! serializes the payload once and offers it to every queue without
//! waiting; a queue whose receiver is gone is pruned right there, a full
//! queue just misses this publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::logging::{log, log_fault, obj, Domain, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<Arc<str>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub skipped: usize,
    pub pruned: usize,
}

pub struct BroadcastHub {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<Arc<str>>>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.buffer);
        let count = {
            let mut subs = self.registry();
            subs.insert(id, tx);
            subs.len()
        };
        log(
            Level::Info,
            Domain::Broadcast,
            "subscribed",
            obj(&[("subscriber", json!(id.0)), ("subscribers", json!(count))]),
        );
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.registry().remove(&id).is_some();
        if removed {
            log(
                Level::Info,
                Domain::Broadcast,
                "unsubscribed",
                obj(&[("subscriber", json!(id.0))]),
            );
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    /// Deliver one serialized copy of `message` to every subscriber. Never
    /// fails because of a single bad subscriber.
    pub fn publish<T: Serialize>(&self, message: &T) -> PublishReport {
        let payload: Arc<str> = match serde_json::to_string(message) {
            Ok(s) => Arc::from(s),
            Err(err) => {
                log_fault(Domain::Broadcast, "serialize", &err.to_string());
                return PublishReport::default();
            }
        };

        let mut report = PublishReport::default();
        let mut pruned = Vec::new();
        {
            let mut subs = self.registry();
            subs.retain(|id, tx| match tx.try_send(payload.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    report.skipped += 1;
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    pruned.push(id.0);
                    false
                }
            });
        }
        report.pruned = pruned.len();

        if !pruned.is_empty() {
            log(
                Level::Info,
                Domain::Broadcast,
                "pruned",
                obj(&[("subscribers", json!(pruned))]),
            );
        }
        if report.skipped > 0 {
            log(
                Level::Debug,
                Domain::Broadcast,
                "slow_subscriber",
                obj(&[("skipped", json!(report.skipped))]),
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_every_subscriber_once() {
        let hub = BroadcastHub::new(4);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        let report = hub.publish(&json!({"n": 1}));
        assert_eq!(report.delivered, 2);
        assert_eq!(a.receiver.try_recv().unwrap().as_ref(), r#"{"n":1}"#);
        assert_eq!(b.receiver.try_recv().unwrap().as_ref(), r#"{"n":1}"#);
        assert!(a.receiver.try_recv().is_err());
    }

    #[test]
    fn closed_subscriber_is_pruned_without_affecting_others() {
        let hub = BroadcastHub::new(4);
        let dead = hub.subscribe();
        let mut live = hub.subscribe();
        drop(dead.receiver);

        let report = hub.publish(&json!({"n": 1}));
        assert_eq!(report.pruned, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(live.receiver.try_recv().is_ok());

        let report = hub.publish(&json!({"n": 2}));
        assert_eq!(report.pruned, 0);
        assert_eq!(report.delivered, 1);
    }

    #[test]
    fn full_subscriber_misses_publish_but_stays() {
        let hub = BroadcastHub::new(1);
        let mut slow = hub.subscribe();
        hub.publish(&json!(1));
        let report = hub.publish(&json!(2));
        assert_eq!(report.skipped, 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(slow.receiver.try_recv().unwrap().as_ref(), "1");
        assert!(slow.receiver.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_removes_sink() {
        let hub = BroadcastHub::new(4);
        let s = hub.subscribe();
        assert!(hub.unsubscribe(s.id));
        assert!(!hub.unsubscribe(s.id));
        assert_eq!(hub.publish(&json!(1)).delivered, 0);
    }

    #[test]
    fn ids_are_distinct() {
        let hub = BroadcastHub::new(4);
        let a = hub.subscribe();
        let b = hub.subscribe();
        assert_ne!(a.id, b.id);
    }
}
