//! Fan-out hub: one ingest stream in, many subscriber queues out.
//!
//! Topics are created lazily per symbol. Publishing never blocks and never
//! suspends: each subscriber gets a bounded queue, and a full queue costs
//! that subscriber a dropped message, not the publisher a stall. Subscribers
//! that keep dropping past the slow-consumer threshold are evicted; idle
//! ones are reaped by the zombie sweep.
//!
//! Locking: topic map before topic subscriber set, and neither is held
//! across a send attempt.

use chrono::Utc;
use common::MarketDataUpdate;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique subscriber identifier.
pub type SubscriberId = Uuid;

/// Receiving half of a subscriber's queue, handed to the transport layer.
pub type UpdateReceiver = mpsc::Receiver<Arc<MarketDataUpdate>>;

/// One downstream consumer.
///
/// The hub owns the sending half of the queue and is the only party that
/// closes it; the transport layer reads the receiver until it drains.
pub struct Subscriber {
    pub id: SubscriberId,
    pub tenant_id: i64,
    pub key_id: i64,
    pub connect_time: chrono::DateTime<Utc>,
    tx: Mutex<Option<mpsc::Sender<Arc<MarketDataUpdate>>>>,
    last_send_ms: AtomicI64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Subscriber {
    fn new(id: SubscriberId, tenant_id: i64, key_id: i64, buffer: usize) -> (Arc<Self>, UpdateReceiver) {
        let (tx, rx) = mpsc::channel(buffer);
        let now = Utc::now();
        let sub = Arc::new(Self {
            id,
            tenant_id,
            key_id,
            connect_time: now,
            tx: Mutex::new(Some(tx)),
            last_send_ms: AtomicI64::new(now.timestamp_millis()),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        (sub, rx)
    }

    /// Messages dropped because this subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn last_send_ms(&self) -> i64 {
        self.last_send_ms.load(Ordering::Relaxed)
    }

    /// Close the send queue. Idempotent: the one-shot flag guarantees the
    /// queue is closed exactly once no matter which eviction path got here.
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.tx.lock().take();
        }
    }
}

enum SendOutcome {
    Sent,
    Dropped,
    Gone,
}

struct Topic {
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    last_update_ms: AtomicI64,
}

impl Topic {
    fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            last_update_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub active_topics: usize,
    pub active_subscribers: i64,
    pub dropped_messages: u64,
}

/// Per-topic statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicStats {
    pub subscriber_count: usize,
    pub last_update_ms: i64,
}

/// Topic registry and non-blocking publisher.
pub struct Hub {
    topics: DashMap<String, Arc<Topic>>,
    buffer_size: usize,
    slow_threshold: u64,
    zombie_timeout: Duration,
    active_subscribers: AtomicI64,
    dropped_messages: AtomicU64,
}

impl Hub {
    pub fn new(buffer_size: usize, slow_threshold: u64, zombie_timeout: Duration) -> Self {
        Self {
            topics: DashMap::new(),
            buffer_size,
            slow_threshold,
            zombie_timeout,
            active_subscribers: AtomicI64::new(0),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Allocate a subscriber and its bounded queue.
    pub fn create_subscriber(
        &self,
        id: SubscriberId,
        tenant_id: i64,
        key_id: i64,
    ) -> (Arc<Subscriber>, UpdateReceiver) {
        Subscriber::new(id, tenant_id, key_id, self.buffer_size)
    }

    /// Add a subscriber to the symbol's topic, creating the topic lazily.
    pub fn subscribe(&self, symbol: &str, sub: Arc<Subscriber>) {
        let topic = self
            .topics
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Topic::new()))
            .clone();

        let inserted = topic.subscribers.write().insert(sub.id, sub).is_none();
        if inserted {
            let active = self.active_subscribers.fetch_add(1, Ordering::Relaxed) + 1;
            gauge!("relay_active_subscribers").set(active as f64);
        }
    }

    /// Remove a subscriber from the topic and close its queue exactly once.
    pub fn unsubscribe(&self, symbol: &str, id: SubscriberId) {
        let topic = match self.topics.get(symbol) {
            Some(topic) => topic.clone(),
            None => return,
        };

        let removed = topic.subscribers.write().remove(&id);
        if let Some(sub) = removed {
            sub.close();
            let active = self.active_subscribers.fetch_sub(1, Ordering::Relaxed) - 1;
            gauge!("relay_active_subscribers").set(active as f64);
            debug!(subscriber = %id, symbol, "unsubscribed");
        }
    }

    /// Deliver an update to every current subscriber of the symbol.
    ///
    /// Never blocks: the subscriber list is snapshotted under the topic's
    /// read lock, then every enqueue is a `try_send` with no lock held.
    pub fn publish(&self, symbol: &str, update: Arc<MarketDataUpdate>) {
        let topic = match self.topics.get(symbol) {
            Some(topic) => topic.clone(),
            None => return,
        };

        let now_ms = Utc::now().timestamp_millis();
        topic.last_update_ms.store(now_ms, Ordering::Relaxed);

        let subscribers: Vec<Arc<Subscriber>> =
            topic.subscribers.read().values().cloned().collect();

        for sub in subscribers {
            if sub.is_closed() {
                continue;
            }
            match self.try_deliver(&sub, &update, now_ms) {
                SendOutcome::Sent => {}
                SendOutcome::Dropped => {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                    counter!("relay_dropped_messages_total", "symbol" => symbol.to_string())
                        .increment(1);
                    if dropped > self.slow_threshold {
                        warn!(
                            subscriber = %sub.id,
                            symbol,
                            dropped,
                            "evicting slow consumer"
                        );
                        counter!("relay_slow_consumer_evictions_total").increment(1);
                        self.unsubscribe(symbol, sub.id);
                    }
                }
                SendOutcome::Gone => {
                    // Receiver dropped without unsubscribing: reap it now.
                    self.unsubscribe(symbol, sub.id);
                }
            }
        }
    }

    fn try_deliver(
        &self,
        sub: &Subscriber,
        update: &Arc<MarketDataUpdate>,
        now_ms: i64,
    ) -> SendOutcome {
        let tx = sub.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return SendOutcome::Gone;
        };
        match tx.try_send(update.clone()) {
            Ok(()) => {
                sub.last_send_ms.store(now_ms, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Gone,
        }
    }

    /// Evict subscribers with no successful send within the zombie timeout.
    pub fn cleanup_zombies(&self) -> usize {
        let cutoff = Utc::now().timestamp_millis() - self.zombie_timeout.as_millis() as i64;
        let mut reaped = 0;

        let topics: Vec<(String, Arc<Topic>)> = self
            .topics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (symbol, topic) in topics {
            let zombies: Vec<SubscriberId> = topic
                .subscribers
                .read()
                .values()
                .filter(|sub| !sub.is_closed() && sub.last_send_ms() < cutoff)
                .map(|sub| sub.id)
                .collect();

            for id in zombies {
                info!(subscriber = %id, symbol = %symbol, "reaping zombie subscriber");
                self.unsubscribe(&symbol, id);
                reaped += 1;
            }
        }

        if reaped > 0 {
            counter!("relay_zombie_evictions_total").increment(reaped as u64);
        }
        reaped
    }

    /// Symbols that currently have at least one subscriber.
    pub fn active_symbols(&self) -> Vec<String> {
        self.topics
            .iter()
            .filter(|entry| !entry.value().subscribers.read().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn topic_stats(&self, symbol: &str) -> Option<TopicStats> {
        self.topics.get(symbol).map(|topic| TopicStats {
            subscriber_count: topic.subscribers.read().len(),
            last_update_ms: topic.last_update_ms.load(Ordering::Relaxed),
        })
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            active_topics: self.topics.len(),
            active_subscribers: self.active_subscribers.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
        }
    }

    /// Close every subscriber queue (exactly once each) and drop all topics.
    pub fn shutdown(&self) {
        for entry in self.topics.iter() {
            let mut subscribers = entry.value().subscribers.write();
            for (_, sub) in subscribers.drain() {
                sub.close();
                self.active_subscribers.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.topics.clear();
        gauge!("relay_active_subscribers").set(0.0);
        info!("fanout hub shut down");
    }
}
