//! The negotiation pubsub bus.
//!
//! All circuit negotiations travel on one fixed topic. Message ids are the
//! base58 SHA-256 of the raw message bytes, so the same ciphertext arriving
//! through different mesh paths deduplicates; the bus never inspects the
//! payload beyond that.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use whitenoise_crypto::hash::sha256_b58;

use crate::Result;

/// The single topic circuit negotiations are published on.
pub const NOISE_TOPIC: &str = "noise_topic";

/// Retained dedup window.
const SEEN_CAPACITY: usize = 1024;

const SUBSCRIBER_QUEUE: usize = 64;

/// One message delivered off the bus.
#[derive(Clone, Debug)]
pub struct GossipMessage {
    /// base58 SHA-256 of `data`.
    pub id: String,
    pub data: Vec<u8>,
}

/// Publish/subscribe on the negotiation topic.
#[async_trait]
pub trait GossipBus: Send + Sync + 'static {
    /// Publish raw bytes to every subscriber, the publisher included.
    async fn publish(&self, data: Vec<u8>) -> Result<()>;

    /// Subscribe to the topic.
    async fn subscribe(&self) -> mpsc::Receiver<GossipMessage>;
}

struct Dedup {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl Dedup {
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// In-process bus connecting every node in one test mesh.
pub struct MemGossip {
    subscribers: Mutex<Vec<mpsc::Sender<GossipMessage>>>,
    dedup: Mutex<Dedup>,
}

impl MemGossip {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            dedup: Mutex::new(Dedup {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
        })
    }
}

#[async_trait]
impl GossipBus for MemGossip {
    async fn publish(&self, data: Vec<u8>) -> Result<()> {
        let id = sha256_b58(&data);
        if !self.dedup.lock().await.insert(&id) {
            debug!(%id, "dropping duplicate gossip message");
            return Ok(());
        }

        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            let _ = tx
                .send(GossipMessage {
                    id: id.clone(),
                    data: data.clone(),
                })
                .await;
        }
        Ok(())
    }

    async fn subscribe(&self) -> mpsc::Receiver<GossipMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.subscribers.lock().await.push(tx);
        rx
    }
}
