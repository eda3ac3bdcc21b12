//! In-process broker
//!
//! Routes published payloads to subscribed sinks within the same process.
//! Used for loopback runs (replay feeding ingestion directly) and for tests,
//! where its failure switches stand in for an unreachable or misbehaving
//! broker.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use super::{FrameSink, Link, Transport, topic_matches};
use crate::{Result, V2vError};

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    subscriptions: Mutex<Vec<Subscription>>,
    next_link: AtomicU64,
    active_links: AtomicUsize,
    connects: AtomicU64,
    published: AtomicU64,
    refuse_connections: AtomicBool,
    fail_publishes: AtomicBool,
    fail_disconnects: AtomicBool,
}

#[derive(Debug, Clone)]
struct Subscription {
    link_id: u64,
    filter: String,
    sink: FrameSink,
}

impl BrokerInner {
    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        // Subscription lists stay consistent even if a holder panicked
        self.subscriptions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, link_id: u64) {
        self.subscriptions().retain(|s| s.link_id != link_id);
        self.active_links.fetch_sub(1, Ordering::AcqRel);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::Release);
    }

    /// Reject (or accept again) every publish.
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::Release);
    }

    /// Make disconnect report an error (the link is still released).
    pub fn fail_disconnects(&self, fail: bool) {
        self.inner.fail_disconnects.store(fail, Ordering::Release);
    }

    /// Tell every subscriber its link dropped, as a network outage would.
    pub fn interrupt(&self) {
        for subscription in self.inner.subscriptions().iter() {
            subscription.sink.link_lost();
        }
    }

    /// Tell every subscriber its link is back.
    pub fn restore(&self) {
        for subscription in self.inner.subscriptions().iter() {
            subscription.sink.link_restored();
        }
    }

    /// Connections currently open.
    pub fn active_links(&self) -> usize {
        self.inner.active_links.load(Ordering::Acquire)
    }

    /// Connections ever opened.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::Acquire)
    }

    /// Payloads accepted for routing.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.subscriptions().iter().filter(|s| topic_matches(&s.filter, topic)).count()
    }
}

#[async_trait::async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, address: &str, port: u16) -> Result<Box<dyn Link>> {
        if self.inner.refuse_connections.load(Ordering::Acquire) {
            return Err(V2vError::connection_failed(format!("{address}:{port} refused connection")));
        }
        let id = self.inner.next_link.fetch_add(1, Ordering::AcqRel);
        self.inner.active_links.fetch_add(1, Ordering::AcqRel);
        self.inner.connects.fetch_add(1, Ordering::AcqRel);
        debug!(link = id, "Memory link opened for {}:{}", address, port);
        Ok(Box::new(MemoryLink { broker: Arc::clone(&self.inner), id, open: true }))
    }
}

struct MemoryLink {
    broker: Arc<BrokerInner>,
    id: u64,
    open: bool,
}

impl MemoryLink {
    fn ensure_open(&self) -> Result<()> {
        if self.open { Ok(()) } else { Err(V2vError::connection_failed("link is closed")) }
    }
}

#[async_trait::async_trait]
impl Link for MemoryLink {
    async fn subscribe(&mut self, topic: &str, sink: FrameSink) -> Result<()> {
        self.ensure_open()?;
        self.broker.subscriptions().push(Subscription {
            link_id: self.id,
            filter: topic.to_string(),
            sink,
        });
        debug!(link = self.id, "Subscribed to {}", topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.broker.fail_publishes.load(Ordering::Acquire) {
            return Err(V2vError::publish_failed(topic, "broker rejected the message"));
        }
        self.broker.published.fetch_add(1, Ordering::AcqRel);

        // Deliver outside the lock; sinks may wait for queue space
        let sinks: Vec<FrameSink> = self
            .broker
            .subscriptions()
            .iter()
            .filter(|s| topic_matches(&s.filter, topic))
            .map(|s| s.sink.clone())
            .collect();
        trace!(
            link = self.id,
            subscribers = sinks.len(),
            "Routing {} bytes on {}",
            payload.len(),
            topic
        );
        for sink in sinks {
            sink.deliver(topic, payload).await;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.broker.release(self.id);
        debug!(link = self.id, "Memory link closed");
        if self.broker.fail_disconnects.load(Ordering::Acquire) {
            return Err(V2vError::connection_failed("disconnect was not acknowledged"));
        }
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        if self.open {
            self.broker.release(self.id);
        }
    }
}
