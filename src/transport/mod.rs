//! Publish/subscribe transport seam
//!
//! Transports abstract over the messaging layer the pipeline talks to. A
//! [`Transport`] opens [`Link`]s; a link subscribes a [`FrameSink`] to a
//! topic and publishes raw payloads. The sink is the push side of the
//! ingestion channel: transports hand every received message to it, and it
//! stamps the message with the connection generation it belongs to.
//!
//! Two transports ship with the crate: [`MemoryBroker`] routes within the
//! process, and `MqttTransport` (feature `mqtt`, on by default) talks to a
//! real MQTT broker.

mod memory;
#[cfg(feature = "mqtt")]
mod mqtt;

pub use memory::MemoryBroker;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::Result;
use crate::connection::ConnectionState;
use crate::types::RawFrame;

/// Factory for broker connections.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `address:port`.
    async fn connect(&self, address: &str, port: u16) -> Result<Box<dyn Link>>;
}

/// One open broker connection.
#[async_trait::async_trait]
pub trait Link: Send + 'static {
    /// Deliver every message on `topic` to `sink` until disconnected.
    async fn subscribe(&mut self, topic: &str, sink: FrameSink) -> Result<()>;

    /// Publish one raw payload.
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Close the connection. Subscriptions stop delivering.
    async fn disconnect(&mut self) -> Result<()>;
}

/// Push side of the ingestion channel, bound to one connection generation.
#[derive(Debug, Clone)]
pub struct FrameSink {
    frames: mpsc::Sender<RawFrame>,
    generation: u64,
    link: Option<LinkStatus>,
}

#[derive(Debug, Clone)]
struct LinkStatus {
    state: Arc<watch::Sender<ConnectionState>>,
    current_generation: Arc<AtomicU64>,
}

impl FrameSink {
    /// A sink not tied to any connection manager.
    pub fn new(frames: mpsc::Sender<RawFrame>) -> Self {
        Self { frames, generation: 0, link: None }
    }

    pub(crate) fn for_connection(
        frames: mpsc::Sender<RawFrame>,
        generation: u64,
        state: Arc<watch::Sender<ConnectionState>>,
        current_generation: Arc<AtomicU64>,
    ) -> Self {
        Self { frames, generation, link: Some(LinkStatus { state, current_generation }) }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hand a received message to the ingestion side, waiting for queue space.
    ///
    /// Returns `false` once the ingestion side has gone away.
    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        let frame = RawFrame::new(payload.to_vec(), topic, self.generation);
        trace!(generation = self.generation, length = payload.len(), "Delivering frame");
        self.frames.send(frame).await.is_ok()
    }

    /// Report that the transport lost the connection and is retrying.
    pub fn link_lost(&self) {
        self.set_state(ConnectionState::Connecting);
    }

    /// Report that the transport re-established the connection.
    pub fn link_restored(&self) {
        self.set_state(ConnectionState::Connected);
    }

    fn set_state(&self, state: ConnectionState) {
        let Some(link) = &self.link else {
            return;
        };
        // A replaced connection must not overwrite its successor's state
        if link.current_generation.load(Ordering::Acquire) != self.generation {
            debug!(
                generation = self.generation,
                ?state,
                "Ignoring state change from replaced link"
            );
            return;
        }
        link.state.send_replace(state);
    }
}

/// MQTT-style topic filter matching (`+` one level, `#` the rest).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
