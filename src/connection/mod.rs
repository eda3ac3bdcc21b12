//! Broker connection lifecycle
//!
//! [`ConnectionManager`] owns the active configuration and at most one live
//! broker connection. Every change (start, reconfigure, stop) takes the same
//! lock, tears the previous connection down first, and swaps the
//! configuration as a whole. Each established connection gets a new
//! generation number; frames stamped with an older generation are dropped by
//! the ingestion worker, which takes the lock for every frame it processes.
//!
//! ```text
//! Disconnected --start/reconfigure--> Connecting --ok--> Connected
//!      ^                                  |                  |
//!      +-------------- failure -----------+                  |
//!      +---------------------- stop -------------------------+
//! Connected --reconfigure--> Connecting (old link torn down first)
//! ```

mod ingestion;


pub use ingestion::Ingestion;

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard, mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::transport::{FrameSink, Link, Transport};
use crate::types::{PipelineConfig, RawFrame};
use crate::Result;

/// Connection state as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

struct ActiveLink {
    link: Box<dyn Link>,
    generation: u64,
}

/// State guarded by the manager lock.
pub(crate) struct Session {
    config: PipelineConfig,
    active: Option<ActiveLink>,
}

impl Session {
    /// Whether a frame belongs to the live connection.
    pub(crate) fn accepts(&self, frame: &RawFrame) -> bool {
        self.active.as_ref().is_some_and(|active| active.generation == frame.generation)
    }
}

/// Owns the broker connection and its configuration.
///
/// The session lock is held while a connection is set up or torn down and
/// for each frame the ingestion worker processes. Nothing awaits queue space
/// while holding it; publishers use their own [`Link`].
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    session: Mutex<Session>,
    state: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<AtomicU64>,
    frames: mpsc::Sender<RawFrame>,
}

impl ConnectionManager {
    /// Create a manager that will push received frames into `frames`.
    ///
    /// Nothing connects until [`start`](Self::start).
    pub fn new(
        transport: Arc<dyn Transport>,
        config: PipelineConfig,
        frames: mpsc::Sender<RawFrame>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            session: Mutex::new(Session { config, active: None }),
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            frames,
        }
    }

    /// Create a manager together with the receiving end of its frame queue.
    pub fn with_channel(
        transport: Arc<dyn Transport>,
        config: PipelineConfig,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<RawFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(transport, config, tx)), rx)
    }

    /// Connect with the current configuration, replacing any live connection.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let config = session.config.clone();
        self.replace(&mut session, config).await
    }

    /// Swap the configuration and reconnect.
    ///
    /// An invalid configuration is rejected before anything is torn down.
    /// Otherwise the previous connection is always torn down first, even if
    /// the new one then fails to come up.
    pub async fn reconfigure(&self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        let mut session = self.session.lock().await;
        info!(
            "Reconfiguring broker connection to {}:{} topic '{}'",
            config.address, config.port, config.topic
        );
        self.replace(&mut session, config).await
    }

    /// Tear down the live connection, if any.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        self.teardown(&mut session).await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.send_replace(ConnectionState::Disconnected);
        info!("Broker connection stopped");
    }

    pub async fn config(&self) -> PipelineConfig {
        self.session.lock().await.config.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Connection state changes, starting with the current state.
    pub fn state_updates(&self) -> impl Stream<Item = ConnectionState> + 'static {
        WatchStream::new(self.state.subscribe())
    }

    /// Lock the session for processing one frame, or `None` if the frame is stale.
    pub(crate) async fn admit(&self, frame: &RawFrame) -> Option<MutexGuard<'_, Session>> {
        let session = self.session.lock().await;
        session.accepts(frame).then_some(session)
    }

    async fn replace(&self, session: &mut Session, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        self.teardown(session).await;
        session.config = config;
        self.establish(session).await
    }

    /// Best-effort disconnect; failures are logged and never block a reconnect.
    async fn teardown(&self, session: &mut Session) {
        if let Some(mut active) = session.active.take() {
            debug!(generation = active.generation, "Tearing down broker connection");
            if let Err(e) = active.link.disconnect().await {
                warn!("Broker disconnect failed, continuing: {}", e);
            }
        }
    }

    async fn establish(&self, session: &mut Session) -> Result<()> {
        // Bump first so anything still in flight from the old link is stale
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.send_replace(ConnectionState::Connecting);

        let config = &session.config;
        let mut link = match self.transport.connect(&config.address, config.port).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Connection to {}:{} failed: {}", config.address, config.port, e);
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let sink = FrameSink::for_connection(
            self.frames.clone(),
            generation,
            Arc::clone(&self.state),
            Arc::clone(&self.generation),
        );
        if let Err(e) = link.subscribe(&config.topic, sink).await {
            warn!("Subscribing to '{}' failed: {}", config.topic, e);
            if let Err(e) = link.disconnect().await {
                debug!("Disconnect after failed subscribe also failed: {}", e);
            }
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(e);
        }

        info!(
            generation,
            "Connected to {}:{}, subscribed to '{}'", config.address, config.port, config.topic
        );
        session.active = Some(ActiveLink { link, generation });
        self.state.send_replace(ConnectionState::Connected);
        Ok(())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        debug!("Dropping connection manager");
        // Links release their subscriptions when dropped
        self.state.send_replace(ConnectionState::Disconnected);
    }
}
