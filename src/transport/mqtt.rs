//! MQTT broker transport
//!
//! Each [`Link`] is one MQTT client session with its own event loop task.
//! The task hands incoming publishes to the subscribed [`FrameSink`]s and
//! reports connection loss and recovery through them. Requests
//! (subscribe, publish) go through the client and are bounded by
//! [`MqttTransport::request_timeout`].

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{FrameSink, Link, Transport, topic_matches};
use crate::{Result, V2vError};

/// Pending requests the client may queue before callers wait.
const REQUEST_CAPACITY: usize = 64;
/// Pause between reconnection attempts after the broker went away.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// How long a disconnect waits for the DISCONNECT packet to go out.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Connects to an MQTT broker over TCP.
#[derive(Debug)]
pub struct MqttTransport {
    client_prefix: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    request_timeout: Duration,
    next_client: AtomicU64,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self {
            client_prefix: "v2v-telemetry".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            next_client: AtomicU64::new(0),
        }
    }
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix of the client ids; the process id and a counter are appended.
    pub fn client_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_prefix = prefix.into();
        self
    }

    /// Keep-alive interval; at least one second.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive.max(Duration::from_secs(1));
        self
    }

    /// Time allowed for the broker to acknowledge a new connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Time allowed for a subscribe or publish to be queued.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn client_id(&self) -> String {
        let n = self.next_client.fetch_add(1, Ordering::AcqRel);
        format!("{}-{}-{}", self.client_prefix, std::process::id(), n)
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, address: &str, port: u16) -> Result<Box<dyn Link>> {
        let client_id = self.client_id();
        let mut options = MqttOptions::new(client_id.clone(), address, port);
        options.set_keep_alive(self.keep_alive);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        match tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Err(_) => return Err(V2vError::Timeout { duration: self.connect_timeout }),
            Ok(Err(e)) => {
                return Err(V2vError::connection_failed_with_source(
                    format!("{address}:{port} did not accept the connection"),
                    Box::new(e),
                ));
            }
            Ok(Ok(())) => {}
        }
        info!(client = %client_id, "MQTT connected to {}:{}", address, port);

        let subscriptions = Arc::new(Subscriptions::default());
        let delivery = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            EventLoopTask {
                eventloop,
                client: client.clone(),
                subscriptions: Arc::clone(&subscriptions),
                delivery: delivery.clone(),
                shutdown: shutdown.clone(),
            }
            .run(),
        );

        Ok(Box::new(MqttLink {
            client,
            client_id,
            subscriptions,
            request_timeout: self.request_timeout,
            delivery,
            shutdown,
            task: Some(task),
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> std::result::Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    filter: String,
    sink: FrameSink,
}

#[derive(Debug, Default)]
struct Subscriptions {
    entries: Mutex<Vec<Subscription>>,
}

impl Subscriptions {
    fn lock(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, filter: &str, sink: FrameSink) {
        self.lock().push(Subscription { filter: filter.to_string(), sink });
    }

    fn remove(&self, filter: &str) {
        self.lock().retain(|s| s.filter != filter);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn matching(&self, topic: &str) -> Vec<FrameSink> {
        self.lock()
            .iter()
            .filter(|s| topic_matches(&s.filter, topic))
            .map(|s| s.sink.clone())
            .collect()
    }

    fn all(&self) -> Vec<Subscription> {
        self.lock().clone()
    }
}

/// Drives one client's event loop until the link is closed.
struct EventLoopTask {
    eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Subscriptions>,
    /// Cancelled first on disconnect: stop handing frames out
    delivery: CancellationToken,
    /// Cancelled last: stop polling
    shutdown: CancellationToken,
}

impl EventLoopTask {
    async fn run(mut self) {
        let mut connected = true;
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    trace!(
                        topic = %publish.topic,
                        length = publish.payload.len(),
                        "MQTT publish received"
                    );
                    for sink in self.subscriptions.matching(&publish.topic) {
                        tokio::select! {
                            biased;
                            _ = self.delivery.cancelled() => break,
                            _ = sink.deliver(&publish.topic, &publish.payload) => {}
                        }
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) if !connected => {
                    connected = true;
                    info!("MQTT connection restored");
                    self.resubscribe();
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("MQTT disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if connected {
                        connected = false;
                        warn!("MQTT connection lost, retrying: {}", e);
                        for subscription in self.subscriptions.all() {
                            subscription.sink.link_lost();
                        }
                    } else {
                        debug!("MQTT reconnect failed: {}", e);
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
        debug!("MQTT event loop finished");
    }

    /// Clean sessions forget subscriptions, so every reconnect renews them.
    fn resubscribe(&self) {
        for subscription in self.subscriptions.all() {
            let filter = subscription.filter.as_str();
            if let Err(e) = self.client.try_subscribe(filter, QoS::AtMostOnce) {
                warn!("Renewing subscription to '{}' failed: {}", subscription.filter, e);
                continue;
            }
            subscription.sink.link_restored();
        }
    }
}

/// One MQTT client session.
struct MqttLink {
    client: AsyncClient,
    client_id: String,
    subscriptions: Arc<Subscriptions>,
    request_timeout: Duration,
    delivery: CancellationToken,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MqttLink {
    fn ensure_open(&self) -> Result<()> {
        match self.task {
            Some(_) => Ok(()),
            None => Err(V2vError::connection_failed("link is closed")),
        }
    }
}

#[async_trait::async_trait]
impl Link for MqttLink {
    async fn subscribe(&mut self, topic: &str, sink: FrameSink) -> Result<()> {
        self.ensure_open()?;
        // Registered first so nothing published right after SUBACK is missed
        self.subscriptions.add(topic, sink);
        let request = self.client.subscribe(topic, QoS::AtMostOnce);
        let outcome = match tokio::time::timeout(self.request_timeout, request).await {
            Err(_) => Err(V2vError::Timeout { duration: self.request_timeout }),
            Ok(Err(e)) => Err(V2vError::connection_failed_with_source(
                format!("subscribe to '{topic}' was not sent"),
                Box::new(e),
            )),
            Ok(Ok(())) => Ok(()),
        };
        match outcome {
            Ok(()) => {
                debug!(client = %self.client_id, "Subscribed to {}", topic);
                Ok(())
            }
            Err(e) => {
                self.subscriptions.remove(topic);
                Err(e)
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let request = self.client.publish(topic, QoS::AtMostOnce, false, payload.to_vec());
        match tokio::time::timeout(self.request_timeout, request).await {
            Err(_) => Err(V2vError::publish_failed(
                topic,
                format!("not queued within {:?}", self.request_timeout),
            )),
            Ok(Err(e)) => Err(V2vError::publish_failed(topic, e.to_string())),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        self.subscriptions.clear();
        self.delivery.cancel();

        let requested = self.client.try_disconnect();
        if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
            self.shutdown.cancel();
            if let Err(e) = task.await {
                debug!("MQTT event loop ended abnormally: {}", e);
            }
        }
        self.shutdown.cancel();
        debug!(client = %self.client_id, "MQTT link closed");

        requested.map_err(|e| {
            V2vError::connection_failed_with_source("disconnect was not sent", Box::new(e))
        })
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.delivery.cancel();
        self.shutdown.cancel();
    }
}
