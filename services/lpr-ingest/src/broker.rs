//! Broker connection manager.
//!
//! Owns the single broker channel, declares the topic exchanges, and runs a
//! supervisor that reconnects with exponential backoff whenever the
//! connection reports it has closed. After every reconnect all registered
//! subscribers are set up again on the fresh channel.

use crate::config::BrokerConfig;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors raised by the broker seam
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    #[error("Failed to declare {kind} {name}: {message}")]
    Declare {
        kind: &'static str,
        name: String,
        message: String,
    },

    #[error("Failed to consume from {queue}: {message}")]
    Consume { queue: String, message: String },

    #[error("Failed to publish to {exchange}/{routing_key}: {message}")]
    Publish {
        exchange: String,
        routing_key: String,
        message: String,
    },

    #[error("Failed to acknowledge delivery: {0}")]
    Ack(String),

    #[error("Broker connection closed: {0}")]
    Closed(String),

    #[error("Broker is not connected")]
    NotConnected,
}

/// Queue declaration: durable, quorum-replicated, bound to one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub exchange: String,
    pub binding_key: String,
    /// Per-message time-to-live
    pub message_ttl: Option<Duration>,
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message pulled from a queue
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub acker: Box<dyn Acknowledger>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Operations the pipeline needs from an open broker channel
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable topic exchange
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare a durable quorum queue and bind it
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    /// Start a manual-ack consumer on a queue
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    /// Publish a persistent JSON message
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    /// Close the underlying connection; errors are only logged
    async fn close(&self);
}

type CloseReport = (u64, BrokerError);

/// Reports that a connection, or a consumer riding on it, has closed.
///
/// Each notifier is stamped with the generation of the connection it was
/// handed out for; reports about a connection that has since been replaced
/// are ignored by the supervisor.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<CloseReport>,
}

impl CloseNotifier {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, BrokerError)>) -> Self {
        Self { generation, tx }
    }

    /// Returns false once nobody is listening
    pub fn notify(&self, reason: BrokerError) -> bool {
        self.tx.send((self.generation, reason)).is_ok()
    }
}

/// Opens broker channels
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        prefetch: u16,
        on_close: CloseNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// Something that must (re)declare and (re)subscribe on every new channel
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;

    /// `on_close` is for reporting that the subscription was lost
    async fn setup(
        &self,
        channel: Arc<dyn BrokerChannel>,
        on_close: CloseNotifier,
    ) -> Result<(), BrokerError>;
}

/// State of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    state: ConnectionState,
    channel: Option<Arc<dyn BrokerChannel>>,
}

/// Broker connection manager shared by consumers and publishers
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: BrokerConfig,
    inner: RwLock<Inner>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
    reconnecting: AtomicBool,
    /// Bumped on every connection attempt
    generation: AtomicU64,
    close_tx: mpsc::UnboundedSender<CloseReport>,
    close_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<CloseReport>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: BrokerConfig) -> Arc<Self> {
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            connector,
            config,
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                channel: None,
            }),
            subscribers: RwLock::new(Vec::new()),
            reconnecting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            close_tx,
            close_rx: parking_lot::Mutex::new(Some(close_rx)),
        })
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    /// Report connectivity without touching the broker
    pub fn health_check(&self) -> bool {
        let inner = self.inner.read();
        inner.state == ConnectionState::Connected
            && inner.channel.as_ref().map(|c| c.is_open()).unwrap_or(false)
    }

    /// Current channel, if connected
    pub fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let inner = self.inner.read();
        match (&inner.state, &inner.channel) {
            (ConnectionState::Connected, Some(channel)) => Ok(channel.clone()),
            _ => Err(BrokerError::NotConnected),
        }
    }

    /// Register a subscriber to be set up after every (re)connect
    pub fn register(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Open a channel, declare exchanges and set prefetch
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.inner.write().state = ConnectionState::Connecting;

        match self.open_channel().await {
            Ok(channel) => {
                let mut inner = self.inner.write();
                inner.channel = Some(channel);
                inner.state = ConnectionState::Connected;
                info!(
                    exchange = %self.config.exchange,
                    retry_exchange = %self.config.retry_exchange,
                    prefetch = self.config.prefetch,
                    "Connected to broker"
                );
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.write();
                inner.channel = None;
                inner.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = self
            .connector
            .connect(
                self.config.prefetch,
                CloseNotifier::new(generation, self.close_tx.clone()),
            )
            .await?;

        if let Err(e) = self.declare_exchanges(channel.as_ref()).await {
            channel.close().await;
            return Err(e);
        }

        Ok(channel)
    }

    async fn declare_exchanges(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        channel.declare_exchange(&self.config.exchange).await?;
        if self.config.retry_exchange != self.config.exchange {
            channel.declare_exchange(&self.config.retry_exchange).await?;
        }
        Ok(())
    }

    /// Notifier for the current connection generation
    fn notifier(&self) -> CloseNotifier {
        CloseNotifier::new(self.generation.load(Ordering::SeqCst), self.close_tx.clone())
    }

    /// Set up every registered subscriber on the current channel
    pub async fn setup_subscribers(&self) -> Result<(), BrokerError> {
        let channel = self.channel()?;
        let on_close = self.notifier();
        let subscribers: Vec<_> = self.subscribers.read().clone();

        for subscriber in subscribers {
            subscriber.setup(channel.clone(), on_close.clone()).await?;
            info!(subscriber = subscriber.name(), "Subscriber set up");
        }

        Ok(())
    }

    /// Publish on the current channel
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        self.channel()?.publish(exchange, routing_key, payload).await
    }

    /// Watch for connection-closed notifications and reconnect.
    ///
    /// Only one supervisor may run per manager.
    pub fn spawn_supervisor(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let close_rx = self.close_rx.lock().take();

        tokio::spawn(async move {
            let Some(mut close_rx) = close_rx else {
                warn!("Broker supervisor already running");
                return;
            };

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Broker supervisor stopping");
                        break;
                    }
                    closed = close_rx.recv() => {
                        let Some((generation, reason)) = closed else { break };
                        if generation != manager.generation.load(Ordering::SeqCst) {
                            debug!(
                                generation = generation,
                                reason = %reason,
                                "Ignoring close report for a replaced connection"
                            );
                            continue;
                        }
                        warn!(reason = %reason, "Broker connection closed");
                        metrics::counter!("lpr.broker.disconnects").increment(1);
                        manager.discard_channel().await;
                        manager.reconnect(&shutdown).await;
                    }
                }
            }
        })
    }

    /// Drop the current channel and close its connection
    async fn discard_channel(&self) {
        let channel = {
            let mut inner = self.inner.write();
            inner.state = ConnectionState::Disconnected;
            inner.channel.take()
        };

        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    /// Reconnect with exponential backoff until connected or shut down.
    async fn reconnect(&self, shutdown: &CancellationToken) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut backoff = reconnect_backoff(&self.config);
        let mut attempts = 0u32;

        loop {
            let delay = backoff.next_backoff().unwrap_or(self.config.reconnect_max());

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            attempts += 1;
            match self.connect().await {
                Ok(()) => match self.setup_subscribers().await {
                    Ok(()) => {
                        info!(attempts = attempts, "Reconnected to broker");
                        metrics::counter!("lpr.broker.reconnects").increment(1);
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, attempts = attempts, "Subscriber setup failed after reconnect");
                        self.discard_channel().await;
                    }
                },
                Err(e) => {
                    warn!(
                        error = %e,
                        attempts = attempts,
                        next_delay_ms = delay.as_millis() as u64,
                        "Broker reconnect attempt failed"
                    );
                }
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

/// Doubling backoff from the initial delay, capped at the maximum, no jitter.
fn reconnect_backoff(config: &BrokerConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: config.reconnect_initial(),
        initial_interval: config.reconnect_initial(),
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: config.reconnect_max(),
        max_elapsed_time: None,
        ..Default::default()
    }
}
