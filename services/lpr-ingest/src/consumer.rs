//! Queue consumer with a fixed worker pool.
//!
//! A pump task moves broker deliveries into a bounded buffer; a fixed set of
//! workers drains the buffer and dispatches each message to the handler
//! registered for its routing key. Once the buffer is full the pump stops
//! reading, which in turn stops the broker from delivering past prefetch.

use crate::broker::{BrokerChannel, BrokerError, CloseNotifier, Delivery, QueueSpec, Subscriber};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors a handler may return; any of them causes a nack with requeue
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Message processing error: {0}")]
    Processing(String),

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),
}

/// A delivery handed to a handler
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub queue: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Handler trait for processing messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage) -> Result<(), HandlerError>;
}

/// Worker pool and buffer sizing
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub workers: usize,
    pub buffer_depth: usize,
    pub handler_timeout: Duration,
}

/// What happened to a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued,
    Dropped,
}

/// Consumer bound to one queue
pub struct QueueConsumer {
    spec: QueueSpec,
    settings: ConsumerSettings,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    buffer_tx: mpsc::Sender<Delivery>,
    buffer_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl QueueConsumer {
    pub fn new(spec: QueueSpec, settings: ConsumerSettings, shutdown: CancellationToken) -> Arc<Self> {
        let (buffer_tx, buffer_rx) = mpsc::channel(settings.buffer_depth.max(1));

        Arc::new(Self {
            spec,
            settings,
            handlers: RwLock::new(HashMap::new()),
            buffer_tx,
            buffer_rx: Arc::new(tokio::sync::Mutex::new(buffer_rx)),
            pump: Mutex::new(None),
            generation: AtomicU64::new(0),
            shutdown,
        })
    }

    pub fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    /// Install the handler for a routing key or topic pattern
    pub fn register_handler(&self, routing_key: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let routing_key = routing_key.into();
        info!(queue = %self.spec.name, routing_key = %routing_key, "Handler registered");
        self.handlers.write().insert(routing_key, handler);
    }

    /// Exact key first, then the first matching topic pattern
    fn handler_for(&self, routing_key: &str) -> Option<Arc<dyn MessageHandler>> {
        let handlers = self.handlers.read();
        if let Some(handler) = handlers.get(routing_key) {
            return Some(handler.clone());
        }
        handlers
            .iter()
            .find(|(pattern, _)| routing_key_matches(pattern, routing_key))
            .map(|(_, handler)| handler.clone())
    }

    /// Spawn the worker pool
    pub fn run_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.settings.workers)
            .map(|worker_id| {
                let consumer = self.clone();
                tokio::spawn(async move { consumer.worker_loop(worker_id).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!(queue = %self.spec.name, worker_id = worker_id, "Worker started");

        loop {
            let next = {
                let mut rx = self.buffer_rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    delivery = rx.recv() => delivery,
                }
            };

            let Some(delivery) = next else { break };
            self.dispatch(delivery).await;
        }

        debug!(queue = %self.spec.name, worker_id = worker_id, "Worker stopped");
    }

    /// Run the handler for one delivery and settle it with the broker
    #[instrument(skip(self, delivery), fields(queue = %self.spec.name, routing_key = %delivery.routing_key))]
    pub async fn dispatch(&self, delivery: Delivery) -> Disposition {
        let Some(handler) = self.handler_for(&delivery.routing_key) else {
            debug!("No handler for routing key, dropping");
            if let Err(e) = delivery.acker.ack().await {
                warn!(error = %e, "Failed to ack unroutable message");
            }
            metrics::counter!("lpr.messages.dropped", "queue" => self.spec.name.clone()).increment(1);
            return Disposition::Dropped;
        };

        let message = IncomingMessage {
            queue: self.spec.name.clone(),
            routing_key: delivery.routing_key.clone(),
            payload: delivery.payload,
            redelivered: delivery.redelivered,
        };

        let timeout = self.settings.handler_timeout;
        let outcome = match tokio::time::timeout(timeout, handler.handle(message)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Timeout(timeout)),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = delivery.acker.ack().await {
                    warn!(error = %e, "Failed to ack message");
                }
                metrics::counter!("lpr.messages.acked", "queue" => self.spec.name.clone()).increment(1);
                Disposition::Acked
            }
            Err(e) => {
                error!(error = %e, "Message processing failed, requeueing");
                if let Err(e) = delivery.acker.nack(true).await {
                    warn!(error = %e, "Failed to nack message");
                }
                metrics::counter!("lpr.messages.nacked", "queue" => self.spec.name.clone()).increment(1);
                Disposition::Requeued
            }
        }
    }

    /// Number of times this consumer has subscribed
    pub fn subscriptions(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscriber for QueueConsumer {
    fn name(&self) -> &str {
        &self.spec.name
    }

    /// Declare and bind the queue, then start pumping deliveries into the buffer.
    ///
    /// A delivery stream that ends outside shutdown is reported through
    /// `on_close` so the connection manager re-subscribes.
    async fn setup(
        &self,
        channel: Arc<dyn BrokerChannel>,
        on_close: CloseNotifier,
    ) -> Result<(), BrokerError> {
        channel.declare_queue(&self.spec).await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let consumer_tag = format!("{}-{}", self.spec.name, generation);
        let mut stream = channel.consume(&self.spec.name, &consumer_tag).await?;

        let buffer_tx = self.buffer_tx.clone();
        let shutdown = self.shutdown.clone();
        let queue = self.spec.name.clone();

        let pump = tokio::spawn(async move {
            let lost = loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break None,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        if buffer_tx.send(delivery).await.is_err() {
                            break None;
                        }
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("delivery stream ended".to_string()),
                }
            };

            match lost {
                Some(reason) if !shutdown.is_cancelled() => {
                    warn!(queue = %queue, reason = %reason, "Subscription lost");
                    on_close.notify(BrokerError::Closed(format!("consumer on {queue}: {reason}")));
                }
                _ => debug!(queue = %queue, "Delivery stream ended"),
            }
        });

        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }

        info!(
            queue = %self.spec.name,
            binding_key = %self.spec.binding_key,
            consumer_tag = %consumer_tag,
            "Consuming"
        );
        Ok(())
    }
}

/// Topic-exchange matching: `*` is exactly one word, `#` is zero or more.
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && match_words(rest, key_rest),
            None => false,
        },
    }
}
