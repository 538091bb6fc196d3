//! In-memory fakes for the broker, the stores and the retry queue.

use crate::blob::{BlobError, BlobStore};
use crate::broker::{
    Acknowledger, BrokerChannel, BrokerError, CloseNotifier, Connector, Delivery, DeliveryStream,
    QueueSpec,
};
use crate::consumer::routing_key_matches;
use crate::model::{CitizenVehiclePhoto, PhotoMessage, RecordMessage, VehicleRecord};
use crate::plate::encode_plate;
use crate::retry::RetryQueue;
use crate::store::{RecordStore, StoreError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Settlement observed by the fake broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    Ack(u64),
    Nack { tag: u64, requeue: bool },
}

/// Message published through a fake channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

#[derive(Default)]
struct BrokerState {
    exchanges: Vec<String>,
    prefetch: Option<u16>,
    refuse_connections: bool,
    queues: HashMap<String, QueueSpec>,
    consumers: HashMap<String, DeliverySender>,
    backlog: HashMap<String, VecDeque<Delivery>>,
    ack_events: Vec<AckEvent>,
    published: Vec<Published>,
    closers: Vec<CloseNotifier>,
    open_flags: Vec<Arc<AtomicBool>>,
    closed_channels: usize,
    next_tag: u64,
}

/// Broker that routes published messages to in-process consumers
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchanges(&self) -> Vec<String> {
        self.state.lock().exchanges.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state.lock().prefetch
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.state.lock().queues.get(name).cloned()
    }

    pub fn ack_events(&self) -> Vec<AckEvent> {
        self.state.lock().ack_events.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Close every open channel and end every consumer stream
    pub fn force_disconnect(&self) {
        let mut state = self.state.lock();
        for flag in state.open_flags.drain(..) {
            flag.store(false, Ordering::SeqCst);
        }
        state.consumers.clear();
        for closer in state.closers.drain(..) {
            closer.notify(BrokerError::Closed("connection reset".to_string()));
        }
    }

    /// End the delivery stream of one queue's consumer, leaving the connection up
    pub fn end_consumer(&self, queue: &str) {
        self.state.lock().consumers.remove(queue);
    }

    /// Channels closed by their owner
    pub fn closed_channels(&self) -> usize {
        self.state.lock().closed_channels
    }

    /// A standalone delivery and its tag
    pub fn delivery(&self, routing_key: &str, payload: &[u8]) -> (Delivery, u64) {
        let tag = {
            let mut state = self.state.lock();
            state.next_tag += 1;
            state.next_tag
        };

        let delivery = Delivery {
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            redelivered: false,
            acker: Box::new(MemoryAcker {
                tag,
                broker: self.clone(),
            }),
        };
        (delivery, tag)
    }

    /// Deliver straight into a queue, bypassing exchange routing
    pub fn push(&self, queue: &str, routing_key: &str, payload: &[u8]) -> u64 {
        let (delivery, tag) = self.delivery(routing_key, payload);
        self.enqueue(queue, delivery);
        tag
    }

    fn enqueue(&self, queue: &str, delivery: Delivery) {
        let mut state = self.state.lock();
        let delivery = match state.consumers.get(queue) {
            Some(sender) => match sender.send(Ok(delivery)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => match returned {
                    Ok(delivery) => delivery,
                    Err(_) => return,
                },
            },
            None => delivery,
        };
        state
            .backlog
            .entry(queue.to_string())
            .or_default()
            .push_back(delivery);
    }

    fn route(&self, exchange: &str, routing_key: &str, payload: &[u8]) {
        let targets: Vec<String> = self
            .state
            .lock()
            .queues
            .values()
            .filter(|q| q.exchange == exchange && routing_key_matches(&q.binding_key, routing_key))
            .map(|q| q.name.clone())
            .collect();

        for queue in targets {
            let (delivery, _) = self.delivery(routing_key, payload);
            self.enqueue(&queue, delivery);
        }
    }
}

struct MemoryAcker {
    tag: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.state.lock().ack_events.push(AckEvent::Ack(self.tag));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.broker.state.lock().ack_events.push(AckEvent::Nack {
            tag: self.tag,
            requeue,
        });
        Ok(())
    }
}

pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        prefetch: u16,
        on_close: CloseNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.state.lock();
        if state.refuse_connections {
            return Err(BrokerError::Connect("connection refused".to_string()));
        }

        let open = Arc::new(AtomicBool::new(true));
        state.prefetch = Some(prefetch);
        state.closers.push(on_close);
        state.open_flags.push(open.clone());

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            open,
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.exchanges.iter().any(|e| e == name) {
            state.exchanges.push(name.to_string());
        }
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .state
            .lock()
            .queues
            .insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.broker.state.lock();
        if let Some(backlog) = state.backlog.remove(queue) {
            for delivery in backlog {
                let _ = tx.send(Ok(delivery));
            }
        }
        state.consumers.insert(queue.to_string(), tx);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        self.ensure_open().map_err(|_| BrokerError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: "channel closed".to_string(),
        })?;

        self.broker.state.lock().published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });
        self.broker.route(exchange, routing_key, payload);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.broker.state.lock().closed_channels += 1;
    }
}

/// Store operation observed by [`MemoryStore`]; reads are not logged
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    InsertRecord(String),
    MarkSent(String),
    UpdateRetryState {
        record_id: String,
        retries: i32,
        backoff_time: i64,
    },
    DeleteRecord(String),
    InsertPhotos(usize),
    DeletePhotos(Vec<Uuid>),
}

#[derive(Default)]
struct StoreState {
    records: HashMap<String, VehicleRecord>,
    photos: Vec<CitizenVehiclePhoto>,
    calls: Vec<StoreCall>,
    fail_photo_inserts: bool,
    fail_mark_sent: bool,
    fail_retry_updates: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly, without logging a call
    pub fn seed(&self, record: VehicleRecord) {
        self.state
            .lock()
            .records
            .insert(record.record_id.clone(), record);
    }

    pub fn record(&self, record_id: &str) -> Option<VehicleRecord> {
        self.state.lock().records.get(record_id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn photos(&self, record_id: &str) -> Vec<CitizenVehiclePhoto> {
        self.state
            .lock()
            .photos
            .iter()
            .filter(|p| p.record_id == record_id)
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    pub fn fail_photo_inserts(&self, fail: bool) {
        self.state.lock().fail_photo_inserts = fail;
    }

    pub fn fail_mark_sent(&self, fail: bool) {
        self.state.lock().fail_mark_sent = fail;
    }

    pub fn fail_retry_updates(&self, fail: bool) {
        self.state.lock().fail_retry_updates = fail;
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_record(&self, record: &VehicleRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::InsertRecord(record.record_id.clone()));
        if state.records.contains_key(&record.record_id) {
            return Err(StoreError::Duplicate(record.record_id.clone()));
        }
        state.records.insert(record.record_id.clone(), record.clone());
        Ok(())
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<VehicleRecord>, StoreError> {
        Ok(self.record(record_id))
    }

    async fn mark_sent(&self, record: &VehicleRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::MarkSent(record.record_id.clone()));
        if state.fail_mark_sent {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let stored = state
            .records
            .get_mut(&record.record_id)
            .ok_or_else(|| StoreError::NotFound(record.record_id.clone()))?;
        stored.sent = record.sent;
        stored.request_id = record.request_id.clone();
        stored.plate_detection_id = record.plate_detection_id.clone();
        Ok(())
    }

    async fn update_retry_state(
        &self,
        record_id: &str,
        retries: i32,
        backoff_time: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::UpdateRetryState {
            record_id: record_id.to_string(),
            retries,
            backoff_time,
        });
        if state.fail_retry_updates {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let stored = state
            .records
            .get_mut(record_id)
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;
        stored.retries = retries;
        stored.backoff_time = backoff_time;
        Ok(())
    }

    async fn delete_record(&self, record_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::DeleteRecord(record_id.to_string()));
        state.records.remove(record_id);
        Ok(())
    }

    async fn insert_photos(&self, photos: &[CitizenVehiclePhoto]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::InsertPhotos(photos.len()));
        if state.fail_photo_inserts {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        state.photos.extend_from_slice(photos);
        Ok(())
    }

    async fn delete_photos(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::DeletePhotos(ids.to_vec()));
        state.photos.retain(|p| !ids.contains(&p.id));
        Ok(())
    }

    async fn photos_for_record(&self, record_id: &str) -> Result<Vec<CitizenVehiclePhoto>, StoreError> {
        let mut photos = self.photos(record_id);
        photos.sort_by_key(|p| p.seq_index);
        Ok(photos)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct BlobState {
    objects: HashMap<String, Vec<u8>>,
    uploads: usize,
    attempts: usize,
    deleted: Vec<String>,
    fail_upload_after: Option<usize>,
    stall_upload: Option<(usize, Duration)>,
    fail_deletes: bool,
}

pub struct MemoryBlobStore {
    bucket: String,
    state: Mutex<BlobState>,
}

impl MemoryBlobStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            state: Mutex::new(BlobState::default()),
        }
    }

    /// Successful uploads so far
    pub fn uploads(&self) -> usize {
        self.state.lock().uploads
    }

    /// Keys currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.state.lock().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    /// Let `n` uploads succeed, fail every one after
    pub fn fail_upload_after(&self, n: usize) {
        self.state.lock().fail_upload_after = Some(n);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().fail_deletes = fail;
    }

    /// Make upload attempt `n` (zero based) hang for `delay` and then fail
    pub fn stall_upload(&self, n: usize, delay: Duration) {
        self.state.lock().stall_upload = Some((n, delay));
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<(), BlobError> {
        let stall = {
            let mut state = self.state.lock();
            let attempt = state.attempts;
            state.attempts += 1;
            match state.stall_upload {
                Some((n, delay)) if n == attempt => Some(delay),
                _ => None,
            }
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
            return Err(BlobError::Upload {
                key: key.to_string(),
                message: "upload stalled".to_string(),
            });
        }

        let mut state = self.state.lock();
        if matches!(state.fail_upload_after, Some(n) if state.uploads >= n) {
            return Err(BlobError::Upload {
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }
        state.uploads += 1;
        state.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        self.state
            .lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::Get {
                key: key.to_string(),
                message: "no such key".to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let mut state = self.state.lock();
        if state.fail_deletes {
            return Err(BlobError::Delete {
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }
        state.objects.remove(key);
        state.deleted.push(key.to_string());
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{}/{}", self.bucket, key)
    }
}

#[derive(Default)]
struct RetryQueueState {
    messages: Vec<RecordMessage>,
    fail: bool,
}

/// Retry queue that keeps enqueued messages in memory
#[derive(Default)]
pub struct MemoryRetryQueue {
    state: Mutex<RetryQueueState>,
}

impl MemoryRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<RecordMessage> {
        self.state.lock().messages.clone()
    }

    pub fn fail(&self, fail: bool) {
        self.state.lock().fail = fail;
    }
}

#[async_trait]
impl RetryQueue for MemoryRetryQueue {
    async fn enqueue(&self, message: &RecordMessage) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.fail {
            return Err(BrokerError::NotConnected);
        }
        state.messages.push(message.clone());
        Ok(())
    }
}

/// Detection event with a valid plate and `photos` distinct photos
pub fn sample_message(record_id: &str, photos: usize) -> RecordMessage {
    let capture_time = 1_705_314_600_000;
    RecordMessage {
        record_id: record_id.to_string(),
        capture_time,
        store_time: capture_time + 150,
        send_time: capture_time + 300,
        plate: "12ب34511".to_string(),
        vehicle_class: 1,
        vehicle_type: 2,
        vehicle_color: 3,
        latitude: 35.6892,
        longitude: 51.389,
        gps_error: 2.5,
        rtk_latitude: 35.68921,
        rtk_longitude: 51.38901,
        rtk_error: 0.02,
        road_id: 12,
        segment_id: 4,
        ring_id: 1,
        parking_lot_id: 0,
        retries: 0,
        backoff_time: 0,
        created_at: 0,
        vehicle_photos: (0..photos)
            .map(|i| PhotoMessage {
                index: i as i32,
                confidence: 0.9,
                camera_id: format!("cam-{i}"),
                capture_time: capture_time + i as i64,
                photo: STANDARD.encode(format!("{record_id}-photo-{i}")),
                crop_photo: STANDARD.encode(format!("{record_id}-crop-{i}")),
            })
            .collect(),
    }
}

/// Unsent record row for a sample message
pub fn sample_record(message: &RecordMessage) -> VehicleRecord {
    let plate_number = encode_plate(&message.plate).unwrap();
    VehicleRecord::from_message(message, plate_number, Utc::now())
}
