//! Record ingestion: persist, upload, submit.
//!
//! ```text
//! insert record ──▶ upload photo/crop blobs ──▶ bulk insert photo rows ──▶ submit
//!      │                    │                          │                    │
//!  duplicate?         failure: compensate        failure: compensate   failure: enqueue retry
//! ```

use crate::blob::{BlobError, BlobStore};
use crate::broker::BrokerError;
use crate::model::{
    crop_photo_key, photo_key, CitizenVehiclePhoto, PhotoMessage, RecordMessage, VehicleRecord,
};
use crate::plate::{encode_plate, PlateError};
use crate::regulator::{Regulator, RegulatorError};
use crate::retry::RetryQueue;
use crate::saga::{Compensation, Saga};
use crate::store::{RecordStore, StoreError};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("record {0} already ingested")]
    Duplicate(String),

    #[error("invalid plate: {0}")]
    InvalidPlate(#[from] PlateError),

    #[error("malformed photo payload for record {record_id}: {message}")]
    Decode { record_id: String, message: String },

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    #[error("blob storage failure: {0}")]
    Blob(#[from] BlobError),

    #[error("submission failed: {0}")]
    Submission(#[from] RegulatorError),

    /// Submission was accepted but recording it failed
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("failed to enqueue retry: {0}")]
    Enqueue(#[from] BrokerError),
}

impl IngestError {
    /// Errors a redelivery can never fix
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            IngestError::Duplicate(_) | IngestError::InvalidPlate(_) | IngestError::Decode { .. }
        )
    }
}

/// How a successful creation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Persisted and accepted by the regulator
    Submitted,
    /// Persisted unsent; a retry message was enqueued
    QueuedForRetry,
}

/// Runs the record-creation saga and the shared submission path
pub struct IngestionService {
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    regulator: Arc<dyn Regulator>,
    retry_queue: Arc<dyn RetryQueue>,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        regulator: Arc<dyn Regulator>,
        retry_queue: Arc<dyn RetryQueue>,
    ) -> Self {
        Self {
            store,
            blobs,
            regulator,
            retry_queue,
        }
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn retry_queue(&self) -> &dyn RetryQueue {
        self.retry_queue.as_ref()
    }

    /// Persist a detection with its photos and forward it to the regulator.
    ///
    /// Storage failures are compensated and returned. Submission failures
    /// leave the record unsent and enqueue a retry instead of failing.
    #[instrument(skip(self, message), fields(record_id = %message.record_id, photos = message.vehicle_photos.len()))]
    pub async fn create_record(&self, message: RecordMessage) -> Result<CreateOutcome, IngestError> {
        let started = Instant::now();
        let plate_number = encode_plate(&message.plate)?;
        let mut record = VehicleRecord::from_message(&message, plate_number, Utc::now());

        match self.store.insert_record(&record).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(record_id)) => {
                metrics::counter!("lpr.records.duplicates").increment(1);
                return self.resume_duplicate(&message, record_id).await;
            }
            Err(e) => return Err(e.into()),
        }

        let mut saga = Saga::new();
        saga.record(Compensation::DeleteRecord(record.record_id.clone()));

        if let Err(e) = self.store_photos(&record, &message.vehicle_photos, &mut saga).await {
            warn!(error = %e, steps = saga.steps().len(), "Record creation failed, compensating");
            let report = saga.compensate(self.store.as_ref(), self.blobs.as_ref()).await;
            if !report.failed.is_empty() {
                error!(failed = ?report.failed, "Compensation incomplete");
            }
            return Err(e);
        }

        metrics::counter!("lpr.records.created").increment(1);

        let outcome = match self.submit(&mut record, &message.vehicle_photos).await {
            Ok(()) => {
                info!("Record ingested and submitted");
                CreateOutcome::Submitted
            }
            Err(e) => {
                warn!(error = %e, "Submission failed, scheduling retry");
                let retry = self.retry_message_from_storage(&record).await?;
                self.retry_queue.enqueue(&retry).await?;
                metrics::counter!("lpr.retries.scheduled").increment(1);
                CreateOutcome::QueuedForRetry
            }
        };

        metrics::histogram!("lpr.records.saga_seconds").record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    /// Settle a redelivered detection whose record row already exists.
    ///
    /// A sent record is a plain duplicate. An unsent one lost its retry
    /// message on an earlier delivery, so a new one is enqueued from storage.
    /// Rows still missing their photos belong to a creation that has not
    /// finished or unwound yet and are left for a later redelivery.
    async fn resume_duplicate(
        &self,
        message: &RecordMessage,
        record_id: String,
    ) -> Result<CreateOutcome, IngestError> {
        let Some(stored) = self.store.get_record(&record_id).await? else {
            return Err(IngestError::Retryable(format!(
                "record {record_id} was removed while checking for duplicates"
            )));
        };
        if stored.sent {
            return Err(IngestError::Duplicate(record_id));
        }

        let rows = self.store.photos_for_record(&record_id).await?;
        if rows.len() < message.vehicle_photos.len() {
            return Err(IngestError::Retryable(format!(
                "record {record_id} is still being stored ({} of {} photos)",
                rows.len(),
                message.vehicle_photos.len()
            )));
        }

        let retry = self.retry_message_for_rows(&stored, rows).await?;
        self.retry_queue.enqueue(&retry).await?;
        metrics::counter!("lpr.retries.scheduled").increment(1);
        info!(retries = stored.retries, "Unsent duplicate, retry re-enqueued");
        Ok(CreateOutcome::QueuedForRetry)
    }

    /// Upload both images of every photo, then insert all photo rows at once.
    async fn store_photos(
        &self,
        record: &VehicleRecord,
        photos: &[PhotoMessage],
        saga: &mut Saga,
    ) -> Result<(), IngestError> {
        let bucket = self.blobs.bucket().to_string();
        let mut rows = Vec::with_capacity(photos.len());

        for photo in photos {
            let image = decode_payload(&record.record_id, &photo.photo)?;
            let crop = decode_payload(&record.record_id, &photo.crop_photo)?;
            let photo_id = Uuid::new_v4();

            let image_key = photo_key(&record.record_id, photo_id);
            self.blobs.upload(&image_key, image).await?;
            saga.record(Compensation::DeleteBlob(image_key.clone()));

            let crop_key = crop_photo_key(&record.record_id, photo_id);
            self.blobs.upload(&crop_key, crop).await?;
            saga.record(Compensation::DeleteBlob(crop_key.clone()));
            debug!(index = photo.index, url = %self.blobs.public_url(&image_key), "Photo uploaded");

            rows.push(CitizenVehiclePhoto {
                id: photo_id,
                record_id: record.record_id.clone(),
                seq_index: photo.index,
                confidence: photo.confidence,
                camera_id: photo.camera_id.clone(),
                photo_bucket: bucket.clone(),
                photo_key: image_key,
                crop_bucket: bucket.clone(),
                crop_key,
                capture_time: photo.capture_time,
            });
        }

        self.store.insert_photos(&rows).await?;
        saga.record(Compensation::DeletePhotos(rows.iter().map(|p| p.id).collect()));

        Ok(())
    }

    /// Submit to the regulator and record the acceptance.
    pub async fn submit(
        &self,
        record: &mut VehicleRecord,
        photos: &[PhotoMessage],
    ) -> Result<(), IngestError> {
        let receipt = match self.regulator.submit(record, photos).await {
            Ok(receipt) => receipt,
            Err(e) => {
                metrics::counter!("lpr.submissions.failed").increment(1);
                return Err(e.into());
            }
        };
        metrics::counter!("lpr.submissions.ok").increment(1);

        record.mark_sent(receipt);
        self.store
            .mark_sent(record)
            .await
            .map_err(|e| IngestError::Retryable(format!("submitted but not recorded: {e}")))
    }

    /// Retry message for a stored record, photo payloads re-read from blob storage
    pub async fn retry_message_from_storage(
        &self,
        record: &VehicleRecord,
    ) -> Result<RecordMessage, IngestError> {
        let rows = self.store.photos_for_record(&record.record_id).await?;
        self.retry_message_for_rows(record, rows).await
    }

    async fn retry_message_for_rows(
        &self,
        record: &VehicleRecord,
        rows: Vec<CitizenVehiclePhoto>,
    ) -> Result<RecordMessage, IngestError> {
        let mut photos = Vec::with_capacity(rows.len());

        for row in rows {
            let image = self.blobs.get(&row.photo_key).await?;
            let crop = self.blobs.get(&row.crop_key).await?;
            photos.push(PhotoMessage {
                index: row.seq_index,
                confidence: row.confidence,
                camera_id: row.camera_id,
                capture_time: row.capture_time,
                photo: STANDARD.encode(image),
                crop_photo: STANDARD.encode(crop),
            });
        }

        Ok(record.to_message(photos))
    }
}

fn decode_payload(record_id: &str, payload: &str) -> Result<Vec<u8>, IngestError> {
    STANDARD.decode(payload).map_err(|e| IngestError::Decode {
        record_id: record_id.to_string(),
        message: e.to_string(),
    })
}
