//! Vehicle records, their photos, and the wire format shared by the
//! ingestion and retry queues.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Detection event as delivered on the broker.
///
/// The retry queue carries the same shape, with `Retries`/`BackoffTime`
/// advanced and photo payloads re-expanded from blob storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordMessage {
    /// Caller-supplied unique id
    pub record_id: String,
    /// Capture time, unix milliseconds
    pub capture_time: i64,
    /// Time the device stored the detection, unix milliseconds
    #[serde(default)]
    pub store_time: i64,
    /// Time the device sent the detection, unix milliseconds
    #[serde(default)]
    pub send_time: i64,
    pub plate: String,
    #[serde(default)]
    pub vehicle_class: i32,
    #[serde(default)]
    pub vehicle_type: i32,
    #[serde(default)]
    pub vehicle_color: i32,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub gps_error: f64,
    #[serde(default)]
    pub rtk_latitude: f64,
    #[serde(default)]
    pub rtk_longitude: f64,
    #[serde(default)]
    pub rtk_error: f64,
    #[serde(default)]
    pub road_id: i64,
    #[serde(default)]
    pub segment_id: i64,
    #[serde(default)]
    pub ring_id: i64,
    #[serde(default)]
    pub parking_lot_id: i64,
    #[serde(default)]
    pub retries: i32,
    /// Unix seconds before which a retry must not resubmit
    #[serde(default)]
    pub backoff_time: i64,
    /// When the record row was first persisted, unix milliseconds
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub vehicle_photos: Vec<PhotoMessage>,
}

/// One photo attached to a detection event. Payloads are base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhotoMessage {
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub camera_id: String,
    /// Capture time, unix milliseconds
    #[serde(default)]
    pub capture_time: i64,
    /// Full vehicle photo
    pub photo: String,
    /// Cropped plate photo
    pub crop_photo: String,
}

/// Row of the `vehicle_records` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct VehicleRecord {
    pub record_id: String,
    pub capture_time: i64,
    pub store_time: i64,
    pub send_time: i64,
    pub plate: String,
    /// Numeric encoding of `plate`
    pub plate_number: i64,
    pub vehicle_class: i32,
    pub vehicle_type: i32,
    pub vehicle_color: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub gps_error: f64,
    pub rtk_latitude: f64,
    pub rtk_longitude: f64,
    pub rtk_error: f64,
    pub road_id: i64,
    pub segment_id: i64,
    pub ring_id: i64,
    pub parking_lot_id: i64,
    pub sent: bool,
    pub retries: i32,
    pub backoff_time: i64,
    pub request_id: Option<String>,
    pub plate_detection_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Row of the `citizen_vehicle_photos` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CitizenVehiclePhoto {
    pub id: Uuid,
    pub record_id: String,
    pub seq_index: i32,
    pub confidence: f64,
    pub camera_id: String,
    pub photo_bucket: String,
    pub photo_key: String,
    pub crop_bucket: String,
    pub crop_key: String,
    pub capture_time: i64,
}

/// Identifiers the regulator returns for an accepted detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub request_id: String,
    pub plate_detection_id: String,
}

impl VehicleRecord {
    /// Build an unsent record row from an incoming event.
    pub fn from_message(message: &RecordMessage, plate_number: i64, now: DateTime<Utc>) -> Self {
        Self {
            record_id: message.record_id.clone(),
            capture_time: message.capture_time,
            store_time: message.store_time,
            send_time: message.send_time,
            plate: message.plate.clone(),
            plate_number,
            vehicle_class: message.vehicle_class,
            vehicle_type: message.vehicle_type,
            vehicle_color: message.vehicle_color,
            latitude: message.latitude,
            longitude: message.longitude,
            gps_error: message.gps_error,
            rtk_latitude: message.rtk_latitude,
            rtk_longitude: message.rtk_longitude,
            rtk_error: message.rtk_error,
            road_id: message.road_id,
            segment_id: message.segment_id,
            ring_id: message.ring_id,
            parking_lot_id: message.parking_lot_id,
            sent: false,
            retries: 0,
            backoff_time: 0,
            request_id: None,
            plate_detection_id: None,
            created_at: now,
        }
    }

    pub fn mark_sent(&mut self, receipt: SubmissionReceipt) {
        self.sent = true;
        self.request_id = Some(receipt.request_id);
        self.plate_detection_id = Some(receipt.plate_detection_id);
    }

    /// Rebuild the wire message for this record around the given photos.
    pub fn to_message(&self, photos: Vec<PhotoMessage>) -> RecordMessage {
        RecordMessage {
            record_id: self.record_id.clone(),
            capture_time: self.capture_time,
            store_time: self.store_time,
            send_time: self.send_time,
            plate: self.plate.clone(),
            vehicle_class: self.vehicle_class,
            vehicle_type: self.vehicle_type,
            vehicle_color: self.vehicle_color,
            latitude: self.latitude,
            longitude: self.longitude,
            gps_error: self.gps_error,
            rtk_latitude: self.rtk_latitude,
            rtk_longitude: self.rtk_longitude,
            rtk_error: self.rtk_error,
            road_id: self.road_id,
            segment_id: self.segment_id,
            ring_id: self.ring_id,
            parking_lot_id: self.parking_lot_id,
            retries: self.retries,
            backoff_time: self.backoff_time,
            created_at: self.created_at.timestamp_millis(),
            vehicle_photos: photos,
        }
    }
}

impl RecordMessage {
    /// Creation time of the persisted record, if the message carries one.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        if self.created_at <= 0 {
            return None;
        }
        Utc.timestamp_millis_opt(self.created_at).single()
    }
}

/// Blob key of the full vehicle photo
pub fn photo_key(record_id: &str, photo_id: Uuid) -> String {
    format!("record_id_{record_id}_photo_id_{photo_id}")
}

/// Blob key of the cropped plate photo
pub fn crop_photo_key(record_id: &str, photo_id: Uuid) -> String {
    format!("record_id_{record_id}_crop_photo_id_{photo_id}")
}
