//! Client for the external regulator API.
//!
//! Authenticates with an OAuth2 client-credentials grant and caches the
//! bearer token until it is close to expiry.

use crate::config::RegulatorConfig;
use crate::model::{PhotoMessage, SubmissionReceipt, VehicleRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, SecondsFormat, TimeZone, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum RegulatorError {
    #[error("regulator request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    Token { status: StatusCode, body: String },

    #[error("submission rejected with {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("timestamp {0}ms is out of range")]
    Timestamp(i64),
}

/// Submits detections to the regulator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Regulator: Send + Sync {
    async fn submit(
        &self,
        record: &VehicleRecord,
        photos: &[PhotoMessage],
    ) -> Result<SubmissionReceipt, RegulatorError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>, margin: ChronoDuration) -> bool {
        self.expires_at - now > margin
    }
}

/// Request body of the submission endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRequest {
    pub plate_detection: PlateDetectionDto,
    pub vehicle_photos: Vec<VehiclePhotoDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlateDetectionDto {
    pub record_id: String,
    pub plate: String,
    pub plate_number: i64,
    pub capture_time: String,
    pub store_time: String,
    pub send_time: String,
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
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePhotoDto {
    pub index: i32,
    pub confidence: f64,
    pub camera_id: String,
    pub capture_time: String,
    pub photo: String,
    pub plate_photo: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionResponse {
    #[serde(deserialize_with = "id_string")]
    request_id: String,
    #[serde(deserialize_with = "id_string")]
    plate_detection_id: String,
}

/// Accept ids encoded either as JSON strings or numbers
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Format unix milliseconds in the regulator's local time.
pub fn local_timestamp(millis: i64, offset: &FixedOffset) -> Result<String, RegulatorError> {
    offset
        .timestamp_millis_opt(millis)
        .single()
        .map(|local| local.to_rfc3339_opts(SecondsFormat::Millis, false))
        .ok_or(RegulatorError::Timestamp(millis))
}

impl SubmissionRequest {
    pub fn build(
        record: &VehicleRecord,
        photos: &[PhotoMessage],
        offset: &FixedOffset,
    ) -> Result<Self, RegulatorError> {
        let vehicle_photos = photos
            .iter()
            .map(|photo| {
                Ok(VehiclePhotoDto {
                    index: photo.index,
                    confidence: photo.confidence,
                    camera_id: photo.camera_id.clone(),
                    capture_time: local_timestamp(photo.capture_time, offset)?,
                    photo: photo.photo.clone(),
                    plate_photo: photo.crop_photo.clone(),
                })
            })
            .collect::<Result<Vec<_>, RegulatorError>>()?;

        Ok(Self {
            plate_detection: PlateDetectionDto {
                record_id: record.record_id.clone(),
                plate: record.plate.clone(),
                plate_number: record.plate_number,
                capture_time: local_timestamp(record.capture_time, offset)?,
                store_time: local_timestamp(record.store_time, offset)?,
                send_time: local_timestamp(record.send_time, offset)?,
                vehicle_class: record.vehicle_class,
                vehicle_type: record.vehicle_type,
                vehicle_color: record.vehicle_color,
                latitude: record.latitude,
                longitude: record.longitude,
                gps_error: record.gps_error,
                rtk_latitude: record.rtk_latitude,
                rtk_longitude: record.rtk_longitude,
                rtk_error: record.rtk_error,
                road_id: record.road_id,
                segment_id: record.segment_id,
                ring_id: record.ring_id,
                parking_lot_id: record.parking_lot_id,
            },
            vehicle_photos,
        })
    }
}

/// HTTP client for the regulator API
pub struct RegulatorClient {
    http: reqwest::Client,
    config: RegulatorConfig,
    offset: FixedOffset,
    token: Mutex<Option<AccessToken>>,
}

impl RegulatorClient {
    pub fn new(config: RegulatorConfig) -> Result<Self, RegulatorError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;
        let offset = config.local_offset();

        Ok(Self {
            http,
            config,
            offset,
            token: Mutex::new(None),
        })
    }

    /// Cached bearer token, refreshed when close to expiry.
    ///
    /// The lock is held across the refresh so concurrent callers wait for a
    /// single token request.
    async fn access_token(&self) -> Result<String, RegulatorError> {
        let mut cached = self.token.lock().await;
        let margin = ChronoDuration::seconds(self.config.token_refresh_margin_secs);

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now(), margin) {
                return Ok(token.value.clone());
            }
        }

        let token = self.fetch_token().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    #[instrument(skip(self))]
    async fn fetch_token(&self) -> Result<AccessToken, RegulatorError> {
        let requested_at = Utc::now();
        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegulatorError::Token { status, body });
        }

        let token: TokenResponse = response.json().await?;
        info!(expires_in = token.expires_in, "Obtained regulator access token");

        Ok(AccessToken {
            value: token.access_token,
            expires_at: requested_at + ChronoDuration::seconds(token.expires_in),
        })
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }
}

#[async_trait]
impl Regulator for RegulatorClient {
    #[instrument(skip(self, record, photos), fields(record_id = %record.record_id, photos = photos.len()))]
    async fn submit(
        &self,
        record: &VehicleRecord,
        photos: &[PhotoMessage],
    ) -> Result<SubmissionReceipt, RegulatorError> {
        let request = SubmissionRequest::build(record, photos, &self.offset)?;
        let token = self.access_token().await?;

        let response = self
            .http
            .post(&self.config.submit_url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            if status == StatusCode::UNAUTHORIZED {
                self.invalidate_token().await;
            }
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Regulator rejected submission");
            return Err(RegulatorError::Status { status, body });
        }

        let body: SubmissionResponse = response.json().await?;
        debug!(request_id = %body.request_id, "Submission accepted");

        Ok(SubmissionReceipt {
            request_id: body.request_id,
            plate_detection_id: body.plate_detection_id,
        })
    }
}
