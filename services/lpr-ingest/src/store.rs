use crate::config::DatabaseConfig;
use crate::model::{CitizenVehiclePhoto, VehicleRecord};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const RECORD_COLUMNS: &str = r#"
    record_id, capture_time, store_time, send_time, plate, plate_number,
    vehicle_class, vehicle_type, vehicle_color,
    latitude, longitude, gps_error, rtk_latitude, rtk_longitude, rtk_error,
    road_id, segment_id, ring_id, parking_lot_id,
    sent, retries, backoff_time, request_id, plate_detection_id, created_at
"#;

const PHOTO_COLUMNS: &str = r#"
    id, record_id, seq_index, confidence, camera_id,
    photo_bucket, photo_key, crop_bucket, crop_key, capture_time
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    Duplicate(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Relational persistence used by the ingestion saga and the retry path
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record; an existing `record_id` yields `StoreError::Duplicate`
    async fn insert_record(&self, record: &VehicleRecord) -> Result<(), StoreError>;

    async fn get_record(&self, record_id: &str) -> Result<Option<VehicleRecord>, StoreError>;

    /// Persist `sent` and the regulator's identifiers
    async fn mark_sent(&self, record: &VehicleRecord) -> Result<(), StoreError>;

    /// Persist the retry counter and next allowed attempt
    async fn update_retry_state(
        &self,
        record_id: &str,
        retries: i32,
        backoff_time: i64,
    ) -> Result<(), StoreError>;

    /// Hard delete; used only as compensation
    async fn delete_record(&self, record_id: &str) -> Result<(), StoreError>;

    /// Insert all photos in one statement
    async fn insert_photos(&self, photos: &[CitizenVehiclePhoto]) -> Result<(), StoreError>;

    async fn delete_photos(&self, ids: &[Uuid]) -> Result<(), StoreError>;

    async fn photos_for_record(&self, record_id: &str) -> Result<Vec<CitizenVehiclePhoto>, StoreError>;

    /// Cheap connectivity probe
    async fn ping(&self) -> Result<(), StoreError>;
}

/// PostgreSQL-backed record store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!(max_connections = config.max_connections, "Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(record_id = %record.record_id))]
    async fn insert_record(&self, record: &VehicleRecord) -> Result<(), StoreError> {
        // the unique key on record_id is the only duplicate guard
        let result = sqlx::query(
            r#"
            INSERT INTO vehicle_records (
                record_id, capture_time, store_time, send_time, plate, plate_number,
                vehicle_class, vehicle_type, vehicle_color,
                latitude, longitude, gps_error, rtk_latitude, rtk_longitude, rtk_error,
                road_id, segment_id, ring_id, parking_lot_id,
                sent, retries, backoff_time, request_id, plate_detection_id, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9,
                $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19,
                $20, $21, $22, $23, $24, $25
            )
            ON CONFLICT (record_id) DO NOTHING
            "#,
        )
        .bind(&record.record_id)
        .bind(record.capture_time)
        .bind(record.store_time)
        .bind(record.send_time)
        .bind(&record.plate)
        .bind(record.plate_number)
        .bind(record.vehicle_class)
        .bind(record.vehicle_type)
        .bind(record.vehicle_color)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.gps_error)
        .bind(record.rtk_latitude)
        .bind(record.rtk_longitude)
        .bind(record.rtk_error)
        .bind(record.road_id)
        .bind(record.segment_id)
        .bind(record.ring_id)
        .bind(record.parking_lot_id)
        .bind(record.sent)
        .bind(record.retries)
        .bind(record.backoff_time)
        .bind(&record.request_id)
        .bind(&record.plate_detection_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(record.record_id.clone()));
        }

        debug!("Record inserted");
        Ok(())
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<VehicleRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM vehicle_records WHERE record_id = $1 AND deleted = FALSE"
        );
        let record = sqlx::query_as::<_, VehicleRecord>(&sql)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    #[instrument(skip(self, record), fields(record_id = %record.record_id))]
    async fn mark_sent(&self, record: &VehicleRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE vehicle_records
            SET sent = $2, request_id = $3, plate_detection_id = $4, updated_at = NOW()
            WHERE record_id = $1
            "#,
        )
        .bind(&record.record_id)
        .bind(record.sent)
        .bind(&record.request_id)
        .bind(&record.plate_detection_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.record_id.clone()));
        }
        Ok(())
    }

    async fn update_retry_state(
        &self,
        record_id: &str,
        retries: i32,
        backoff_time: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE vehicle_records
            SET retries = $2, backoff_time = $3, updated_at = NOW()
            WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .bind(retries)
        .bind(backoff_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_record(&self, record_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM vehicle_records WHERE record_id = $1")
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, photos), fields(count = photos.len()))]
    async fn insert_photos(&self, photos: &[CitizenVehiclePhoto]) -> Result<(), StoreError> {
        if photos.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO citizen_vehicle_photos ({PHOTO_COLUMNS}) "
        ));
        builder.push_values(photos, |mut row, photo| {
            row.push_bind(photo.id)
                .push_bind(&photo.record_id)
                .push_bind(photo.seq_index)
                .push_bind(photo.confidence)
                .push_bind(&photo.camera_id)
                .push_bind(&photo.photo_bucket)
                .push_bind(&photo.photo_key)
                .push_bind(&photo.crop_bucket)
                .push_bind(&photo.crop_key)
                .push_bind(photo.capture_time);
        });

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_photos(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query("DELETE FROM citizen_vehicle_photos WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn photos_for_record(&self, record_id: &str) -> Result<Vec<CitizenVehiclePhoto>, StoreError> {
        let sql = format!(
            "SELECT {PHOTO_COLUMNS} FROM citizen_vehicle_photos \
             WHERE record_id = $1 AND deleted = FALSE ORDER BY seq_index"
        );
        let photos = sqlx::query_as::<_, CitizenVehiclePhoto>(&sql)
            .bind(record_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(photos)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
