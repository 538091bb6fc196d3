//! Application-level retry of failed submissions.
//!
//! Unsent records travel on the retry queue. Each delivery is either
//! deferred (not yet due), dropped (stale, gone or already sent), or
//! resubmitted with a linearly growing backoff.

use crate::broker::{BrokerError, ConnectionManager};
use crate::ingest::{IngestError, IngestionService};
use crate::model::RecordMessage;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Seconds added to the backoff per attempt
const BACKOFF_STEP_SECS: i64 = 2;

/// Destination for records awaiting resubmission
#[async_trait]
pub trait RetryQueue: Send + Sync {
    async fn enqueue(&self, message: &RecordMessage) -> Result<(), BrokerError>;
}

/// Publishes retry messages through the shared broker connection
pub struct BrokerRetryQueue {
    manager: Arc<ConnectionManager>,
    exchange: String,
    routing_key: String,
}

impl BrokerRetryQueue {
    pub fn new(manager: Arc<ConnectionManager>, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            manager,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

#[async_trait]
impl RetryQueue for BrokerRetryQueue {
    async fn enqueue(&self, message: &RecordMessage) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(message).map_err(|e| BrokerError::Publish {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            message: e.to_string(),
        })?;

        self.manager
            .publish(&self.exchange, &self.routing_key, &payload)
            .await?;

        debug!(
            record_id = %message.record_id,
            retries = message.retries,
            routing_key = %self.routing_key,
            "Retry message published"
        );
        Ok(())
    }
}

/// What a retry delivery resulted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Resubmitted and accepted
    Submitted,
    /// Resubmission failed; the message was enqueued again
    Rescheduled,
    /// Not yet due; republished unchanged
    Deferred,
    /// Created on a later day than today; dropped
    Stale,
    /// Record missing or already sent; dropped
    Skipped,
}

/// Handles deliveries from the retry queue
pub struct RetryScheduler {
    service: Arc<IngestionService>,
    defer_delay: Duration,
    offset: FixedOffset,
}

impl RetryScheduler {
    pub fn new(service: Arc<IngestionService>, defer_delay: Duration, offset: FixedOffset) -> Self {
        Self {
            service,
            defer_delay,
            offset,
        }
    }

    pub async fn retry(&self, message: RecordMessage) -> Result<RetryOutcome, IngestError> {
        self.retry_at(message, Utc::now()).await
    }

    #[instrument(skip(self, message), fields(record_id = %message.record_id, retries = message.retries))]
    pub async fn retry_at(
        &self,
        mut message: RecordMessage,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, IngestError> {
        if self.is_stale(&message, now) {
            info!("Record is from a later day, dropping retry");
            metrics::counter!("lpr.retries.expired").increment(1);
            return Ok(RetryOutcome::Stale);
        }

        if now.timestamp() < message.backoff_time {
            debug!(backoff_time = message.backoff_time, "Retry not yet due, deferring");
            tokio::time::sleep(self.defer_delay).await;
            self.service.retry_queue().enqueue(&message).await?;
            metrics::counter!("lpr.retries.deferred").increment(1);
            return Ok(RetryOutcome::Deferred);
        }

        let mut record = match self.service.store().get_record(&message.record_id).await? {
            Some(record) if record.sent => {
                debug!("Record already sent, dropping retry");
                return Ok(RetryOutcome::Skipped);
            }
            Some(record) => record,
            None => {
                warn!("Record no longer exists, dropping retry");
                return Ok(RetryOutcome::Skipped);
            }
        };

        message.retries += 1;
        message.backoff_time = next_backoff(now, message.retries);
        record.retries = message.retries;
        record.backoff_time = message.backoff_time;

        self.service
            .store()
            .update_retry_state(&record.record_id, message.retries, message.backoff_time)
            .await?;

        match self.service.submit(&mut record, &message.vehicle_photos).await {
            Ok(()) => {
                info!(retries = message.retries, "Retry submitted");
                metrics::counter!("lpr.retries.submitted").increment(1);
                Ok(RetryOutcome::Submitted)
            }
            Err(e) => {
                warn!(error = %e, backoff_time = message.backoff_time, "Retry failed, rescheduling");
                self.service.retry_queue().enqueue(&message).await?;
                metrics::counter!("lpr.retries.scheduled").increment(1);
                Ok(RetryOutcome::Rescheduled)
            }
        }
    }

    /// Day-of-month comparison in local time.
    ///
    /// Months are ignored: a record from the 31st is stale on the 1st, while
    /// one created exactly a month ago is not.
    fn is_stale(&self, message: &RecordMessage, now: DateTime<Utc>) -> bool {
        let Some(created) = message.created_at() else {
            return false;
        };
        let today = now.with_timezone(&self.offset).day();
        let created_day = created.with_timezone(&self.offset).day();
        today < created_day
    }
}

/// Earliest next attempt after `retries` attempts, unix seconds
pub fn next_backoff(now: DateTime<Utc>, retries: i32) -> i64 {
    now.timestamp() + i64::from(retries) * BACKOFF_STEP_SECS
}
