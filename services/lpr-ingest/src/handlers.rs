//! Queue handlers wiring deliveries to the ingestion service.

use crate::consumer::{HandlerError, IncomingMessage, MessageHandler};
use crate::ingest::{IngestError, IngestionService};
use crate::model::RecordMessage;
use crate::retry::RetryScheduler;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decode a record message; `None` means the payload can never be processed
fn decode(message: &IncomingMessage) -> Option<RecordMessage> {
    match message.decode_json::<RecordMessage>() {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(
                queue = %message.queue,
                routing_key = %message.routing_key,
                error = %e,
                "Malformed record payload, dropping"
            );
            metrics::counter!("lpr.messages.malformed", "queue" => message.queue.clone()).increment(1);
            None
        }
    }
}

/// Permanent failures are acked; anything else is requeued
fn settle(error: IngestError) -> Result<(), HandlerError> {
    match error {
        IngestError::Duplicate(record_id) => {
            info!(record_id = %record_id, "Record already ingested");
            Ok(())
        }
        e if e.is_permanent() => {
            warn!(error = %e, "Dropping unprocessable record");
            Ok(())
        }
        e => Err(HandlerError::Processing(e.to_string())),
    }
}

/// Handles detection events on the primary queue
pub struct CreateRecordHandler {
    service: Arc<IngestionService>,
}

impl CreateRecordHandler {
    pub fn new(service: Arc<IngestionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for CreateRecordHandler {
    async fn handle(&self, message: IncomingMessage) -> Result<(), HandlerError> {
        let Some(record) = decode(&message) else {
            return Ok(());
        };

        // detached so a handler timeout cannot stop the saga between steps
        let service = self.service.clone();
        let result = tokio::spawn(async move { service.create_record(record).await })
            .await
            .map_err(|e| HandlerError::Processing(format!("record task failed: {e}")))?;

        match result {
            Ok(outcome) => {
                debug!(outcome = ?outcome, "Record handled");
                Ok(())
            }
            Err(e) => settle(e),
        }
    }
}

/// Handles messages on the retry queue
pub struct RetryHandler {
    scheduler: Arc<RetryScheduler>,
}

impl RetryHandler {
    pub fn new(scheduler: Arc<RetryScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl MessageHandler for RetryHandler {
    async fn handle(&self, message: IncomingMessage) -> Result<(), HandlerError> {
        let Some(record) = decode(&message) else {
            return Ok(());
        };

        match self.scheduler.retry(record).await {
            Ok(outcome) => {
                debug!(outcome = ?outcome, "Retry handled");
                Ok(())
            }
            Err(e) => settle(e),
        }
    }
}
