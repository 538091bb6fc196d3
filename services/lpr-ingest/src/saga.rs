//! Compensation log for record creation.
//!
//! Relational rows and blobs live in independent systems, so a failed
//! creation is undone by replaying the recorded steps in reverse.

use crate::blob::BlobStore;
use crate::store::RecordStore;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One undoable step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    DeleteRecord(String),
    DeletePhotos(Vec<Uuid>),
    DeleteBlob(String),
}

/// Undo actions accumulated by a single saga invocation
#[derive(Debug, Default)]
pub struct Saga {
    steps: Vec<Compensation>,
}

/// Outcome of a compensation run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub undone: usize,
    pub failed: Vec<String>,
}

impl Saga {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[Compensation] {
        &self.steps
    }

    /// Run every undo step, most recent first.
    ///
    /// A failing step is logged and skipped so later steps still run.
    pub async fn compensate(self, store: &dyn RecordStore, blobs: &dyn BlobStore) -> CompensationReport {
        let mut report = CompensationReport::default();

        for step in self.steps.into_iter().rev() {
            let result = match &step {
                Compensation::DeletePhotos(ids) => store
                    .delete_photos(ids)
                    .await
                    .map_err(|e| e.to_string()),
                Compensation::DeleteBlob(key) => blobs.delete(key).await.map_err(|e| e.to_string()),
                Compensation::DeleteRecord(record_id) => store
                    .delete_record(record_id)
                    .await
                    .map_err(|e| e.to_string()),
            };

            match result {
                Ok(()) => {
                    debug!(step = ?step, "Compensation step applied");
                    report.undone += 1;
                }
                Err(e) => {
                    error!(step = ?step, error = %e, "Compensation step failed");
                    report.failed.push(e);
                }
            }
        }

        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "Compensation left residue behind");
        }
        metrics::counter!("lpr.saga.compensations").increment(1);

        report
    }
}
