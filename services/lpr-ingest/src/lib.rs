//! LPR Ingest Service
//!
//! Ingests license-plate-reader detections delivered over an AMQP topic
//! exchange. Each detection is persisted in PostgreSQL, its photos are
//! uploaded to S3, and a normalized copy is forwarded to the regulator.
//! Failed submissions are retried through a TTL-bounded retry queue.
//!
//! ## Architecture
//!
//! ```text
//!  AMQP exchange                                      PostgreSQL
//! ┌──────────────┐  *.event   ┌──────────────┐       ┌──────────────┐
//! │ lpr          │───────────▶│ Primary      │──────▶│ records      │
//! │              │            │ Consumer     │       │ photos       │
//! └──────────────┘            └──────────────┘       └──────────────┘
//!        ▲                           │                      ▲
//!        │                           ▼                      │
//!        │                    ┌──────────────┐       ┌──────────────┐
//!        │                    │ Ingestion    │──────▶│ S3 photos    │
//!        │                    │ Service      │       └──────────────┘
//!        │                    └──────────────┘
//!        │                       │       │
//!        │        submit failed  │       ▼
//!        │                       │ ┌──────────────┐
//!        │  *.event.retry        │ │ Regulator    │
//!        └───────────────────────┘ │ (OAuth2)     │
//!        │                         └──────────────┘
//!        ▼                                ▲
//! ┌──────────────┐    ┌──────────────┐    │
//! │ Retry        │───▶│ Retry        │────┘
//! │ Consumer     │    │ Scheduler    │
//! └──────────────┘    └──────────────┘
//! ```

pub mod amqp;
pub mod blob;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod handlers;
pub mod health;
pub mod ingest;
pub mod model;
pub mod plate;
pub mod regulator;
pub mod retry;
pub mod saga;
pub mod store;

#[cfg(test)]
mod testing;

pub use amqp::AmqpConnector;
pub use blob::{BlobError, BlobStore, S3BlobStore};
pub use broker::{BrokerError, ConnectionManager, ConnectionState, QueueSpec};
pub use config::Config;
pub use consumer::{ConsumerSettings, HandlerError, IncomingMessage, MessageHandler, QueueConsumer};
pub use handlers::{CreateRecordHandler, RetryHandler};
pub use health::{start_api_server, AppState};
pub use ingest::{CreateOutcome, IngestError, IngestionService};
pub use model::{CitizenVehiclePhoto, PhotoMessage, RecordMessage, VehicleRecord};
pub use plate::{encode_plate, PlateError};
pub use regulator::{Regulator, RegulatorClient, RegulatorError};
pub use retry::{BrokerRetryQueue, RetryOutcome, RetryQueue, RetryScheduler};
pub use store::{PgRecordStore, RecordStore, StoreError};
