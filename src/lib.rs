//! # warehouse-etl
//!
//! Schema-driven batch ETL jobs that pull records from a document store, a relational database
//! (PostgreSQL or MySQL) or a REST API and load them into an analytical warehouse (PostgreSQL or
//! DuckDB/MotherDuck).
//!
//! ## Features
//!
//! - **Normalization**: nested, irregular source records are coerced against a declared schema;
//!   bad field values become nulls instead of failing the batch
//! - **Paginated extraction**: byte-budgeted pages for collections, offset pages for tables
//! - **Staging**: each normalized page is written to an NDJSON file and removed once loaded
//! - **Idempotent loads**: `merge` upserts on the primary key, `replace` truncates then inserts
//! - **Transformations**: merge/replace set operations inside the warehouse
//! - **Metrics**: counters mirrored into the `metrics` facade
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use warehouse_etl::{EtlConfig, JobCommand, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EtlConfig::from_file("warehouse-etl.toml")?;
//!     let pipeline = Pipeline::new(config);
//!
//!     let report = pipeline
//!         .run(&JobCommand::Relational { job_name: "customers".into() })
//!         .await;
//!
//!     println!("{} rows loaded", report.metrics.records_loaded);
//!     Ok(())
//! }
//! ```
//!
//! ## Normalizing records
//!
//! ```rust
//! use warehouse_etl::{Normalizer, TableSchema};
//! use serde_json::json;
//!
//! let schema = TableSchema::from_json(
//!     r#"[{"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
//!         {"name": "tags", "type": "STRING", "mode": "REPEATED"}]"#,
//! )
//! .unwrap();
//!
//! let batch = Normalizer::new(&schema)
//!     .normalize_data(&[json!({"id": "7", "tags": ["a", "", null, "b"]})])
//!     .unwrap();
//! assert_eq!(batch.records[0].to_json(), json!({"id": 7, "tags": ["a", "b"]}));
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod error;
pub mod extract;
pub mod metrics;
#[cfg(feature = "mongodb")]
#[cfg_attr(docsrs, doc(cfg(feature = "mongodb")))]
pub mod mongo;
pub mod motherduck;
#[cfg(feature = "mysql")]
#[cfg_attr(docsrs, doc(cfg(feature = "mysql")))]
pub mod mysql;
pub mod normalize;
pub mod pipeline;
pub mod postgres;
pub mod registry;
pub mod schema;
pub mod sql;
pub mod staging;
pub mod sync;
pub mod transform;

// Re-exports for convenience
pub use config::{EtlConfig, EtlConfigBuilder, JobMetadata, MetadataProvider, TransformationConfig};
pub use error::{BatchError, Error, FieldError, Result};
pub use motherduck::MotherDuckClient;
pub use normalize::{NormalizedBatch, NormalizedRecord, Normalizer};
pub use pipeline::{JobCommand, JobPhase, JobProgress, JobReport, JobStatus, Pipeline, TimeWindow};
pub use postgres::PostgresClient;
pub use registry::{ScalarType, Value};
pub use schema::{FieldSchema, FieldType, Mode, TableSchema};
pub use sync::{LoadType, SyncEngine, Warehouse, WarehouseClient};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
