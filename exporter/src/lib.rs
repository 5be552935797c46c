//! Incremental CSV export of completed exam deliveries.

pub mod client;
pub mod config;
pub mod exporter;
pub mod items;
pub mod mapper;
pub mod metrics_defs;
pub mod pager;
pub mod sink;
pub mod store;
pub mod types;

pub use client::{ClientError, ExamServiceClient};
pub use exporter::{ExportError, ExportOptions, ExportSummary, Exporter};
pub use sink::{CsvFormat, CsvSink, RowSink, Sinks};
pub use store::{IntegrationStore, StoreError};
pub use types::{ExportView, IntegrationInfo, RowKind};
