use crate::client::{ClientError, DeliveryQuery, ExamServiceClient};
use crate::config::Export as ExportConfig;
use crate::items::ItemDetailResolver;
use crate::mapper::{
    MappedRows, MappingContext, MappingError, exam_code_from_title, header_row, map_record,
};
use crate::metrics_defs::{EXPORT_DURATION, RECORDS_EXPORTED, RECORDS_SKIPPED};
use crate::pager::DeliveryPages;
use crate::sink::{Cell, Sinks};
use crate::types::{DeliveryRecord, ExportView, IntegrationInfo, RowKind};
use crate::{counter, histogram};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to write export row: {0}")]
    Sink(#[from] io::Error),
    #[error("no output stream configured for {0} rows")]
    MissingSink(RowKind),
}

#[derive(Clone, Debug)]
pub struct ExportOptions {
    pub check_secret: bool,
    pub item_concurrency: usize,
    /// Wall-clock time the run was requested. Drives the output filename.
    pub started_at: DateTime<Utc>,
}

impl ExportOptions {
    pub fn from_config(config: &ExportConfig) -> Self {
        ExportOptions {
            check_secret: config.check_secret,
            item_concurrency: config.item_concurrency,
            started_at: Utc::now(),
        }
    }
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions::from_config(&ExportConfig::default())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExportSummary {
    pub pages: u32,
    pub exported: u64,
    pub skipped: u64,
    pub last_timestamp: Option<String>,
}

/// Drives one export run for one exam.
///
/// Deliveries are read page by page in ascending `modified_at` order and
/// every record is mapped into the rows of the selected view. Records that
/// fail mapping are skipped. `last_timestamp` follows the last record that was
/// written, so it can be stored and passed back as `start` on the next run.
pub struct Exporter {
    client: ExamServiceClient,
    info: IntegrationInfo,
    view: ExportView,
    start: Option<String>,
    end: Option<String>,
    options: ExportOptions,
    exam_title: String,
    exam_code: String,
    last_timestamp: Option<String>,
}

impl Exporter {
    /// Looks up the exam title once. The exam code is the configured
    /// override, or the initials of the title.
    pub async fn new(
        client: ExamServiceClient,
        info: IntegrationInfo,
        view: ExportView,
        start: Option<String>,
        end: Option<String>,
        options: ExportOptions,
    ) -> Result<Self, ExportError> {
        let exam_title = client.exam_title(&info.exam_id, &info.token).await?;
        let exam_code = info
            .exam_code
            .clone()
            .unwrap_or_else(|| exam_code_from_title(&exam_title));

        Ok(Exporter {
            client,
            info,
            view,
            start,
            end,
            options,
            exam_title,
            exam_code,
            last_timestamp: None,
        })
    }

    pub fn exam_id(&self) -> &str {
        &self.info.exam_id
    }

    pub fn view(&self) -> ExportView {
        self.view
    }

    pub fn exam_title(&self) -> &str {
        &self.exam_title
    }

    pub fn exam_code(&self) -> &str {
        &self.exam_code
    }

    /// `modified_at` of the last record written so far.
    pub fn last_timestamp(&self) -> Option<&str> {
        self.last_timestamp.as_deref()
    }

    /// Timestamp part shared by every output name of this run.
    pub fn stamp(&self) -> String {
        self.options.started_at.format("%Y%m%d-%H%M%S").to_string()
    }

    /// Name of the output file. Single views carry their prefix.
    pub fn filename(&self) -> String {
        match self.view.single() {
            Some(kind) => self.filename_for(kind),
            None => format!("{}.csv", self.stamp()),
        }
    }

    pub fn filename_for(&self, kind: RowKind) -> String {
        format!("{}-{}.csv", kind.prefix(), self.stamp())
    }

    pub async fn generate(&mut self, sinks: &mut Sinks<'_>) -> Result<ExportSummary, ExportError> {
        let started = Instant::now();
        let result = self.run(sinks).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        histogram!(EXPORT_DURATION, "view" => self.view.name(), "status" => status)
            .record(started.elapsed().as_secs_f64());

        result
    }

    async fn run(&mut self, sinks: &mut Sinks<'_>) -> Result<ExportSummary, ExportError> {
        let kinds = self.view.row_kinds();
        if let Some(kind) = kinds.iter().find(|kind| !sinks.contains(**kind)) {
            return Err(ExportError::MissingSink(*kind));
        }
        for kind in kinds {
            write_row(sinks, *kind, &header_row(*kind))?;
        }

        let wants_items = self.view.includes(RowKind::Item);
        let query = DeliveryQuery {
            exam_id: self.info.exam_id.clone(),
            start: self.start.clone(),
            end: self.end.clone(),
            include_item_responses: wants_items,
        };
        let mut pages = DeliveryPages::new(self.client.clone(), self.info.token.clone(), query);
        let mut resolver = wants_items.then(|| {
            ItemDetailResolver::new(
                self.client.clone(),
                self.info.exam_id.clone(),
                self.info.token.clone(),
                self.options.item_concurrency,
            )
        });
        let no_items = HashMap::new();

        let mut summary = ExportSummary::default();

        while let Some(records) = pages.next_page().await? {
            summary.pages += 1;

            for raw in records {
                let delivery = match DeliveryRecord::deserialize(&raw) {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        let id = raw.get("id").and_then(Value::as_str).unwrap_or("");
                        self.skip(id, &MappingError::InvalidDelivery(e.to_string()));
                        summary.skipped += 1;
                        continue;
                    }
                };

                let item_versions = match resolver.as_mut() {
                    Some(resolver) => resolver.resolve(delivery.item_version_ids()).await?,
                    None => &no_items,
                };

                let ctx = MappingContext {
                    exam_title: &self.exam_title,
                    exam_code: &self.exam_code,
                    secret: &self.info.secret,
                    check_secret: self.options.check_secret,
                    item_versions,
                };

                match map_record(self.view, &delivery, &ctx) {
                    Ok(rows) => {
                        write_rows(sinks, rows)?;
                        self.last_timestamp = Some(delivery.modified_at);
                        summary.exported += 1;
                        counter!(RECORDS_EXPORTED).increment(1);
                    }
                    Err(e) => {
                        self.skip(&delivery.id, &e);
                        summary.skipped += 1;
                    }
                }
            }
        }

        summary.last_timestamp = self.last_timestamp.clone();

        tracing::info!(
            exam_id = %self.info.exam_id,
            view = self.view.name(),
            pages = summary.pages,
            exported = summary.exported,
            skipped = summary.skipped,
            "Export finished"
        );

        Ok(summary)
    }

    fn skip(&self, delivery_id: &str, error: &MappingError) {
        tracing::warn!(
            exam_id = %self.info.exam_id,
            delivery_id,
            reason = error.reason(),
            error = %error,
            "Skipping delivery"
        );
        counter!(RECORDS_SKIPPED, "reason" => error.reason()).increment(1);
    }
}

fn write_row(sinks: &mut Sinks<'_>, kind: RowKind, row: &[Cell]) -> Result<(), ExportError> {
    let sink = sinks.get(kind).ok_or(ExportError::MissingSink(kind))?;
    sink.write_row(row)?;
    Ok(())
}

fn write_rows(sinks: &mut Sinks<'_>, rows: MappedRows) -> Result<(), ExportError> {
    if let Some(row) = rows.candidate {
        write_row(sinks, RowKind::Candidate, &row)?;
    }
    if let Some(row) = rows.exam {
        write_row(sinks, RowKind::Exam, &row)?;
    }
    for row in rows.items {
        write_row(sinks, RowKind::Item, &row)?;
    }
    Ok(())
}
