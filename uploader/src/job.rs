use crate::archive::{ArchiveError, zip_bytes};
use crate::drop_target::{DropConnector, DropError};
use crate::metrics_defs::{UPLOAD_DURATION, UPLOAD_JOBS};
use exporter::config::Export as ExportConfig;
use exporter::store::{IntegrationStore, StoreError, load_or_fetch};
use exporter::{
    CsvSink, ExamServiceClient, ExportError, ExportOptions, ExportView, Exporter, RowKind, Sinks,
    counter, histogram,
};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("could not build archive: {0}")]
    Archive(#[from] ArchiveError),
    #[error("could not deliver archive: {0}")]
    Drop(#[from] DropError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("archive task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Everything an upload job needs. Shared by every tenant's job.
pub struct UploadContext {
    pub client: ExamServiceClient,
    pub store: Arc<dyn IntegrationStore>,
    pub drops: Arc<dyn DropConnector>,
    pub export: ExportConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Uploaded {
        archive: String,
        exported: u64,
        last_timestamp: Option<String>,
    },
    NoDropConfigured,
    /// The drop could not be opened. The watermark is left alone so the
    /// next run picks up the same deliveries.
    DropUnreachable,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UploadReport {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Exports everything modified since the stored watermark, zips the
/// candidate, exam and item streams, and delivers the archive to the exam's
/// drop. The new watermark is stored only once delivery has succeeded.
pub async fn upload_fresh_data(
    ctx: &UploadContext,
    exam_id: &str,
) -> Result<JobOutcome, UploadError> {
    let started = Instant::now();
    let result = run_job(ctx, exam_id).await;

    let outcome = match &result {
        Ok(JobOutcome::Uploaded { .. }) => "uploaded",
        Ok(_) => "skipped",
        Err(_) => "failed",
    };
    counter!(UPLOAD_JOBS, "outcome" => outcome).increment(1);
    histogram!(UPLOAD_DURATION).record(started.elapsed().as_secs_f64());

    result
}

async fn run_job(ctx: &UploadContext, exam_id: &str) -> Result<JobOutcome, UploadError> {
    let info = load_or_fetch(ctx.store.as_ref(), &ctx.client, exam_id).await?;

    let Some(settings) = info.drop_settings() else {
        tracing::debug!(exam_id, "No drop configured");
        return Ok(JobOutcome::NoDropConfigured);
    };

    let target = match ctx.drops.connect(&settings).await {
        Ok(target) => target,
        Err(e) => {
            tracing::warn!(exam_id, host = %settings.host, error = %e, "Skipping upload");
            return Ok(JobOutcome::DropUnreachable);
        }
    };

    let options = ExportOptions::from_config(&ctx.export);
    let end = options.started_at.format("%Y-%m-%dT%H:%M:%S").to_string();
    let mut exporter = Exporter::new(
        ctx.client.clone(),
        info.clone(),
        ExportView::Combined,
        info.last_timestamp.clone(),
        Some(end),
        options,
    )
    .await?;

    let format = ctx.export.csv_format();
    let mut cand = CsvSink::new(Vec::new(), format);
    let mut exam = CsvSink::new(Vec::new(), format);
    let mut item = CsvSink::new(Vec::new(), format);

    let summary = {
        let mut sinks = Sinks::new()
            .with(RowKind::Candidate, &mut cand)
            .with(RowKind::Exam, &mut exam)
            .with(RowKind::Item, &mut item);
        exporter.generate(&mut sinks).await?
    };
    let entries = vec![
        (exporter.filename_for(RowKind::Candidate), cand.into_inner()?),
        (exporter.filename_for(RowKind::Exam), exam.into_inner()?),
        (exporter.filename_for(RowKind::Item), item.into_inner()?),
    ];

    let archive = format!("{exam_id}-{}.zip", exporter.stamp());
    let bytes = tokio::task::spawn_blocking(move || zip_bytes(&entries)).await??;
    let dir = tokio::task::spawn_blocking(tempfile::tempdir).await??;
    let zip_path = dir.path().join(&archive);
    tokio::fs::write(&zip_path, bytes).await?;

    target
        .deliver(&zip_path, &format!("{}{}", settings.path, archive))
        .await?;

    if let Some(last_timestamp) = &summary.last_timestamp {
        // Re-read so that settings changed during the run are not clobbered.
        let mut latest = ctx.store.get(exam_id).await?.unwrap_or(info);
        latest.last_timestamp = Some(last_timestamp.clone());
        ctx.store.put(exam_id, &latest).await?;
    }

    tracing::info!(
        exam_id,
        archive = %archive,
        exported = summary.exported,
        skipped = summary.skipped,
        "Uploaded export"
    );

    Ok(JobOutcome::Uploaded {
        archive,
        exported: summary.exported,
        last_timestamp: summary.last_timestamp,
    })
}

/// Runs one upload job per scheduled exam, all concurrently. A failing job
/// is logged and does not affect the others.
pub async fn upload_all(ctx: Arc<UploadContext>) -> Result<UploadReport, UploadError> {
    let exam_ids = ctx.store.scheduled().await?;
    let mut join_set = JoinSet::new();

    for exam_id in exam_ids {
        let ctx = ctx.clone();
        join_set.spawn(async move {
            let result = upload_fresh_data(&ctx, &exam_id).await;
            (exam_id, result)
        });
    }

    let mut report = UploadReport::default();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((_, Ok(JobOutcome::Uploaded { .. }))) => report.uploaded += 1,
            Ok((_, Ok(_))) => report.skipped += 1,
            Ok((exam_id, Err(e))) => {
                tracing::error!(exam_id = %exam_id, error = %e, "Upload failed");
                report.failed += 1;
            }
            Err(e) => {
                tracing::error!("Upload task panicked: {}", e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
