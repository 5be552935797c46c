use crate::CliCommand;
use crate::config::Config;
use exporter::config::StoreType;
use exporter::store::{
    ConfigureSettings, FilesystemStore, MemoryStore, configure, confirm, load_or_fetch,
};
use exporter::{
    CsvSink, ExamServiceClient, ExportOptions, ExportView, Exporter, IntegrationStore, Sinks,
};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uploader::api::{self, ApiState};
use uploader::config::Config as UploaderConfig;
use uploader::drop_target::connector_from_config;
use uploader::{Scheduler, UploadContext, upload_fresh_data};

pub fn store_from_config(store: &StoreType) -> Arc<dyn IntegrationStore> {
    match store {
        StoreType::Filesystem { base_dir } => Arc::new(FilesystemStore::new(base_dir)),
        StoreType::Memory => Arc::new(MemoryStore::new()),
    }
}

fn upload_context(
    config: Config,
    client: ExamServiceClient,
    store: Arc<dyn IntegrationStore>,
) -> Result<(UploadContext, UploaderConfig), Box<dyn Error>> {
    let uploader = config
        .uploader
        .ok_or("the uploader section is missing from the config")?;
    let ctx = UploadContext {
        client,
        store,
        drops: connector_from_config(&uploader.drop.r#type),
        export: config.export,
    };
    Ok((ctx, uploader))
}

pub async fn run(command: CliCommand, config: Config) -> Result<(), Box<dyn Error>> {
    let client = ExamServiceClient::new(&config.exam_service)?;
    let store = store_from_config(&config.store.r#type);

    match command {
        CliCommand::Serve => {
            let (ctx, uploader) = upload_context(config, client, store)?;
            serve(ctx, uploader).await
        }
        CliCommand::Upload { exam_id } => {
            let (ctx, _) = upload_context(config, client, store)?;
            let outcome = upload_fresh_data(&ctx, &exam_id).await?;
            println!("{outcome:?}");
            Ok(())
        }
        CliCommand::Export {
            exam_id,
            view,
            start,
            end,
            out,
        } => {
            let info = load_or_fetch(store.as_ref(), &client, &exam_id).await?;
            let mut exporter = Exporter::new(
                client,
                info,
                view,
                start,
                end,
                ExportOptions::from_config(&config.export),
            )
            .await?;
            export_to_dir(&mut exporter, &config.export.csv_format(), &out).await
        }
        CliCommand::Confirm { token } => {
            let info = confirm(store.as_ref(), &client, &token).await?;
            println!("Confirmed integration for exam {}", info.exam_id);
            Ok(())
        }
        CliCommand::Configure {
            exam_id,
            secret,
            exam_code,
            drop_host,
            drop_port,
            drop_user,
            drop_password,
            drop_path,
            last_timestamp,
        } => {
            let settings = ConfigureSettings {
                secret,
                exam_code,
                drop_host,
                drop_port,
                drop_user,
                drop_password,
                drop_path,
                last_timestamp,
            };
            let info = configure(store.as_ref(), &exam_id, settings).await?;
            let scheduled = info.drop_settings().is_some();
            println!("Updated exam {exam_id} (scheduled: {scheduled})");
            Ok(())
        }
    }
}

/// Writes one CSV file per row kind of the view into `out`. The stored
/// watermark is left untouched.
async fn export_to_dir(
    exporter: &mut Exporter,
    format: &exporter::CsvFormat,
    out: &Path,
) -> Result<(), Box<dyn Error>> {
    let view: ExportView = exporter.view();
    let mut files: Vec<_> = view
        .row_kinds()
        .iter()
        .map(|kind| (*kind, CsvSink::new(Vec::new(), *format)))
        .collect();

    let summary = {
        let mut sinks = Sinks::new();
        for (kind, sink) in files.iter_mut() {
            sinks = sinks.with(*kind, sink);
        }
        exporter.generate(&mut sinks).await?
    };

    for (kind, sink) in files {
        let path = out.join(exporter.filename_for(kind));
        tokio::fs::write(&path, sink.into_inner()?).await?;
        println!("{}", path.display());
    }
    tracing::info!(
        exported = summary.exported,
        skipped = summary.skipped,
        "Export written"
    );
    if let Some(last_timestamp) = summary.last_timestamp {
        println!("last_timestamp: {last_timestamp}");
    }
    Ok(())
}

async fn serve(ctx: UploadContext, uploader: UploaderConfig) -> Result<(), Box<dyn Error>> {
    let ctx = Arc::new(ctx);
    let scheduler = Scheduler::new(
        ctx.clone(),
        Duration::from_secs(uploader.schedule.interval_secs),
    );
    let state = ApiState {
        ctx,
        ready: scheduler.ready_flag(),
    };

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Could not listen for ctrl-c");
        }
        tracing::info!("Shutting down");
        let _ = tx.send(true);
    });

    let shutdown = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let (_, served) = tokio::join!(
        scheduler.run(shutdown(rx.clone())),
        api::serve(uploader.listener, state, shutdown(rx)),
    );
    served?;
    Ok(())
}
