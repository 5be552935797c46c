use clap::{Parser, Subcommand};
use config::{Config, LoggingConfig, MetricsConfig};
use exporter::ExportView;
use exporter::metrics_defs::MetricType;
use metrics_exporter_statsd::StatsdBuilder;
use std::error::Error;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod config;

#[derive(Parser)]
#[command(version, about = "Incremental exam delivery exports")]
struct Cli {
    #[arg(long, short, default_value = "examsync.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
pub enum CliCommand {
    /// Run the upload scheduler and the HTTP API until interrupted.
    Serve,
    /// Upload fresh data for one exam now.
    Upload { exam_id: String },
    /// Write an export to local CSV files.
    Export {
        exam_id: String,
        #[arg(long, default_value = "all")]
        view: ExportView,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Complete an integration handshake.
    Confirm { token: String },
    /// Change the settings stored for an exam. An empty value clears a field.
    Configure {
        exam_id: String,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        exam_code: Option<String>,
        #[arg(long)]
        drop_host: Option<String>,
        #[arg(long)]
        drop_port: Option<u16>,
        #[arg(long)]
        drop_user: Option<String>,
        #[arg(long)]
        drop_password: Option<String>,
        #[arg(long)]
        drop_path: Option<String>,
        #[arg(long)]
        last_timestamp: Option<String>,
    },
}

fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics_config: Option<&MetricsConfig>) -> Result<(), Box<dyn Error>> {
    let Some(metrics_config) = metrics_config else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(metrics_config.statsd_host.clone(), metrics_config.statsd_port)
        .build(Some("examsync"))?;
    metrics::set_global_recorder(recorder).map_err(|_| "metrics recorder already installed")?;

    let all_metrics = exporter::metrics_defs::ALL_METRICS
        .iter()
        .chain(uploader::metrics_defs::ALL_METRICS);
    for def in all_metrics {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;
    let _sentry = init_logging(config.common.logging.as_ref());
    init_metrics(config.common.metrics.as_ref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(commands::run(cli.command, config))
}
