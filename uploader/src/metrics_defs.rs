//! Metrics definitions for scheduled uploads.

use exporter::metrics_defs::{MetricDef, MetricType};

pub const UPLOAD_JOBS: MetricDef = MetricDef {
    name: "upload.jobs",
    metric_type: MetricType::Counter,
    description: "Upload jobs run. Tagged with outcome: uploaded, skipped, failed.",
};

pub const UPLOAD_DURATION: MetricDef = MetricDef {
    name: "upload.duration",
    metric_type: MetricType::Histogram,
    description: "Time to export, archive and deliver one exam in seconds",
};

pub const SCHEDULER_TICKS: MetricDef = MetricDef {
    name: "upload.scheduler.ticks",
    metric_type: MetricType::Counter,
    description: "Scheduler passes over all enrolled exams",
};

pub const API_EXPORTS: MetricDef = MetricDef {
    name: "api.exports",
    metric_type: MetricType::Counter,
    description: "Exports served over HTTP. Tagged with view, status.",
};

pub const ALL_METRICS: &[MetricDef] = &[UPLOAD_JOBS, UPLOAD_DURATION, SCHEDULER_TICKS, API_EXPORTS];
