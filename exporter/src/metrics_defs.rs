//! Metrics definitions for the exporter.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

#[macro_export]
macro_rules! counter {
    ($def:expr $(, $key:expr => $value:expr)* $(,)?) => {
        ::metrics::counter!($def.name $(, $key => $value)*)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr $(, $key:expr => $value:expr)* $(,)?) => {
        ::metrics::histogram!($def.name $(, $key => $value)*)
    };
}

pub const PAGES_FETCHED: MetricDef = MetricDef {
    name: "export.pages_fetched",
    metric_type: MetricType::Counter,
    description: "Delivery listing pages fetched from the exam service",
};

pub const RECORDS_EXPORTED: MetricDef = MetricDef {
    name: "export.records.exported",
    metric_type: MetricType::Counter,
    description: "Deliveries mapped and written to the output streams",
};

pub const RECORDS_SKIPPED: MetricDef = MetricDef {
    name: "export.records.skipped",
    metric_type: MetricType::Counter,
    description: "Deliveries excluded from output. Tagged with reason.",
};

pub const ITEM_VERSIONS_FETCHED: MetricDef = MetricDef {
    name: "export.item_versions.fetched",
    metric_type: MetricType::Counter,
    description: "Item version lookups issued against the exam service",
};

pub const EXPORT_DURATION: MetricDef = MetricDef {
    name: "export.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete an export run in seconds. Tagged with view, status.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    PAGES_FETCHED,
    RECORDS_EXPORTED,
    RECORDS_SKIPPED,
    ITEM_VERSIONS_FETCHED,
    EXPORT_DURATION,
];
