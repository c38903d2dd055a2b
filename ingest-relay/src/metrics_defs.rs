//! Metrics definitions for the ingest relay.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RELAY_REQUESTS: MetricDef = MetricDef {
    name: "relay.requests",
    metric_type: MetricType::Counter,
    description: "Relay requests handled, tagged by response status",
};

pub const UPSTREAM_REQUEST_DURATION: MetricDef = MetricDef {
    name: "upstream.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fetch one page from the open311 API in seconds",
};

pub const RELAY_RESULT_COUNT: MetricDef = MetricDef {
    name: "relay.result_count",
    metric_type: MetricType::Histogram,
    description: "Number of records in each successfully fetched page",
};

pub const ARCHIVE_WRITES: MetricDef = MetricDef {
    name: "archive.writes",
    metric_type: MetricType::Counter,
    description: "Archive write attempts, tagged by outcome (written, skipped, failed)",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RELAY_REQUESTS,
    UPSTREAM_REQUEST_DURATION,
    RELAY_RESULT_COUNT,
    ARCHIVE_WRITES,
];
