//! Metrics definitions for the enrollment service.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Enrollment request duration in seconds. Tagged with outcome.",
};

pub const ENROLLMENT_OUTCOME: MetricDef = MetricDef {
    name: "enrollment.outcome",
    metric_type: MetricType::Counter,
    description: "Number of enrollment requests by outcome",
};

pub const LOOKUP_AMBIGUOUS: MetricDef = MetricDef {
    name: "crm.lookup.ambiguous",
    metric_type: MetricType::Counter,
    description: "Lookups that returned more than one match; the first match is used. Tagged with kind.",
};

pub const CREATION_POLL_ATTEMPTS: MetricDef = MetricDef {
    name: "creation_poll.attempts",
    metric_type: MetricType::Counter,
    description: "Lookups issued while waiting for a queued contact creation",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    ENROLLMENT_OUTCOME,
    LOOKUP_AMBIGUOUS,
    CREATION_POLL_ATTEMPTS,
];
