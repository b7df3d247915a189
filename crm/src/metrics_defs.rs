//! Metrics definitions for the CRM client.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CRM_REQUEST_DURATION: MetricDef = MetricDef {
    name: "crm.request.duration",
    metric_type: MetricType::Histogram,
    description: "Duration of CRM API calls in seconds. Tagged with operation, status.",
};

pub const ALL_METRICS: &[MetricDef] = &[CRM_REQUEST_DURATION];
