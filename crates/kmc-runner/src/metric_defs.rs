//! Metric names emitted through the `metrics` facade.
//!
//! No recorder is installed by the binary, so the calls are no-ops unless an
//! embedding application installs one.

use std::fmt;

/// Kind of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Static description of one metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub kind: MetricKind,
    pub unit: &'static str,
    pub description: &'static str,
    pub labels: &'static [&'static str],
}

pub const RUNS_DISPATCHED: MetricDef = MetricDef {
    name: "kmc.runs.dispatched",
    kind: MetricKind::Counter,
    unit: "",
    description: "Replicate runs handed to the simulator",
    labels: &["iteration"],
};

pub const RUNS_COMPLETED: MetricDef = MetricDef {
    name: "kmc.runs.completed",
    kind: MetricKind::Counter,
    unit: "",
    description: "Replicate runs that terminated normally",
    labels: &["iteration"],
};

pub const RUNS_INCOMPLETE: MetricDef = MetricDef {
    name: "kmc.runs.incomplete",
    kind: MetricKind::Counter,
    unit: "",
    description: "Replicate runs excluded from their batch",
    labels: &["iteration"],
};

pub const RUN_WALL_TIME: MetricDef = MetricDef {
    name: "kmc.run.wall_time",
    kind: MetricKind::Histogram,
    unit: "ms",
    description: "Wall-clock time of one replicate run",
    labels: &["iteration"],
};

pub const ITERATIONS: MetricDef = MetricDef {
    name: "kmc.rescaling.iterations",
    kind: MetricKind::Counter,
    unit: "",
    description: "Completed rescaling iterations",
    labels: &[],
};

pub const ALL: &[MetricDef] = &[
    RUNS_DISPATCHED,
    RUNS_COMPLETED,
    RUNS_INCOMPLETE,
    RUN_WALL_TIME,
    ITERATIONS,
];

/// Register descriptions of every metric with the installed recorder.
pub fn describe_metrics() {
    for metric in ALL {
        match metric.kind {
            MetricKind::Counter => metrics::describe_counter!(metric.name, metric.description),
            MetricKind::Histogram => metrics::describe_histogram!(metric.name, metric.description),
        }
    }
}
