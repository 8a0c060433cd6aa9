use serde::{Deserialize, Serialize};

/// Event type tag for application start.
pub const TAG_APPLICATION_START: &str = "SparkListenerApplicationStart";
/// Event type tag for application end.
pub const TAG_APPLICATION_END: &str = "SparkListenerApplicationEnd";
/// Event type tag for job start.
pub const TAG_JOB_START: &str = "SparkListenerJobStart";
/// Event type tag for block updates (filtered before enqueue).
pub const TAG_BLOCK_UPDATED: &str = "SparkListenerBlockUpdated";
/// Event type tag for executor metrics updates (filtered before enqueue).
pub const TAG_EXECUTOR_METRICS_UPDATE: &str = "SparkListenerExecutorMetricsUpdate";

/// A history event published by the host application's listener bus.
///
/// Only the lifecycle and job variants carry fields the relay inspects;
/// everything else is forwarded opaquely via `Other`. `BlockUpdated` and
/// `ExecutorMetricsUpdate` are recognized solely so the intake policy can
/// drop them before they reach the pending buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SparkEvent {
    ApplicationStart {
        app_id: Option<String>,
        attempt_id: Option<String>,
        app_name: String,
        spark_user: String,
        time: i64,
    },
    ApplicationEnd {
        time: i64,
    },
    JobStart {
        job_id: i64,
        #[serde(default)]
        group_id: Option<String>,
        time: i64,
    },
    BlockUpdated,
    ExecutorMetricsUpdate,
    Other {
        kind: String,
        #[serde(default)]
        payload: serde_json::Value,
        time: i64,
    },
}

impl SparkEvent {
    /// Stable string tag identifying the event class on the wire.
    pub fn type_tag(&self) -> &str {
        match self {
            Self::ApplicationStart { .. } => TAG_APPLICATION_START,
            Self::ApplicationEnd { .. } => TAG_APPLICATION_END,
            Self::JobStart { .. } => TAG_JOB_START,
            Self::BlockUpdated => TAG_BLOCK_UPDATED,
            Self::ExecutorMetricsUpdate => TAG_EXECUTOR_METRICS_UPDATE,
            Self::Other { kind, .. } => kind,
        }
    }

    /// True for the application start/end events that are privileged with
    /// respect to backpressure and flush triggering.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::ApplicationStart { .. } | Self::ApplicationEnd { .. }
        )
    }

    /// True for event classes that are dropped by policy before enqueue.
    pub fn is_filtered(&self) -> bool {
        matches!(self, Self::BlockUpdated | Self::ExecutorMetricsUpdate)
    }

    /// The timestamp the event carries, if its class has one.
    pub fn event_time(&self) -> Option<i64> {
        match self {
            Self::ApplicationStart { time, .. }
            | Self::ApplicationEnd { time }
            | Self::JobStart { time, .. }
            | Self::Other { time, .. } => Some(*time),
            Self::BlockUpdated | Self::ExecutorMetricsUpdate => None,
        }
    }
}
