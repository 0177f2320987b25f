mod bus;

pub use bus::{EventBus, Subscription, Topic};

use chrono::{DateTime, Utc};

use crate::process::state::ProcessState;

/// The discriminated event record from the data model. Fire-and-forget:
/// subscribers must tolerate drop under backlog pressure (§4.4).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "modelStatus")]
    ProcessStateChange {
        model_id: String,
        from: ProcessState,
        to: ProcessState,
        at: DateTime<Utc>,
    },
    #[serde(rename = "metrics")]
    TokenMetrics {
        model_id: String,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    #[serde(rename = "configChanged")]
    ConfigChanged { at: DateTime<Utc> },
    #[serde(rename = "logData")]
    LogData { source: LogSource, chunk: String },
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Proxy,
    Upstream,
}

impl Event {
    /// Which topic a publisher routes this event to. State changes and logs
    /// are high-volume and per-model; metrics and config changes are
    /// system-wide, matching how the teacher's event channels are split by
    /// concern rather than multiplexed onto one queue.
    pub fn topic(&self) -> Topic {
        match self {
            Event::ProcessStateChange { .. } => Topic::ModelStatus,
            Event::TokenMetrics { .. } => Topic::Metrics,
            Event::ConfigChanged { .. } => Topic::Config,
            Event::LogData { .. } => Topic::Logs,
        }
    }
}

