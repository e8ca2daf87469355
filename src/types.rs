use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of the monitored subject (patient) a stream belongs to
pub type SubjectId = i64;

/// Upper bound on channels per reading (widest classifier input)
pub const MAX_CHANNELS: usize = 20;

/// One decoded telemetry sample
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub subject_id: SubjectId,
    pub timestamp: DateTime<Utc>,
    pub channels: Vec<f64>,
}

impl Reading {
    pub fn new(subject_id: SubjectId, timestamp: DateTime<Utc>, channels: Vec<f64>) -> Self {
        Self {
            subject_id,
            timestamp,
            channels,
        }
    }

    /// Wire representation sent to live viewers
    pub fn to_message(&self) -> ReadingMessage {
        ReadingMessage {
            patient_id: self.subject_id,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, false),
            channel_data: self.channels.clone(),
        }
    }
}

/// Reading as it appears on the feed topic and on live viewer sockets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadingMessage {
    pub patient_id: SubjectId,
    pub timestamp: String,
    pub channel_data: Vec<f64>,
}

/// Text pushed to alert-scoped viewers when a reading is classified as a seizure
pub fn alert_text(subject_id: SubjectId) -> String {
    format!("Seizure Alert for patient {}", subject_id)
}

/// Which partition of the registry a viewer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerScope {
    /// Live readings for a single subject
    Subject { subject_id: SubjectId },
    /// Seizure alerts for every subject
    Alerts,
}
