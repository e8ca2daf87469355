//! Wire codec for reading messages.
//!
//! The feed publishes one JSON object per message:
//! `{"patient_id": 2, "timestamp": "2024-01-01T00:00:00", "channel_data": [..]}`.
//! Decoding validates the object into a [`Reading`]; encoding produces the
//! same shape for live viewers with the timestamp rendered as RFC 3339.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::types::{Reading, ReadingMessage, MAX_CHANNELS};

/// Naive layouts emitted by devices that do not attach an offset
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Result type for decoding
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Reasons a feed message is rejected
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid timestamp: {0}")]
    Timestamp(String),

    #[error("Message carries no channel data")]
    EmptyChannels,

    #[error("Expected {expected} channels, got {actual}")]
    ChannelArity { expected: usize, actual: usize },

    #[error("Channel {index} is not a finite value")]
    NonFinite { index: usize },

    #[error("Message on unexpected topic '{0}'")]
    UnexpectedTopic(String),
}

/// Validating decoder for a deployment's channel layout
#[derive(Debug, Clone, Copy)]
pub struct ReadingDecoder {
    channel_count: Option<usize>,
}

impl ReadingDecoder {
    /// `channel_count` of `None` accepts any non-empty arity up to the hard limit
    pub fn new(channel_count: Option<usize>) -> Self {
        Self { channel_count }
    }

    pub fn decode(&self, payload: &[u8]) -> DecodeResult<Reading> {
        let message: ReadingMessage = serde_json::from_slice(payload)?;
        self.validate(message)
    }

    pub fn validate(&self, message: ReadingMessage) -> DecodeResult<Reading> {
        let actual = message.channel_data.len();
        if actual == 0 {
            return Err(DecodeError::EmptyChannels);
        }

        let expected = self.channel_count.unwrap_or(MAX_CHANNELS);
        let arity_ok = match self.channel_count {
            Some(expected) => actual == expected,
            None => actual <= MAX_CHANNELS,
        };
        if !arity_ok {
            return Err(DecodeError::ChannelArity { expected, actual });
        }

        if let Some(index) = message.channel_data.iter().position(|v| !v.is_finite()) {
            return Err(DecodeError::NonFinite { index });
        }

        let timestamp = parse_timestamp(&message.timestamp)?;

        Ok(Reading::new(message.patient_id, timestamp, message.channel_data))
    }
}

/// Parse an ISO-8601 timestamp; values without an offset are taken as UTC
pub fn parse_timestamp(raw: &str) -> DecodeResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Ok(with_offset.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| DecodeError::Timestamp(raw.to_string()))
}

/// Serialize a reading to the live viewer payload
pub fn encode_reading(reading: &Reading) -> serde_json::Result<String> {
    serde_json::to_string(&reading.to_message())
}
