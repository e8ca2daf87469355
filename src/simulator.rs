//! Synthetic reading source for development.
//!
//! Produces readings in the same wire shape a device publishes: a naive
//! ISO-8601 timestamp and uniform random channel values.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{ReadingMessage, SubjectId};

/// Channel values are drawn from `[-AMPLITUDE, AMPLITUDE]`
pub const AMPLITUDE: f64 = 100.0;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub struct ReadingGenerator {
    subject_id: SubjectId,
    channels: usize,
    rng: StdRng,
}

impl ReadingGenerator {
    pub fn new(subject_id: SubjectId, channels: usize) -> Self {
        Self::with_rng(subject_id, channels, StdRng::from_entropy())
    }

    /// Deterministic generator
    pub fn seeded(subject_id: SubjectId, channels: usize, seed: u64) -> Self {
        Self::with_rng(subject_id, channels, StdRng::seed_from_u64(seed))
    }

    fn with_rng(subject_id: SubjectId, channels: usize, rng: StdRng) -> Self {
        Self {
            subject_id,
            channels: channels.max(1),
            rng,
        }
    }

    pub fn next_message(&mut self) -> ReadingMessage {
        let channel_data = (0..self.channels)
            .map(|_| self.rng.gen_range(-AMPLITUDE..=AMPLITUDE))
            .collect();

        ReadingMessage {
            patient_id: self.subject_id,
            timestamp: Utc::now().naive_utc().format(TIMESTAMP_FORMAT).to_string(),
            channel_data,
        }
    }

    /// Next reading serialized as a feed payload
    pub fn next_payload(&mut self) -> serde_json::Result<String> {
        serde_json::to_string(&self.next_message())
    }
}
