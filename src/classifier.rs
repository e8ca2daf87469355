//! Seizure classifiers.
//!
//! The dispatcher only sees [`SeizureClassifier`]. Two variants are provided:
//! a threshold on the mean of the leading channel values (the default) and a
//! logistic model over summary features of the hardware channels, with
//! weights loaded from a JSON file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::config::ClassifierKind;
use crate::error::IngestError;

/// Hardware channels the feature extractor looks at
pub const HARDWARE_CHANNELS: usize = 8;

/// Result type for classification
pub type ClassifierResult<T> = Result<T, ClassifierError>;

/// Errors raised while classifying a reading
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("No channel values to classify")]
    EmptyInput,

    #[error("Model has {actual} weights, expected {expected}")]
    FeatureMismatch { expected: usize, actual: usize },

    #[error("Classifier produced a non-finite score")]
    NonFiniteScore,
}

/// Anomaly predicate over one reading's channel values
///
/// Implementations must be pure and must not block.
pub trait SeizureClassifier: Send + Sync {
    fn classify(&self, channels: &[f64]) -> ClassifierResult<bool>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Flags a reading when the mean of its first `window` values exceeds `threshold`
#[derive(Debug, Clone)]
pub struct ThresholdClassifier {
    threshold: f64,
    window: usize,
}

impl ThresholdClassifier {
    pub fn new(threshold: f64, window: usize) -> Self {
        Self {
            threshold,
            window: window.max(1),
        }
    }
}

impl Default for ThresholdClassifier {
    fn default() -> Self {
        Self::new(5.0, HARDWARE_CHANNELS)
    }
}

impl SeizureClassifier for ThresholdClassifier {
    fn classify(&self, channels: &[f64]) -> ClassifierResult<bool> {
        let window = &channels[..channels.len().min(self.window)];
        if window.is_empty() {
            return Err(ClassifierError::EmptyInput);
        }
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        Ok(mean > self.threshold)
    }

    fn name(&self) -> &'static str {
        "threshold"
    }
}

/// Summary statistics of the hardware channels, in model input order
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub peak_to_peak: f64,
    pub rms: f64,
    pub zero_crossing_rate: f64,
    pub kurtosis: f64,
}

impl Features {
    pub const COUNT: usize = 8;

    /// Extract features from the first [`HARDWARE_CHANNELS`] values
    pub fn extract(channels: &[f64]) -> ClassifierResult<Self> {
        let samples = &channels[..channels.len().min(HARDWARE_CHANNELS)];
        if samples.is_empty() {
            return Err(ClassifierError::EmptyInput);
        }

        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let rms = (samples.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();

        let zero_crossing_rate = if samples.len() < 2 {
            0.0
        } else {
            let crossings = samples
                .windows(2)
                .filter(|w| (w[0] >= 0.0 && w[1] < 0.0) || (w[0] < 0.0 && w[1] >= 0.0))
                .count();
            crossings as f64 / (samples.len() - 1) as f64
        };

        // Excess kurtosis
        let kurtosis = if std > 0.0 {
            samples.iter().map(|x| ((x - mean) / std).powi(4)).sum::<f64>() / n - 3.0
        } else {
            0.0
        };

        Ok(Self {
            mean,
            std,
            min,
            max,
            peak_to_peak: max - min,
            rms,
            zero_crossing_rate,
            kurtosis,
        })
    }

    pub fn to_vec(&self) -> Vec<f64> {
        vec![
            self.mean,
            self.std,
            self.min,
            self.max,
            self.peak_to_peak,
            self.rms,
            self.zero_crossing_rate,
            self.kurtosis,
        ]
    }
}

/// Serialized logistic model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    #[serde(default = "default_decision_threshold")]
    pub decision_threshold: f64,
}

fn default_decision_threshold() -> f64 {
    0.5
}

/// Logistic regression over [`Features`]
#[derive(Debug, Clone)]
pub struct LogisticModelClassifier {
    model: LogisticModel,
}

impl LogisticModelClassifier {
    pub fn new(model: LogisticModel) -> ClassifierResult<Self> {
        if model.weights.len() != Features::COUNT {
            return Err(ClassifierError::FeatureMismatch {
                expected: Features::COUNT,
                actual: model.weights.len(),
            });
        }
        Ok(Self { model })
    }

    /// Load weights from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, IngestError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IngestError::Model(format!("{}: {}", path.display(), e)))?;
        let model: LogisticModel = serde_json::from_str(&raw)
            .map_err(|e| IngestError::Model(format!("{}: {}", path.display(), e)))?;
        Self::new(model).map_err(|e| IngestError::Model(e.to_string()))
    }

    /// Seizure probability for a reading
    pub fn score(&self, channels: &[f64]) -> ClassifierResult<f64> {
        let features = Features::extract(channels)?.to_vec();
        let z = self
            .model
            .weights
            .iter()
            .zip(features.iter())
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.model.bias;
        let probability = 1.0 / (1.0 + (-z).exp());
        if probability.is_finite() {
            Ok(probability)
        } else {
            Err(ClassifierError::NonFiniteScore)
        }
    }
}

impl SeizureClassifier for LogisticModelClassifier {
    fn classify(&self, channels: &[f64]) -> ClassifierResult<bool> {
        Ok(self.score(channels)? >= self.model.decision_threshold)
    }

    fn name(&self) -> &'static str {
        "logistic-model"
    }
}

/// Build the classifier selected in configuration
pub fn build_classifier(kind: &ClassifierKind) -> Result<Arc<dyn SeizureClassifier>, IngestError> {
    match kind {
        ClassifierKind::Threshold { threshold, window } => {
            Ok(Arc::new(ThresholdClassifier::new(*threshold, *window)))
        }
        ClassifierKind::Model { path } => Ok(Arc::new(LogisticModelClassifier::from_file(path)?)),
    }
}
