//! # Inference Collaborator Interface
//!
//! The session engine treats pest detection as an opaque function: image
//! bytes in, annotated image bytes plus labels out. The real model lives
//! behind [`InferenceEngine`]; this crate ships two stand-ins — a decoding
//! probe used by the server binary and a byte-echo engine for tests and
//! benchmarks.

use thiserror::Error;

/// Output of one inference call. Produced per request, never persisted by
/// the protocol core itself.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Annotated image, encoded in the same container format as the input.
    pub annotated_image: Vec<u8>,
    /// Detected class labels, in model output order.
    pub labels: Vec<String>,
    /// Mean confidence over all detections, in [0, 1]. Zero when nothing
    /// was detected.
    pub avg_confidence: f64,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("input is not a decodable image: {0}")]
    Undecodable(String),

    #[error("inference engine unavailable: {0}")]
    Unavailable(String),
}

/// The narrow interface the session engine invokes per upload.
///
/// Implementations run on the blocking thread pool, so they may be
/// CPU-bound without starving the async runtime.
pub trait InferenceEngine: Send + Sync {
    fn infer(&self, image: &[u8]) -> Result<Detection, InferenceError>;
}

/// Model-less stand-in used when no detector is configured.
///
/// Validates that the upload actually decodes as an image and passes the
/// bytes through unannotated. A deployment with a real model replaces this
/// with its own [`InferenceEngine`] implementation.
pub struct ImageProbeEngine;

impl InferenceEngine for ImageProbeEngine {
    fn infer(&self, image_bytes: &[u8]) -> Result<Detection, InferenceError> {
        let decoded = image::load_from_memory(image_bytes)
            .map_err(|e| InferenceError::Undecodable(e.to_string()))?;
        log::debug!(
            "probe engine decoded {}x{} image ({} bytes)",
            decoded.width(),
            decoded.height(),
            image_bytes.len()
        );
        Ok(Detection {
            annotated_image: image_bytes.to_vec(),
            labels: Vec::new(),
            avg_confidence: 0.0,
        })
    }
}

/// Byte-echo engine with configurable labels. Performs no decoding, so
/// tests can drive the protocol with synthetic buffers.
pub struct EchoEngine {
    labels: Vec<String>,
    avg_confidence: f64,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self {
            labels: Vec::new(),
            avg_confidence: 0.0,
        }
    }

    pub fn with_labels(labels: Vec<String>, avg_confidence: f64) -> Self {
        Self {
            labels,
            avg_confidence,
        }
    }
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for EchoEngine {
    fn infer(&self, image: &[u8]) -> Result<Detection, InferenceError> {
        Ok(Detection {
            annotated_image: image.to_vec(),
            labels: self.labels.clone(),
            avg_confidence: self.avg_confidence,
        })
    }
}
