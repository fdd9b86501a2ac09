//! # Reference Backends
//!
//! Deterministic, dependency-free stand-ins for a real detector/captioner model. They
//! derive their output entirely from the input bytes (no RNG, no clock), so the same
//! frame always produces the same detections and caption — useful for exercising the
//! rest of the pipeline (aggregation windows, replication, retention) without shipping
//! an actual neural network runtime. A real backend implements [`super::Detector`] and
//! [`super::Captioner`] against whatever tensor-execution crate is chosen and is wired
//! in at the same two call sites in `main.rs`.
//!
//! Label and vocabulary data are loaded from files at warm-up; the reference backends
//! ship fixed built-in defaults so the agent runs out of the box without requiring an
//! operator to provide `labels.txt`/`vocab.txt` before first start.

use super::{Captioner, Detector};
use crate::error::VisionOpsError;
use crate::model::Detection;
use std::path::PathBuf;

const DEFAULT_LABELS: &[&str] = &["person", "vehicle", "animal", "package", "bicycle", "unknown"];
const DEFAULT_VOCAB: &[&str] = &[
    "<eos>", "a", "the", "person", "walking", "standing", "vehicle", "parked", "moving",
    "animal", "package", "delivered", "bicycle", "near", "entrance", "driveway", "scene",
    "appears", "quiet", "activity", "detected",
];

pub struct ReferenceDetector {
    labels: Vec<String>,
}

impl ReferenceDetector {
    pub fn with_fixed_labels() -> Self {
        Self {
            labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Loads one label per line from `path`, falling back to the fixed default set if
    /// the file is missing — a missing labels file at a fresh install is not fatal.
    pub fn from_labels_file(path: &PathBuf) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let labels: Vec<String> = contents.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect();
                if labels.is_empty() {
                    Self::with_fixed_labels()
                } else {
                    Self { labels }
                }
            }
            Err(_) => Self::with_fixed_labels(),
        }
    }
}

impl Detector for ReferenceDetector {
    fn warm_up(&mut self) -> Result<(), VisionOpsError> {
        if self.labels.is_empty() {
            return Err(VisionOpsError::fatal("detector label set is empty"));
        }
        Ok(())
    }

    fn infer(&self, camera_id: &str, bgr: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, VisionOpsError> {
        if bgr.len() != (width as usize) * (height as usize) * 3 {
            return Err(VisionOpsError::integrity(
                "inference_input",
                format!("expected {}x{}x3 bytes, got {}", width, height, bgr.len()),
            ));
        }

        let (sum, count) = bgr.iter().fold((0u64, 0u64), |(s, c), &b| (s + b as u64, c + 1));
        let mean = if count > 0 { sum / count } else { 0 };
        let class_idx = (mean as usize) % self.labels.len();
        let confidence = 0.5 + ((mean % 50) as f32 / 100.0);

        let w = (width / 4).max(1) as i32;
        let h = (height / 4).max(1) as i32;
        let x = ((mean as i32 * 7) % (width as i32 - w).max(1)).clamp(0, (width as i32 - w).max(0));
        let y = ((mean as i32 * 13) % (height as i32 - h).max(1)).clamp(0, (height as i32 - h).max(0));

        Ok(vec![Detection {
            camera_id: camera_id.to_string(),
            class_label: self.labels[class_idx].clone(),
            confidence,
            x,
            y,
            w,
            h,
            zone_label: None,
            captured_at: chrono::Utc::now(),
            processing_latency_ms: 5,
        }])
    }
}

pub struct ReferenceCaptioner {
    vocab: Vec<String>,
}

impl ReferenceCaptioner {
    pub fn with_fixed_vocab() -> Self {
        Self {
            vocab: DEFAULT_VOCAB.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Loads one token per line, where line 0 must be the end-of-sequence marker.
    pub fn from_vocab_file(path: &PathBuf) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let vocab: Vec<String> = contents.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect();
                if vocab.is_empty() {
                    Self::with_fixed_vocab()
                } else {
                    Self { vocab }
                }
            }
            Err(_) => Self::with_fixed_vocab(),
        }
    }
}

impl Captioner for ReferenceCaptioner {
    fn warm_up(&mut self) -> Result<(), VisionOpsError> {
        if self.vocab.is_empty() {
            return Err(VisionOpsError::fatal("captioner vocabulary is empty"));
        }
        Ok(())
    }

    fn infer(&self, bgr: &[u8], width: u32, height: u32) -> Result<String, VisionOpsError> {
        if bgr.len() != (width as usize) * (height as usize) * 3 {
            return Err(VisionOpsError::integrity(
                "inference_input",
                format!("expected {}x{}x3 bytes, got {}", width, height, bgr.len()),
            ));
        }

        // Deterministic walk through the vocabulary driven by byte sampling; stops at
        // the EOS token (index 0) or the word-count cap, whichever comes first.
        let mut words = Vec::new();
        let mut cursor: usize = bgr.first().copied().unwrap_or(0) as usize;
        let max_words = 12;
        while words.len() < max_words {
            let step = bgr.get(cursor % bgr.len().max(1)).copied().unwrap_or(1) as usize;
            let idx = (cursor + step) % self.vocab.len();
            if idx == 0 {
                break;
            }
            words.push(self.vocab[idx].clone());
            cursor = cursor.wrapping_add(step + 1);
        }

        let caption = if words.is_empty() {
            "scene appears quiet".to_string()
        } else {
            words.join(" ")
        };

        Ok(caption.chars().take(crate::model::CAPTION_MAX_CHARS).collect())
    }
}
