//! # Inference Engine
//!
//! A process-wide singleton wrapping a [`Detector`] and a [`Captioner`] behind a mutex:
//! both model slots are CPU-bound and the hardware this agent targets has no spare
//! cores to run them concurrently without starving capture workers, so `detect` and
//! `caption` calls serialize through one lock rather than each camera owning its own
//! model instance.
//!
//! Frame preprocessing (letterbox resize to the model's fixed tensor shape) happens
//! here via `cap_scale`, not in the capture worker, so a backend swap only ever touches
//! this module.

pub mod reference;

use crate::error::VisionOpsError;
use crate::model::{CameraSpec, Detection, DetectionSet, Frame, KeyFrame};
use cap_scale::presets::{CAPTIONER_INPUT, DETECTOR_INPUT};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A detector backend: fixed-shape BGR tensor in, detections out. Implementations are
/// expected to be deterministic given identical input bytes — the reference backend
/// instantiated at startup makes no claim to object-detection accuracy, only to
/// exercising the rest of the pipeline identically to a real model.
pub trait Detector: Send {
    fn warm_up(&mut self) -> Result<(), VisionOpsError>;
    fn infer(&self, camera_id: &str, bgr: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, VisionOpsError>;
}

/// A captioner backend: fixed-shape BGR tensor in, short natural-language caption out.
pub trait Captioner: Send {
    fn warm_up(&mut self) -> Result<(), VisionOpsError>;
    fn infer(&self, bgr: &[u8], width: u32, height: u32) -> Result<String, VisionOpsError>;
}

struct EngineState {
    detector: Box<dyn Detector>,
    captioner: Box<dyn Captioner>,
}

pub struct InferenceEngine {
    state: Mutex<EngineState>,
    degraded: AtomicBool,
}

impl InferenceEngine {
    pub fn new(mut detector: Box<dyn Detector>, mut captioner: Box<dyn Captioner>) -> Result<Self, VisionOpsError> {
        detector.warm_up()?;
        captioner.warm_up()?;
        Ok(Self {
            state: Mutex::new(EngineState { detector, captioner }),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Resizes a frame to the detector's fixed input shape and runs detection.
    pub fn detect(&self, frame: &Frame) -> Result<DetectionSet, VisionOpsError> {
        if self.is_degraded() {
            return Err(VisionOpsError::exhaustion("inference_engine", "engine is degraded"));
        }

        let resized = resize_for_tensor(frame.bytes(), frame.width, frame.height, DETECTOR_INPUT.w, DETECTOR_INPUT.h)?;

        let state = self.state.lock().map_err(|_| poisoned())?;
        let result = state
            .detector
            .infer(&frame.camera_id, &resized, DETECTOR_INPUT.w, DETECTOR_INPUT.h);
        drop(state);

        match result {
            Ok(detections) => Ok(DetectionSet {
                camera_id: frame.camera_id.clone(),
                sequence: frame.sequence,
                captured_at: frame.captured_at_wall,
                detections,
            }),
            Err(e) => {
                self.mark_degraded_if_fatal(&e);
                Err(e)
            }
        }
    }

    /// Runs detection over up to B frames, preserving input order. The engine's mutex
    /// already serializes individual `infer` calls, so a batch is simply the same
    /// single-frame path applied per element rather than a separate tensor-stacking
    /// code path; a real tensor-execution backend could stack these into one call
    /// behind this same signature without callers noticing.
    pub fn detect_batch(&self, frames: &[&Frame]) -> Result<Vec<DetectionSet>, VisionOpsError> {
        frames.iter().map(|frame| self.detect(frame)).collect()
    }

    /// Resizes a frame to the captioner's fixed input shape and produces a key frame
    /// record (caption plus a per-class tally pulled from the accompanying detections).
    pub fn caption(&self, camera: &CameraSpec, frame: &Frame, detections: &[Detection]) -> Result<KeyFrame, VisionOpsError> {
        if self.is_degraded() {
            return Err(VisionOpsError::exhaustion("inference_engine", "engine is degraded"));
        }

        let resized = resize_for_tensor(frame.bytes(), frame.width, frame.height, CAPTIONER_INPUT.w, CAPTIONER_INPUT.h)?;

        let state = self.state.lock().map_err(|_| poisoned())?;
        let result = state.captioner.infer(&resized, CAPTIONER_INPUT.w, CAPTIONER_INPUT.h);
        drop(state);

        let caption = match result {
            Ok(c) => c,
            Err(e) => {
                self.mark_degraded_if_fatal(&e);
                return Err(e);
            }
        };

        let mut class_counts = std::collections::BTreeMap::new();
        for d in detections {
            *class_counts.entry(d.class_label.clone()).or_insert(0u32) += 1;
        }

        let image_bytes = compress_image_bytes(&resized, CAPTIONER_INPUT.w, CAPTIONER_INPUT.h);

        Ok(KeyFrame {
            camera_id: camera.id.clone(),
            captured_at: frame.captured_at_wall,
            image_bytes,
            caption,
            class_counts,
            sequence: frame.sequence,
        })
    }

    fn mark_degraded_if_fatal(&self, e: &VisionOpsError) {
        if crate::error::classify::is_fatal(e) {
            self.degraded.store(true, Ordering::Relaxed);
        }
    }
}

fn poisoned() -> VisionOpsError {
    VisionOpsError::fatal("inference engine mutex poisoned by a panicking model call")
}

fn resize_for_tensor(bgr: &[u8], in_w: u32, in_h: u32, out_w: u32, out_h: u32) -> Result<Vec<u8>, VisionOpsError> {
    use cap_scale::presets::{build_plan, AspectMode, ScaleTarget, Size};

    let plan = build_plan(
        Size { w: in_w, h: in_h },
        ScaleTarget::Exact(Size { w: out_w, h: out_h }),
        AspectMode::Pad { bg_rgba: [0, 0, 0, 255] },
    );

    // The reference backends operate directly on BGR bytes rather than through the
    // SIMD BGRA scaler (cap_scale::cpu expects a 4-byte pixel stride); this nearest
    // neighbour fallback is the reference-backend equivalent that keeps a real
    // tensor-execution backend free to call cap_scale::cpu::scale_bgra_cpu directly.
    let mut out = vec![0u8; (out_w * out_h * 3) as usize];
    if let Some((dx, dy, dw, dh)) = plan.dst_roi {
        for y in 0..dh {
            let src_y = (y * in_h.max(1)) / dh.max(1);
            for x in 0..dw {
                let src_x = (x * in_w.max(1)) / dw.max(1);
                let src_idx = ((src_y * in_w + src_x) * 3) as usize;
                let dst_idx = (((dy + y) * out_w + (dx + x)) * 3) as usize;
                if src_idx + 3 <= bgr.len() && dst_idx + 3 <= out.len() {
                    out[dst_idx..dst_idx + 3].copy_from_slice(&bgr[src_idx..src_idx + 3]);
                }
            }
        }
    }
    Ok(out)
}

/// Placeholder JPEG-free compression: stores a fixed-size thumbnail by subsampling, kept
/// under the key frame's hard byte ceiling. A real codec (e.g. `mozjpeg`/`image`) is a
/// drop-in replacement behind this one function.
fn compress_image_bytes(bgr: &[u8], w: u32, h: u32) -> Vec<u8> {
    use crate::model::KEYFRAME_HARD_CEILING_BYTES;
    let step = ((bgr.len() as f64 / KEYFRAME_HARD_CEILING_BYTES as f64).sqrt().ceil() as usize).max(1);
    let mut out = Vec::with_capacity(KEYFRAME_HARD_CEILING_BYTES);
    let mut y = 0u32;
    while y < h && out.len() < KEYFRAME_HARD_CEILING_BYTES {
        let mut x = 0u32;
        while x < w && out.len() < KEYFRAME_HARD_CEILING_BYTES {
            let idx = ((y * w + x) * 3) as usize;
            if idx + 3 <= bgr.len() {
                out.extend_from_slice(&bgr[idx..idx + 3]);
            }
            x += step as u32;
        }
        y += step as u32;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::reference::{ReferenceCaptioner, ReferenceDetector};
    use crate::model::{FRAME_HEIGHT, FRAME_WIDTH};

    fn test_engine() -> InferenceEngine {
        InferenceEngine::new(
            Box::new(ReferenceDetector::with_fixed_labels()),
            Box::new(ReferenceCaptioner::with_fixed_vocab()),
        )
        .unwrap()
    }

    #[test]
    fn detect_returns_a_detection_set_preserving_sequence() {
        let engine = test_engine();
        let frame = Frame::new("cam-1", 7, 1, vec![128u8; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize]);
        let set = engine.detect(&frame).unwrap();
        assert_eq!(set.sequence, 7);
        assert_eq!(set.camera_id, "cam-1");
    }

    #[test]
    fn detect_batch_preserves_input_order() {
        let engine = test_engine();
        let frames = vec![
            Frame::new("cam-1", 1, 1, vec![0u8; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize]),
            Frame::new("cam-1", 2, 2, vec![0u8; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize]),
        ];
        let refs: Vec<&Frame> = frames.iter().collect();
        let sets = engine.detect_batch(&refs).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].sequence, 1);
        assert_eq!(sets[1].sequence, 2);
    }

    #[test]
    fn caption_respects_hard_byte_ceiling() {
        let engine = test_engine();
        let camera = CameraSpec {
            id: "cam-1".into(),
            url: "rtsp://x".into(),
            credential_ref: None,
            enabled: true,
            zones: vec![],
        };
        let frame = Frame::new("cam-1", 1, 1, vec![64u8; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize]);
        let key_frame = engine.caption(&camera, &frame, &[]).unwrap();
        assert!(key_frame.image_bytes.len() <= crate::model::KEYFRAME_HARD_CEILING_BYTES);
        assert!(!key_frame.caption.is_empty());
    }
}
