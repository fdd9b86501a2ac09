//! # Aggregator
//!
//! Accumulates per-frame detections into fixed-width `WindowedMetric` windows per
//! camera. A window's start is pinned to a fixed grid (`floor((t - epoch) / W) * W +
//! epoch`) rather than to the first sample that lands in it, so two cameras — or the
//! same camera after a restart — always agree on where a window begins.
//!
//! A sample whose window has already closed is still accepted, up to a grace period,
//! and merged into the already-finalised window; anything later than that is dropped
//! and counted rather than silently lost, so delivery-ordering jitter on a busy camera
//! doesn't fabricate missing data.

use crate::model::{Detection, WindowedMetric};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub struct AggregatorConfig {
    pub window_seconds: u32,
    pub grace_seconds: u32,
}

struct OpenWindow {
    window_start: DateTime<Utc>,
    class_counts: BTreeMap<String, u32>,
    zone_counts: BTreeMap<String, u32>,
    confidence_sum: f64,
    latencies_ms: Vec<u32>,
    sample_count: u32,
}

impl OpenWindow {
    fn new(window_start: DateTime<Utc>) -> Self {
        Self {
            window_start,
            class_counts: BTreeMap::new(),
            zone_counts: BTreeMap::new(),
            confidence_sum: 0.0,
            latencies_ms: Vec::new(),
            sample_count: 0,
        }
    }

    fn absorb(&mut self, d: &Detection) {
        *self.class_counts.entry(d.class_label.clone()).or_insert(0) += 1;
        if let Some(zone) = &d.zone_label {
            *self.zone_counts.entry(zone.clone()).or_insert(0) += 1;
        }
        self.confidence_sum += d.confidence as f64;
        self.latencies_ms.push(d.processing_latency_ms);
        self.sample_count += 1;
    }

    fn finalize(mut self, window_seconds: u32) -> WindowedMetric {
        self.latencies_ms.sort_unstable();
        let p50 = percentile(&self.latencies_ms, 0.50);
        let p95 = percentile(&self.latencies_ms, 0.95);
        let average_confidence = if self.sample_count > 0 {
            (self.confidence_sum / self.sample_count as f64) as f32
        } else {
            0.0
        };

        let mut class_counts_avg = BTreeMap::new();
        for (k, v) in &self.class_counts {
            class_counts_avg.insert(k.clone(), *v as f64);
        }

        WindowedMetric {
            camera_id: String::new(), // filled in by caller, which owns the per-camera accumulator
            window_start: self.window_start,
            window_seconds,
            class_counts_avg,
            class_counts_max: self.class_counts,
            average_confidence,
            sample_count: self.sample_count,
            zone_counts: self.zone_counts,
            latency_p50_ms: p50,
            latency_p95_ms: p95,
        }
    }
}

fn percentile(sorted: &[u32], p: f64) -> u32 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// One camera's live aggregation state: the currently-open window plus whichever
/// closed windows are still inside the grace period and could still accept a
/// late-arriving sample.
pub struct CameraAggregator {
    camera_id: String,
    config: AggregatorConfig,
    open: Option<OpenWindow>,
    closed_in_grace: Vec<OpenWindow>,
    pub late_dropped: u64,
    pub detections_in: u64,
    pub windowed_rows_out: u64,
}

impl CameraAggregator {
    pub fn new(camera_id: impl Into<String>, config: AggregatorConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            config,
            open: None,
            closed_in_grace: Vec::new(),
            late_dropped: 0,
            detections_in: 0,
            windowed_rows_out: 0,
        }
    }

    fn window_start_for(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let elapsed = (t - epoch).num_seconds();
        let w = self.config.window_seconds as i64;
        let floored = (elapsed.div_euclid(w)) * w;
        epoch + chrono::Duration::seconds(floored)
    }

    /// Feeds one detection in. Returns any windows that just closed (their grace period
    /// or the opening of a far-future window has made them final) and should be
    /// persisted by the caller.
    pub fn absorb(&mut self, d: &Detection, now: DateTime<Utc>) -> Vec<WindowedMetric> {
        self.detections_in += 1;
        let target_start = self.window_start_for(d.captured_at);
        let mut finalized = Vec::new();

        if let Some(open) = &mut self.open {
            if open.window_start == target_start {
                open.absorb(d);
                self.expire_grace(now, &mut finalized);
                return finalized;
            }
            if target_start > open.window_start {
                let closing = self.open.take().unwrap();
                self.closed_in_grace.push(closing);
                self.open = Some(OpenWindow::new(target_start));
                self.open.as_mut().unwrap().absorb(d);
                self.expire_grace(now, &mut finalized);
                return finalized;
            }
        } else {
            self.open = Some(OpenWindow::new(target_start));
            self.open.as_mut().unwrap().absorb(d);
            self.expire_grace(now, &mut finalized);
            return finalized;
        }

        // target_start < open.window_start: a late sample for an earlier window.
        let grace_cutoff = target_start + chrono::Duration::seconds(self.config.grace_seconds as i64);
        if let Some(pos) = self.closed_in_grace.iter().position(|w| w.window_start == target_start) {
            if now <= grace_cutoff {
                self.closed_in_grace[pos].absorb(d);
            } else {
                self.late_dropped += 1;
            }
        } else {
            self.late_dropped += 1;
        }

        self.expire_grace(now, &mut finalized);
        finalized
    }

    /// Moves any grace-expired closed windows into the finalized output list.
    fn expire_grace(&mut self, now: DateTime<Utc>, finalized: &mut Vec<WindowedMetric>) {
        let grace = chrono::Duration::seconds(self.config.grace_seconds as i64);
        let mut still_open = Vec::new();
        for window in self.closed_in_grace.drain(..) {
            let window_end = window.window_start + chrono::Duration::seconds(self.config.window_seconds as i64);
            if now > window_end + grace {
                self.windowed_rows_out += 1;
                let mut metric = window.finalize(self.config.window_seconds);
                metric.camera_id = self.camera_id.clone();
                finalized.push(metric);
            } else {
                still_open.push(window);
            }
        }
        self.closed_in_grace = still_open;
    }

    /// Flushes the currently open window unconditionally — used at shutdown so no
    /// in-progress window is lost.
    pub fn flush(&mut self) -> Vec<WindowedMetric> {
        let mut out: Vec<WindowedMetric> = self
            .closed_in_grace
            .drain(..)
            .map(|w| {
                let mut m = w.finalize(self.config.window_seconds);
                m.camera_id = self.camera_id.clone();
                m
            })
            .collect();
        if let Some(open) = self.open.take() {
            let mut m = open.finalize(self.config.window_seconds);
            m.camera_id = self.camera_id.clone();
            out.push(m);
        }
        self.windowed_rows_out += out.len() as u64;
        out
    }

    /// Ratio of raw detections absorbed to windowed rows emitted — expected to be large
    /// (each row summarizes many detections) and is reported as a health-snapshot gauge.
    pub fn compression_ratio(&self) -> f64 {
        if self.windowed_rows_out == 0 {
            return 0.0;
        }
        self.detections_in as f64 / self.windowed_rows_out as f64
    }
}
