//! # Capture
//!
//! One [`worker::CaptureWorker`] runs per configured camera, driving an external decoder
//! process and feeding decoded frames into that camera's [`RingBuffer`](crate::core::ring_buffer::RingBuffer).

pub mod worker;

pub use worker::{CaptureState, CaptureWorker};
