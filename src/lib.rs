//! # VisionOps
//!
//! A long-running edge analytics agent: it ingests RTSP camera streams on constrained
//! hardware, runs on-device object detection and captioning, persists results locally
//! with a durable queue, and replicates aggregated metadata to a remote datastore.
//!
//! ## Module Map
//!
//! - [`config`]: agent configuration, TOML + environment overlay, validation
//! - [`model`]: shared entity types (`CameraSpec`, `Frame`, `Detection`, `QueueItem`, ...)
//! - [`error`]: the six-kind error taxonomy every component returns
//! - [`core`]: buffer pool and per-camera ring buffer
//! - [`capture`]: per-camera decoder process supervision and frame ingestion
//! - [`governor`]: thermal/memory sampling and throttle-level hysteresis
//! - [`scheduler`]: cooperative round-robin dispatch of due frames to inference
//! - [`inference`]: the detector/captioner engine and its reference backends
//! - [`store`]: the embedded local database, migrations, and retention
//! - [`aggregator`]: fixed-window metric accumulation with late-sample handling
//! - [`replicator`]: durable, retried delivery to the remote datastore
//! - [`supervisor`]: shutdown ordering, scheduled restart, exit codes

pub mod aggregator;
pub mod capture;
pub mod config;
pub mod core;
pub mod error;
pub mod governor;
pub mod inference;
pub mod model;
pub mod replicator;
pub mod scheduler;
pub mod store;
pub mod supervisor;
