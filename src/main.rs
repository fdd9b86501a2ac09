//! VisionOps agent entry point.
//!
//! Wires configuration, the local store, per-camera capture workers, the thermal/memory
//! governor, the scheduler, the inference engine, the aggregator, and the replicator
//! into one running process, and owns top-level signal handling and the coordinated
//! shutdown sequence described in the Lifecycle Supervisor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use visionops::aggregator::{AggregatorConfig, CameraAggregator};
use visionops::capture::CaptureWorker;
use visionops::config::AgentConfig;
use visionops::core::buffer_pool::BufferPool;
use visionops::core::ring_buffer::RingBuffer;
use visionops::governor::{Governor, GovernorEvent};
use visionops::inference::reference::{ReferenceCaptioner, ReferenceDetector};
use visionops::inference::InferenceEngine;
use visionops::model::{CameraSpec, Frame, MAX_LIVE_FRAMES_PER_CAMERA};
use visionops::replicator::{HttpTransport, Replicator};
use visionops::scheduler::{DueFrame, Scheduler};
use visionops::store::LocalStore;
use visionops::supervisor::{self, ShutdownCoordinator};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/visionops/config.toml".to_string());

    let config = match AgentConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("startup: failed to load configuration from {config_path}: {e}");
            std::process::exit(supervisor::exit_code_for_startup_error(&e));
        }
    };

    let store = match LocalStore::open(&config.database_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            log::error!("startup: failed to open local store at {}: {e}", config.database_path.display());
            std::process::exit(supervisor::exit_code_for_startup_error(&e));
        }
    };

    let replication_token = match config.replication_token() {
        Ok(t) => t,
        Err(e) => {
            log::error!("startup: {e}");
            std::process::exit(supervisor::exit_code_for_startup_error(&e));
        }
    };

    let detector = Box::new(ReferenceDetector::from_labels_file(&config.model.labels_path));
    let captioner = Box::new(ReferenceCaptioner::from_vocab_file(&config.model.vocab_path));
    let engine = match InferenceEngine::new(detector, captioner) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            log::error!("startup: inference engine warm-up failed: {e}");
            std::process::exit(supervisor::EXIT_MODEL_LOAD_FAILURE);
        }
    };

    {
        let crash_dir = config.database_path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));
        std::panic::set_hook(Box::new(move |info| {
            log::error!("visionops-agent: panicked: {info}");
            if let Err(e) = supervisor::write_crash_postmortem(&crash_dir, &info.to_string()) {
                log::error!("visionops-agent: failed to write crash postmortem: {e}");
            }
            std::process::exit(supervisor::EXIT_UNRECOVERABLE);
        }));
    }

    let buffer_pool = Arc::new(BufferPool::new((config.buffer_pool_cap_mb * 1024 * 1024) as usize));
    let (shutdown, shutdown_rx) = ShutdownCoordinator::new();
    let shutdown = Arc::new(shutdown);

    let cameras: Vec<CameraSpec> = config.cameras.iter().filter(|c| c.enabled).cloned().collect();
    let camera_priority: Vec<String> = cameras.iter().map(|c| c.id.clone()).collect();
    let camera_lookup: Arc<HashMap<String, CameraSpec>> =
        Arc::new(cameras.iter().map(|c| (c.id.clone(), c.clone())).collect());

    for camera in &cameras {
        if let Err(e) = store.enqueue_camera_spec(camera) {
            log::warn!("startup: failed to enqueue camera spec for '{}': {e}", camera.id);
        }
    }

    let stale_after = Duration::from_secs(config.scheduler.stale_age_secs);
    let mut rings = HashMap::new();
    for camera in &cameras {
        let ring = Arc::new(RingBuffer::new(MAX_LIVE_FRAMES_PER_CAMERA, stale_after));
        rings.insert(camera.id.clone(), ring.clone());
        let worker = CaptureWorker::new(camera.clone(), ring, buffer_pool.clone(), shutdown_rx.clone());
        tokio::spawn(worker.run());
    }

    let (governor, mut governor_state_rx) = Governor::new(config.clone(), buffer_pool.clone());
    let governor = Arc::new(governor);

    {
        let governor = governor.clone();
        let shutdown = shutdown.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        let interval = Duration::from_secs(config.governor.sample_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                if let Some(GovernorEvent::EmergencyShutdown) = governor.sample_once().await {
                    log::error!("governor: two consecutive critical samples, triggering emergency shutdown");
                    shutdown.signal();
                    std::process::exit(supervisor::EXIT_GOVERNOR_EMERGENCY);
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        });
    }

    tokio::spawn(async move {
        loop {
            if governor_state_rx.changed().await.is_err() {
                return;
            }
            let state = governor_state_rx.borrow().clone();
            log::debug!(
                "governor: level={:?} cpu_temp={:.1}C working_set={:.0}MB",
                state.level,
                state.cpu_temp_celsius,
                state.working_set_mb
            );
        }
    });

    // Critical entry schedules a graceful restart within the configured grace period
    // rather than exiting immediately; a second consecutive Critical sample still
    // exits immediately via the governor-sampling task above.
    {
        let governor = governor.clone();
        let shutdown = shutdown.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                if governor.take_restart_request() {
                    let grace = governor.restart_grace();
                    log::warn!("governor: critical level reached, scheduling a graceful restart in {grace:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(grace) => {
                            log::warn!("governor: graceful restart grace period elapsed, requesting shutdown");
                            shutdown.signal();
                            return;
                        }
                        _ = shutdown_rx.changed() => { return; }
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut last_restart = chrono::Local::now();
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                let now = chrono::Local::now();
                if supervisor::scheduled_restart_due(now, last_restart, supervisor::DEFAULT_RESTART_HOUR_LOCAL) {
                    log::info!("supervisor: daily scheduled restart window reached, requesting shutdown");
                    last_restart = now;
                    shutdown.signal();
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    let (due_tx, mut due_rx) = tokio::sync::mpsc::channel::<DueFrame>(256);
    let scheduler = Scheduler::new(
        rings,
        camera_priority,
        Duration::from_secs(config.scheduler.capture_interval_secs),
        Duration::from_secs(config.scheduler.keyframe_interval_secs),
        governor.clone(),
        due_tx,
        shutdown_rx.clone(),
    );
    tokio::spawn(scheduler.run());

    let aggregators: Arc<AsyncMutex<HashMap<String, CameraAggregator>>> = {
        let mut map = HashMap::new();
        for camera in &cameras {
            map.insert(
                camera.id.clone(),
                CameraAggregator::new(camera.id.clone(), AggregatorConfig {
                    window_seconds: config.aggregation.window_seconds,
                    grace_seconds: config.aggregation.grace_seconds,
                }),
            );
        }
        Arc::new(AsyncMutex::new(map))
    };

    {
        let store = store.clone();
        let engine = engine.clone();
        let aggregators = aggregators.clone();
        let camera_lookup = camera_lookup.clone();
        let buffer_pool = buffer_pool.clone();
        let governor = governor.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    maybe = due_rx.recv() => match maybe {
                        Some(d) => d,
                        None => return,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                        continue;
                    }
                };

                // Accumulate up to the governor's current batch size from whatever is
                // already queued, without waiting for more to arrive — a quiet period
                // still dispatches the one frame already in hand instead of stalling it.
                let batch_size = governor.detection_batch_size().max(1);
                let mut batch = Vec::with_capacity(batch_size);
                batch.push(first);
                while batch.len() < batch_size {
                    match due_rx.try_recv() {
                        Ok(d) => batch.push(d),
                        Err(_) => break,
                    }
                }

                process_due_frame_batch(batch, &store, &engine, &aggregators, &camera_lookup, &buffer_pool).await;
            }
        });
    }

    let transport = Box::new(HttpTransport::new(config.replication.endpoint_base_url.clone(), replication_token));
    let replicator = Arc::new(Replicator::new(
        store.clone(),
        transport,
        config.replication.batch_size,
        config.replication.lease_seconds,
        config.replication.max_attempts,
    ));

    {
        let replicator = replicator.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                match replicator.drain_once().await {
                    Ok(n) if n > 0 => log::debug!("replicator: acked {n} items"),
                    Ok(_) => {}
                    Err(e) => log::warn!("replicator: drain failed: {e}"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        });
    }

    {
        let store = store.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut last_daily = chrono::Utc::now();
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                if let Err(e) = store.run_hourly_retention() {
                    log::warn!("retention: hourly pass failed: {e}");
                }
                if chrono::Utc::now() - last_daily >= chrono::Duration::hours(24) {
                    match store.run_daily_retention() {
                        Ok(report) => log::info!(
                            "retention: daily pass removed {} key frames, {} metrics, {} acked queue items",
                            report.key_frames_deleted,
                            report.metrics_deleted,
                            report.acked_queue_items_deleted
                        ),
                        Err(e) => log::warn!("retention: daily pass failed: {e}"),
                    }
                    last_daily = chrono::Utc::now();
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        });
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");
    let mut main_shutdown_rx = shutdown_rx.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("visionops-agent: received SIGINT"),
        _ = sigterm.recv() => log::info!("visionops-agent: received SIGTERM"),
        _ = main_shutdown_rx.changed() => log::info!("visionops-agent: shutdown requested internally"),
    }
    shutdown.signal();

    let mut aggregator_vec: Vec<CameraAggregator> = {
        let mut guard = aggregators.lock().await;
        guard.drain().map(|(_, v)| v).collect()
    };
    supervisor::coordinated_shutdown(
        &mut aggregator_vec,
        &store,
        async {
            let _ = replicator.drain_once().await;
        },
        config.replication.lease_seconds,
    )
    .await;

    log::info!("visionops-agent: clean shutdown");
    std::process::exit(supervisor::EXIT_CLEAN);
}

/// Runs a batch of due frames through detection in one `detect_batch` call, then does
/// the remaining per-frame work (zone assignment, persistence, aggregation, and — on a
/// keyframe tick — captioning) frame by frame, and returns every buffer to the pool.
async fn process_due_frame_batch(
    mut batch: Vec<DueFrame>,
    store: &LocalStore,
    engine: &InferenceEngine,
    aggregators: &AsyncMutex<HashMap<String, CameraAggregator>>,
    camera_lookup: &HashMap<String, CameraSpec>,
    buffer_pool: &BufferPool,
) {
    let frame_refs: Vec<&Frame> = batch.iter().map(|d| &d.frame).collect();
    let detection_sets = match engine.detect_batch(&frame_refs) {
        Ok(sets) => sets,
        Err(e) => {
            log::warn!("inference: batch detection failed: {e}");
            for due in &mut batch {
                release_frame(&mut due.frame, buffer_pool);
            }
            return;
        }
    };

    for (mut due, detection_set) in batch.into_iter().zip(detection_sets) {
        let Some(camera) = camera_lookup.get(&due.camera_id).cloned() else {
            release_frame(&mut due.frame, buffer_pool);
            continue;
        };

        let mut detections = detection_set.detections;
        for d in &mut detections {
            d.zone_label = zone_for(&camera, d.x + d.w / 2, d.y + d.h / 2);
        }

        let now = chrono::Utc::now();
        let mut finalized_windows = Vec::new();
        {
            let mut guard = aggregators.lock().await;
            if let Some(agg) = guard.get_mut(&due.camera_id) {
                for (idx, d) in detections.iter().enumerate() {
                    let store_sequence = detection_set.sequence.wrapping_mul(1000).wrapping_add(idx as u64);
                    if let Err(e) = store.insert_detection(d, store_sequence) {
                        log::error!("camera {}: failed to persist detection: {e}", due.camera_id);
                    }
                    finalized_windows.extend(agg.absorb(d, now));
                }
            }
        }
        for metric in finalized_windows {
            if let Err(e) = store.insert_windowed_metric(&metric) {
                log::error!("camera {}: failed to persist windowed metric: {e}", due.camera_id);
            }
        }

        if due.is_keyframe_tick {
            match engine.caption(&camera, &due.frame, &detections) {
                Ok(key_frame) => {
                    if let Err(e) = store.insert_key_frame(&key_frame) {
                        log::error!("camera {}: failed to persist key frame: {e}", due.camera_id);
                    }
                }
                Err(e) => log::warn!("camera {}: captioning failed: {e}", due.camera_id),
            }
        }

        release_frame(&mut due.frame, buffer_pool);
    }
}

fn zone_for(camera: &CameraSpec, x: i32, y: i32) -> Option<String> {
    camera.zones.iter().find(|z| z.contains(x, y)).map(|z| z.label.clone())
}

fn release_frame(frame: &mut Frame, pool: &BufferPool) {
    let id = frame.buffer_id();
    if let Some(buf) = frame.take_buffer() {
        pool.return_buffer(id, buf);
    }
}
