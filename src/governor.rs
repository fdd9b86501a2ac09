//! # Thermal & Memory Governor
//!
//! Samples CPU temperature and process memory on a fixed interval and derives a
//! [`ThrottleLevel`] with hysteresis: moving up a level requires crossing the higher
//! threshold, moving back down requires dropping a full band below it, so the agent
//! doesn't flap between levels when a reading sits right at a boundary.
//!
//! Effects of each level are read by other components rather than pushed by the
//! governor — the scheduler multiplies its capture interval by `interval_multiplier()`
//! and drops its lowest-priority camera at `Hot`, the inference dispatch loop shrinks
//! its batch size via `detection_batch_size()`, and two consecutive `Critical` samples
//! trigger the emergency shutdown path in the Lifecycle Supervisor.

use crate::config::AgentConfig;
use crate::core::buffer_pool::BufferPool;
use crate::model::{GovernorState, ThrottleLevel};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::watch;

const DOWNGRADE_MARGIN_CELSIUS: f32 = 5.0;
const DEFAULT_DETECTION_BATCH_SIZE: usize = 8;

pub struct Governor {
    config: AgentConfig,
    buffer_pool: Arc<BufferPool>,
    level: AtomicU8,
    critical_streak: AtomicU8,
    restart_requested: AtomicBool,
    state_tx: watch::Sender<GovernorState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorEvent {
    LevelChanged(ThrottleLevel),
    EmergencyShutdown,
}

impl Governor {
    pub fn new(config: AgentConfig, buffer_pool: Arc<BufferPool>) -> (Self, watch::Receiver<GovernorState>) {
        let (state_tx, state_rx) = watch::channel(GovernorState::default());
        (
            Self {
                config,
                buffer_pool,
                level: AtomicU8::new(ThrottleLevel::Normal as u8),
                critical_streak: AtomicU8::new(0),
                restart_requested: AtomicBool::new(false),
                state_tx,
            },
            state_rx,
        )
    }

    pub fn level(&self) -> ThrottleLevel {
        throttle_from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Multiplies the scheduler's nominal capture interval. `Warm` slows capture down,
    /// `Hot`/`Critical` slow it further; `Normal` is a no-op.
    pub fn interval_multiplier(&self) -> f64 {
        match self.level() {
            ThrottleLevel::Normal => 1.0,
            ThrottleLevel::Warm => 1.5,
            ThrottleLevel::Hot => 2.0,
            ThrottleLevel::Critical => 4.0,
        }
    }

    pub fn replication_batch_divisor(&self) -> usize {
        match self.level() {
            ThrottleLevel::Hot | ThrottleLevel::Critical => 2,
            _ => 1,
        }
    }

    /// Detection batch size B, halved once the level reaches `Hot`.
    pub fn detection_batch_size(&self) -> usize {
        match self.level() {
            ThrottleLevel::Normal | ThrottleLevel::Warm => DEFAULT_DETECTION_BATCH_SIZE,
            ThrottleLevel::Hot | ThrottleLevel::Critical => DEFAULT_DETECTION_BATCH_SIZE / 2,
        }
    }

    /// Whether the scheduler should stop dispatching new frames entirely: only at
    /// `Critical`, where the spec's effect is "stop accepting new frames".
    pub fn accepting_new_frames(&self) -> bool {
        self.level() != ThrottleLevel::Critical
    }

    /// Whether the scheduler should skip its lowest-priority enabled camera, per the
    /// `Hot` effect "reduce active camera count by one (lowest-priority first)". Also
    /// true at `Critical` since that level drops every camera via `accepting_new_frames`.
    pub fn should_drop_lowest_priority_camera(&self) -> bool {
        self.level() >= ThrottleLevel::Hot
    }

    /// Consumes a pending graceful-restart request raised on entry to `Critical`. A
    /// caller that observes `true` is responsible for scheduling the restart; the flag
    /// is cleared so the same request isn't acted on twice.
    pub fn take_restart_request(&self) -> bool {
        self.restart_requested.swap(false, Ordering::Relaxed)
    }

    pub fn restart_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.governor.restart_grace_minutes * 60)
    }

    #[cfg(test)]
    pub fn set_level_for_test(&self, level: ThrottleLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// One sampling tick. Returns an event when the level changes or an emergency
    /// shutdown condition is reached.
    pub async fn sample_once(&self) -> Option<GovernorEvent> {
        let cpu_temp = read_cpu_temp_celsius().unwrap_or(60.0);
        let cpu_utilisation = read_cpu_utilisation_pct().unwrap_or(0.0);
        let working_set_mb = read_working_set_mb().unwrap_or(0.0);

        let previous = self.state_tx.borrow().clone();
        let growth_mb_per_hour = if self.config.governor.sample_interval_secs > 0 {
            let elapsed_hours = self.config.governor.sample_interval_secs as f64 / 3600.0;
            (working_set_mb - previous.working_set_mb) / elapsed_hours.max(1e-9)
        } else {
            0.0
        };

        let new_level = self.derive_level(cpu_temp, working_set_mb, growth_mb_per_hour);
        let old_level = self.level();

        let state = GovernorState {
            cpu_temp_celsius: cpu_temp,
            cpu_utilisation_pct: cpu_utilisation,
            working_set_mb,
            growth_mb_per_hour,
            level: new_level,
        };
        let _ = self.state_tx.send(state);

        if new_level == ThrottleLevel::Critical && old_level != ThrottleLevel::Critical {
            self.buffer_pool.force_compact();
            self.restart_requested.store(true, Ordering::Relaxed);
        }

        if new_level == ThrottleLevel::Critical {
            let streak = self.critical_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= 2 {
                return Some(GovernorEvent::EmergencyShutdown);
            }
        } else {
            self.critical_streak.store(0, Ordering::Relaxed);
        }

        if new_level != old_level {
            self.level.store(new_level as u8, Ordering::Relaxed);
            log::warn!("governor: throttle level {old_level:?} -> {new_level:?} (cpu={cpu_temp:.1}C mem={working_set_mb:.0}MB growth={growth_mb_per_hour:.1}MB/h)");
            return Some(GovernorEvent::LevelChanged(new_level));
        }

        None
    }

    fn derive_level(&self, cpu_temp: f32, working_set_mb: f64, growth_mb_per_hour: f64) -> ThrottleLevel {
        let g = &self.config.governor;
        let current = self.level();

        let temp_level = if cpu_temp >= g.critical_temp_celsius {
            ThrottleLevel::Critical
        } else if cpu_temp >= g.hot_temp_celsius {
            ThrottleLevel::Hot
        } else if cpu_temp >= g.warm_temp_celsius {
            ThrottleLevel::Warm
        } else {
            ThrottleLevel::Normal
        };

        let memory_level = if working_set_mb >= g.memory_critical_mb {
            ThrottleLevel::Critical
        } else if working_set_mb >= g.memory_hot_mb {
            ThrottleLevel::Hot
        } else if working_set_mb >= g.memory_warn_mb {
            ThrottleLevel::Warm
        } else {
            ThrottleLevel::Normal
        };

        let growth_level = if growth_mb_per_hour >= g.growth_critical_mb_per_hour {
            ThrottleLevel::Critical
        } else if growth_mb_per_hour >= g.growth_hot_mb_per_hour {
            ThrottleLevel::Hot
        } else if growth_mb_per_hour >= g.growth_warm_mb_per_hour {
            ThrottleLevel::Warm
        } else {
            ThrottleLevel::Normal
        };

        let candidate = temp_level.max(memory_level).max(growth_level);

        // Hysteresis only applies to stepping down from the thermal signal: a candidate
        // below the current level must clear a downgrade margin before we act on it.
        if candidate < current && cpu_temp > thermal_floor(current, g) - DOWNGRADE_MARGIN_CELSIUS {
            current
        } else {
            candidate
        }
    }
}

fn thermal_floor(level: ThrottleLevel, g: &crate::config::GovernorConfig) -> f32 {
    match level {
        ThrottleLevel::Normal => 0.0,
        ThrottleLevel::Warm => g.warm_temp_celsius,
        ThrottleLevel::Hot => g.hot_temp_celsius,
        ThrottleLevel::Critical => g.critical_temp_celsius,
    }
}

fn throttle_from_u8(v: u8) -> ThrottleLevel {
    match v {
        0 => ThrottleLevel::Normal,
        1 => ThrottleLevel::Warm,
        2 => ThrottleLevel::Hot,
        _ => ThrottleLevel::Critical,
    }
}

/// Reads the first available thermal zone under `/sys/class/thermal`. Returns `None`
/// on platforms without that interface (tests, non-Linux).
fn read_cpu_temp_celsius() -> Option<f32> {
    for zone in 0..4 {
        let path = format!("/sys/class/thermal/thermal_zone{zone}/temp");
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(millidegrees) = raw.trim().parse::<f32>() {
                return Some(millidegrees / 1000.0);
            }
        }
    }
    None
}

fn read_cpu_utilisation_pct() -> Option<f32> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let one_min: f32 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4) as f32;
    Some((one_min / cpus * 100.0).min(100.0))
}

fn read_working_set_mb() -> Option<f64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: f64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb / 1024.0);
        }
    }
    None
}
