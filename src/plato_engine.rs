//! # Plato Engine - Adaptive Admission Control
//!
//! A lock-light sliding-window statistics engine and a closed-loop CPU load
//! shedder. Request outcomes are counted into time buckets, a sampling driver
//! feeds host CPU usage through an overload classifier and a PID controller,
//! and callers ask the admission gate whether to shed the next request.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              PLATO ENGINE                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  LOAD SOURCE → CPU SAMPLER → OVERLOAD MONITOR ─┐                             │
//! │                     │                          ├→ ADMISSION GATE → caller    │
//! │                     └──────→ PID CONTROLLER ───┘                             │
//! │                                                                             │
//! │  ENTRY (enter/exit/error) → LEAP ARRAY → SLIDING WINDOW METRIC → METRICS     │
//! │                                               ↑                              │
//! │                       CALCULATE MANAGER → EXECUTOR POOL                      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Lock-light statistics**: atomically published buckets with a per-slot
//!   reset guard, atomic counters inside a live bucket
//! - **Noise-resistant overload detection**: z-score filtering plus
//!   consecutive-hit hysteresis, or raw thresholds with a dwell re-check
//! - **Anti-windup PID**: integral rollback while the output is saturated
//! - **Relay auto-tuning**: Ziegler-Nichols gains from a bang-bang experiment
//! - **Explicit lifecycles**: every background loop is owned, started once and
//!   stoppable
//!
//! ## Author
//!
//! Plato Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet, VecDeque};
use std::f64::consts::PI;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::hash::{BuildHasher, Hash, Hasher};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{
    AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering as AtomicOrdering,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam_channel::{
    bounded, select, tick, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use crossbeam_utils::Backoff;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Lock-Free Data Structures
// ----------------------------------------------------------------------------
use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use once_cell::sync::OnceCell;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Toml};
use figment::Figment;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version from Cargo.toml
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name
pub const ENGINE_NAME: &str = "plato";

/// Full engine name for display
pub const ENGINE_FULL_NAME: &str = "Plato Admission Control Engine";

// ----------------------------------------------------------------------------
// Statistics Constants
// ----------------------------------------------------------------------------

/// Min-rt of a bucket that has not recorded a response time, and the value
/// `LeapArray::min_rt` reports when no bucket has data.
pub const DEFAULT_STATISTIC_MAX_RT: i64 = 60_000;

/// Default number of buckets per entry window.
pub const DEFAULT_SAMPLE_COUNT: u32 = 20;

/// Default entry window length in milliseconds.
pub const DEFAULT_INTERVAL_MS: u32 = 2_000;

/// Cadence of the background metric recalculation loop.
pub const DEFAULT_CALCULATE_INTERVAL: Duration = Duration::from_millis(10);

// ----------------------------------------------------------------------------
// Control Constants
// ----------------------------------------------------------------------------

/// Upper clamp of the PID output; the output is a negative reject intensity.
pub const OUT_MAX: f64 = 0.0;

/// Lower clamp of the PID output, in basis points of rejection.
pub const OUT_MIN: f64 = -10_000.0;

/// Scale of reject ratios: 10000 means "reject everything".
pub const REJECT_RATIO_SCALE: u32 = 10_000;

/// Sampling cadence of the CPU sampler and the limiter driver.
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_millis(100);

/// Default upper CPU threshold of a standalone monitor.
pub const DEFAULT_UPPER_THRESHOLD: f64 = 0.9;

/// Default lower CPU threshold of a standalone monitor.
pub const DEFAULT_LOWER_THRESHOLD: f64 = DEFAULT_UPPER_THRESHOLD * 0.9;

/// Default z-score critical value.
pub const DEFAULT_ZSCORE: f64 = 2.4;

/// How long a raw threshold crossing must persist before it commits.
pub const DEFAULT_DWELL: Duration = Duration::from_secs(6);

/// Consecutive filtered-mean hits the z-score monitor needs to flip state.
pub const DEFAULT_CONTINUOUS_TIMES: u32 = 30;

/// Margin around the set-point that forms the hysteresis band.
pub const DEFAULT_DRIFT: f64 = 0.1;

/// Capacity of the CPU sample window.
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// Expiry of the CPU sample window.
pub const DEFAULT_WINDOW_EXPIRE: Duration = Duration::from_secs(6);

/// PID gains tuned for HTTP services.
pub const HTTP_DEFAULT_GAINS: (f64, f64, f64) = (5351.821461335851, 12.030101184005932, 0.03);

/// PID gains tuned for HTTP services when usage above 100% is admitted.
pub const HTTP_OVERLOAD_SCENE_GAINS: (f64, f64, f64) =
    (5130.083602420542, 44.491571338644654, 123658.09189447836);

// ----------------------------------------------------------------------------
// Relay Tuner Constants
// ----------------------------------------------------------------------------

const TUNER_KP_FACTOR: f64 = 0.2;
const TUNER_TI_DIVISOR: f64 = 2.0;
const TUNER_TD_FACTOR: f64 = 0.333;
const TUNER_CYCLES: u32 = 400;
const TUNER_LOOP_INTERVAL_MS: f64 = 100.0;
const TUNER_OUTPUT_HIGH: f64 = OUT_MAX;
const TUNER_OUTPUT_LOW: f64 = OUT_MIN;

// ----------------------------------------------------------------------------
// Load Source Paths
// ----------------------------------------------------------------------------

const PROC_STAT_PATH: &str = "/proc/stat";
const CGROUP_V1_SELF_PATH: &str = "/proc/self/cgroup";
const CGROUP_V1_PREFIX: &str = "/sys/fs/cgroup/cpu,cpuacct";
const CGROUP_V1_CONTROLLER: &str = "cpu,cpuacct";
const CGROUP_V2_INIT_PATH: &str = "/proc/1/cgroup";
const CGROUP_V2_PREFIX: &str = "/sys/fs/cgroup";
const CGROUP_V2_SCOPE_SUFFIX: &str = "/init.scope";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Clock
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch.
#[inline]
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Nanoseconds since the Unix epoch.
#[inline]
pub fn current_time_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------------
// 3.2 Atomic Float
// ----------------------------------------------------------------------------

/// An atomic f64 stored as its IEEE-754 bit pattern in an `AtomicU64`.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    #[inline]
    pub const fn new(val: f64) -> Self {
        Self {
            bits: AtomicU64::new(val.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> f64 {
        f64::from_bits(self.bits.load(ordering))
    }

    #[inline]
    pub fn store(&self, val: f64, ordering: AtomicOrdering) {
        self.bits.store(val.to_bits(), ordering);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: f64,
        new: f64,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<f64, f64> {
        self.bits
            .compare_exchange(current.to_bits(), new.to_bits(), success, failure)
            .map(f64::from_bits)
            .map_err(f64::from_bits)
    }

    /// Replace the value through a CAS retry loop and return the previous one.
    pub fn set(&self, val: f64) -> f64 {
        let mut current = self.load(AtomicOrdering::Acquire);
        loop {
            match self.compare_exchange(current, val, AtomicOrdering::AcqRel, AtomicOrdering::Acquire) {
                Ok(prev) => return prev,
                Err(actual) => current = actual,
            }
        }
    }

    /// Add a value atomically (using CAS loop).
    pub fn fetch_add(&self, val: f64, ordering: AtomicOrdering) -> f64 {
        let mut current = self.load(AtomicOrdering::Relaxed);
        loop {
            match self.compare_exchange(current, current + val, ordering, AtomicOrdering::Relaxed) {
                Ok(v) => return v,
                Err(v) => current = v,
            }
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Metric Events
// ----------------------------------------------------------------------------

/// Event kinds counted per time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricEvent {
    /// Admitted request
    Pass,
    /// Request rejected by a rule
    Block,
    /// Completed request
    Complete,
    /// Request that reported an error
    Error,
    /// Response-time sum in milliseconds
    Rt,
}

impl MetricEvent {
    pub const COUNT: usize = 5;

    pub const ALL: [MetricEvent; MetricEvent::COUNT] = [
        MetricEvent::Pass,
        MetricEvent::Block,
        MetricEvent::Complete,
        MetricEvent::Error,
        MetricEvent::Rt,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricEvent::Pass => "pass",
            MetricEvent::Block => "block",
            MetricEvent::Complete => "complete",
            MetricEvent::Error => "error",
            MetricEvent::Rt => "rt",
        }
    }
}

impl Display for MetricEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Dynamic Points - Constant or Computed Thresholds
// ----------------------------------------------------------------------------

/// A value that is either fixed or re-evaluated on every read. Used for
/// PID set-points and monitor thresholds that can move at runtime.
#[derive(Clone)]
pub enum DynamicPoint {
    Fixed(f64),
    Dynamic(Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl DynamicPoint {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        DynamicPoint::Dynamic(Arc::new(f))
    }

    #[inline]
    pub fn value(&self) -> f64 {
        match self {
            DynamicPoint::Fixed(v) => *v,
            DynamicPoint::Dynamic(f) => f(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, DynamicPoint::Dynamic(_))
    }
}

impl From<f64> for DynamicPoint {
    fn from(v: f64) -> Self {
        DynamicPoint::Fixed(v)
    }
}

impl Debug for DynamicPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DynamicPoint::Fixed(v) => f.debug_tuple("Fixed").field(v).finish(),
            DynamicPoint::Dynamic(func) => f.debug_tuple("Dynamic").field(&func()).finish(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.5 Fast Random - Per-Thread Xorshift
// ----------------------------------------------------------------------------

thread_local! {
    static FAST_RAND_STATE: Cell<u32> = Cell::new(fast_rand_seed());
}

fn fast_rand_seed() -> u32 {
    let mut hasher = RandomState::new().build_hasher();
    thread::current().id().hash(&mut hasher);
    current_time_nanos().hash(&mut hasher);
    match hasher.finish() as u32 {
        0 => 0x9E37_79B9,
        seed => seed,
    }
}

/// Next value of the calling thread's xorshift32 generator.
#[inline]
pub fn fast_rand_u32() -> u32 {
    FAST_RAND_STATE.with(|state| {
        let mut x = state.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        state.set(x);
        x
    })
}

/// Uniform draw in `[0, n)` using the multiply-shift reduction.
#[inline]
pub fn fast_rand_u32n(n: u32) -> u32 {
    ((fast_rand_u32() as u64 * n as u64) >> 32) as u32
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Configuration mistakes fail at construction. Transient read failures are
// logged by the component that sees them and never escape a background loop.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the Plato engine.
#[derive(Error, Debug)]
pub enum PlatoError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Statistics error: {0}")]
    Stat(#[from] StatError),

    #[error("Load source error: {0}")]
    LoadSource(#[from] LoadSourceError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("reject by rule")]
    RejectedByRule,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlatoError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            PlatoError::Config(_) => false,
            PlatoError::Stat(e) => !matches!(e, StatError::InvalidWindow { .. }),
            PlatoError::LoadSource(_) => true,
            PlatoError::Executor(e) => e.is_recoverable(),
            PlatoError::RejectedByRule => true,
            PlatoError::Io(_) => true,
            PlatoError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PlatoError::Config(_) => "config",
            PlatoError::Stat(_) => "stat",
            PlatoError::LoadSource(_) => "load_source",
            PlatoError::Executor(_) => "executor",
            PlatoError::RejectedByRule => "rejected",
            PlatoError::Io(_) => "io",
            PlatoError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Statistics Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatError {
    #[error("invalid window: {interval_ms}ms is not divisible into {sample_count} buckets")]
    InvalidWindow { sample_count: u32, interval_ms: u32 },

    #[error("time behind: now {now_ms}ms is older than bucket start {bucket_start_ms}ms")]
    TimeBehind { now_ms: u64, bucket_start_ms: u64 },
}

// ----------------------------------------------------------------------------
// 4.4 Load Source Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum LoadSourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("usage counter did not advance")]
    Unchanged,

    #[error("no previous reading to diff against")]
    NotInitialized,

    #[error("load source unsupported: {0}")]
    Unsupported(String),
}

impl LoadSourceError {
    fn io(path: &Path, source: io::Error) -> Self {
        LoadSourceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn parse(path: &Path, message: impl Into<String>) -> Self {
        LoadSourceError::Parse {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Executor Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("task rejected: queue is full")]
    Rejected,

    #[error("task result not ready within {0:?}")]
    Timeout(Duration),

    #[error("executor pool is closed")]
    Closed,

    #[error("panic occur: {0}")]
    Panicked(String),

    #[error("task failed: {0}")]
    Failed(String),

    #[error("invalid executor argument: {0}")]
    InvalidArgument(String),
}

impl ExecutorError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ExecutorError::Closed | ExecutorError::InvalidArgument(_))
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for Plato operations
pub type PlatoResult<T> = Result<T, PlatoError>;

/// Result type for statistics operations
pub type StatResult<T> = Result<T, StatError>;

/// Result type for load source reads
pub type LoadResult<T> = Result<T, LoadSourceError>;

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Render a caught panic payload for logs and errors.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file with PLATO_* environment overrides, validated on load.
// Every field has a default so an empty file is a valid configuration.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine and the `plato` binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatoConfig {
    /// Admission gate settings
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Overload classifier settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// CPU sampler settings
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Per-entry statistics window
    #[serde(default)]
    pub stats: StatsConfig,

    /// Metric recalculation pool
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PlatoConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PLATO_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without environment overrides.
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limiter = &self.limiter;
        if !(0.0..=1.0).contains(&limiter.cpu_threshold) {
            return Err(ConfigError::invalid_value(
                "limiter.cpu_threshold",
                "cpu usage threshold should be in 0 ~ 1",
            ));
        }
        if limiter.drift < 0.0 {
            return Err(ConfigError::invalid_value("limiter.drift", "drift cannot be negative"));
        }
        if limiter.sampling_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "limiter.sampling_interval",
                "sampling interval must be positive",
            ));
        }

        let monitor = &self.monitor;
        for (field, value) in [
            ("monitor.upper_threshold", monitor.upper_threshold),
            ("monitor.lower_threshold", monitor.lower_threshold),
        ] {
            if value.map_or(false, |v| !(0.0..=1.0).contains(&v)) {
                return Err(ConfigError::invalid_value(field, "threshold should be in 0 ~ 1"));
            }
        }
        if let (Some(lower), Some(upper)) = (monitor.lower_threshold, monitor.upper_threshold) {
            if lower > upper {
                return Err(ConfigError::invalid_value(
                    "monitor.lower_threshold",
                    format!("lower threshold {} exceeds upper threshold {}", lower, upper),
                ));
            }
        }
        if monitor.score <= 0.0 {
            return Err(ConfigError::invalid_value("monitor.score", "z-score must be positive"));
        }

        if self.sampler.interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "sampler.interval",
                "sampling interval must be positive",
            ));
        }

        let stats = &self.stats;
        if stats.sample_count == 0 || stats.interval_ms % stats.sample_count != 0 {
            return Err(ConfigError::invalid_value(
                "stats.sample_count",
                format!(
                    "{}ms window is not divisible into {} buckets",
                    stats.interval_ms, stats.sample_count
                ),
            ));
        }

        if self.executor.workers == 0 {
            return Err(ConfigError::invalid_value("executor.workers", "need at least one worker"));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Limiter Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Target CPU usage the PID drives toward
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,

    /// PID gains; any missing gain falls back to the HTTP defaults
    #[serde(default)]
    pub kp: Option<f64>,
    #[serde(default)]
    pub ki: Option<f64>,
    #[serde(default)]
    pub kd: Option<f64>,

    /// Log a status line on every tick
    #[serde(default = "default_true")]
    pub enable_metric: bool,

    /// Let the PID see usage above 100%
    #[serde(default)]
    pub enable_overload_scene: bool,

    /// Half-width of the hysteresis band around the set-point
    #[serde(default = "default_drift")]
    pub drift: f64,

    /// Driver cadence
    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub sampling_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: default_cpu_threshold(),
            kp: None,
            ki: None,
            kd: None,
            enable_metric: true,
            enable_overload_scene: false,
            drift: default_drift(),
            sampling_interval: default_sampling_interval(),
        }
    }
}

fn default_cpu_threshold() -> f64 {
    0.8
}

fn default_drift() -> f64 {
    DEFAULT_DRIFT
}

fn default_sampling_interval() -> Duration {
    DEFAULT_SAMPLING_INTERVAL
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Monitor Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Overload classifier
    #[serde(default = "default_limiter_alg")]
    pub alg: MonitorAlg,

    /// Fixed monitor bounds. An unset bound follows the limiter set-point
    /// plus or minus `limiter.drift`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_threshold: Option<f64>,

    /// Z-score critical value
    #[serde(default = "default_score")]
    pub score: f64,

    /// Raw monitor re-check delay
    #[serde(default = "default_dwell", with = "humantime_serde")]
    pub dwell: Duration,

    /// Consecutive hits the z-score monitor needs
    #[serde(default = "default_continuous_times")]
    pub continuous_times: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            alg: default_limiter_alg(),
            upper_threshold: None,
            lower_threshold: None,
            score: default_score(),
            dwell: default_dwell(),
            continuous_times: default_continuous_times(),
        }
    }
}

fn default_limiter_alg() -> MonitorAlg {
    MonitorAlg::ZScore
}

fn default_score() -> f64 {
    DEFAULT_ZSCORE
}

fn default_dwell() -> Duration {
    DEFAULT_DWELL
}

fn default_continuous_times() -> u32 {
    DEFAULT_CONTINUOUS_TIMES
}

// ----------------------------------------------------------------------------
// 5.4 Sampler Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Where CPU usage comes from
    #[serde(default)]
    pub source: LoadSourceKind,

    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Samples kept for the z-score monitor
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,

    #[serde(default = "default_window_expire", with = "humantime_serde")]
    pub window_expire: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            source: LoadSourceKind::default(),
            interval: default_sampling_interval(),
            window_capacity: default_window_capacity(),
            window_expire: default_window_expire(),
        }
    }
}

fn default_window_capacity() -> usize {
    DEFAULT_WINDOW_CAPACITY
}

fn default_window_expire() -> Duration {
    DEFAULT_WINDOW_EXPIRE
}

// ----------------------------------------------------------------------------
// 5.5 Statistics & Executor Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_sample_count")]
    pub sample_count: u32,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u32,

    /// Cadence of background metric recalculation
    #[serde(default = "default_calculate_interval", with = "humantime_serde")]
    pub calculate_interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            sample_count: default_sample_count(),
            interval_ms: default_interval_ms(),
            calculate_interval: default_calculate_interval(),
        }
    }
}

fn default_sample_count() -> u32 {
    DEFAULT_SAMPLE_COUNT
}

fn default_interval_ms() -> u32 {
    DEFAULT_INTERVAL_MS
}

fn default_calculate_interval() -> Duration {
    DEFAULT_CALCULATE_INTERVAL
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: default_queue_size(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    1024
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ----------------------------------------------------------------------------
// 5.7 Configuration Hot-Reload
// ----------------------------------------------------------------------------

type ReloadCallback = Box<dyn Fn(&PlatoConfig) + Send + Sync>;

/// Holds the active configuration and notifies listeners on change.
pub struct ConfigManager {
    config: ArcSwap<PlatoConfig>,
    config_path: Option<PathBuf>,
    callbacks: RwLock<Vec<ReloadCallback>>,
}

impl ConfigManager {
    pub fn new(config: PlatoConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            config_path: None,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = PlatoConfig::load(&path)?;
        let mut manager = Self::new(config);
        manager.config_path = Some(path.as_ref().to_path_buf());
        Ok(manager)
    }

    pub fn get(&self) -> Arc<PlatoConfig> {
        self.config.load_full()
    }

    /// Validate and publish a new configuration, then run the callbacks.
    pub fn update(&self, config: PlatoConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        self.config.store(Arc::clone(&config));

        for callback in self.callbacks.read().iter() {
            callback(&config);
        }
        Ok(())
    }

    pub fn reload(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.config_path {
            let config = PlatoConfig::load(path)?;
            self.update(config)?;
        }
        Ok(())
    }

    pub fn on_reload<F>(&self, callback: F)
    where
        F: Fn(&PlatoConfig) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Box::new(callback));
    }
}

impl Debug for ConfigManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config", &*self.config.load())
            .field("config_path", &self.config_path)
            .finish()
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> PlatoResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let result = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    result.map_err(|e| PlatoError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "plato::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: TIME BUCKETS & LEAP ARRAY
// ============================================================================
// A fixed ring of slots covering one window. Each slot publishes an immutable
// (start, counters) pair through an ArcSwapOption, so a reader either sees the
// old epoch or the new one, never a half-reset slot. Rolling a slot into a new
// epoch is serialized by a per-slot `updating` flag; counters inside a live
// bucket are plain atomic adds.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Time Bucket - Counters for One Slice
// ----------------------------------------------------------------------------

/// Atomic counters for one bucket-length slice of time.
#[derive(Debug)]
pub struct TimeBucket {
    counters: [AtomicI64; MetricEvent::COUNT],
    min_rt: AtomicI64,
}

impl TimeBucket {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicI64::new(0)),
            min_rt: AtomicI64::new(DEFAULT_STATISTIC_MAX_RT),
        }
    }

    /// Add `count` to `event`. Response times also fold into the bucket minimum.
    #[inline]
    pub fn add(&self, event: MetricEvent, count: i64) {
        if event == MetricEvent::Rt {
            self.add_rt(count);
        } else {
            self.counters[event.index()].fetch_add(count, AtomicOrdering::Relaxed);
        }
    }

    #[inline]
    pub fn add_rt(&self, rt: i64) {
        self.counters[MetricEvent::Rt.index()].fetch_add(rt, AtomicOrdering::Relaxed);
        self.min_rt.fetch_min(rt, AtomicOrdering::Relaxed);
    }

    #[inline]
    pub fn get(&self, event: MetricEvent) -> i64 {
        self.counters[event.index()].load(AtomicOrdering::Relaxed)
    }

    /// Smallest response time recorded, or `DEFAULT_STATISTIC_MAX_RT`.
    #[inline]
    pub fn min_rt(&self) -> i64 {
        self.min_rt.load(AtomicOrdering::Relaxed)
    }
}

impl Default for TimeBucket {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// 7.2 Bucket Slot - A Bucket Bound to Its Epoch
// ----------------------------------------------------------------------------

/// A bucket together with the start of the time span it covers. Never
/// mutated across epochs; a stale slot is replaced wholesale.
#[derive(Debug)]
pub struct BucketSlot {
    start_ms: u64,
    bucket: TimeBucket,
}

impl BucketSlot {
    fn new(start_ms: u64) -> Self {
        Self {
            start_ms,
            bucket: TimeBucket::new(),
        }
    }

    #[inline]
    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    #[inline]
    pub fn bucket(&self) -> &TimeBucket {
        &self.bucket
    }

    /// True when the slot lies outside the live window `(now - interval, now]`,
    /// i.e. `now - start >= interval` or the slot starts in the future.
    #[inline]
    pub fn is_deprecated(&self, now_ms: u64, interval_ms: u64) -> bool {
        self.start_ms > now_ms || now_ms - self.start_ms >= interval_ms
    }
}

#[derive(Debug)]
struct LeapSlot {
    current: ArcSwapOption<BucketSlot>,
    updating: AtomicBool,
}

impl LeapSlot {
    fn empty() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            updating: AtomicBool::new(false),
        }
    }
}

// ----------------------------------------------------------------------------
// 7.3 Leap Array
// ----------------------------------------------------------------------------

/// Circular array of time buckets implementing a sliding window.
#[derive(Debug)]
pub struct LeapArray {
    bucket_length_ms: u32,
    sample_count: u32,
    interval_ms: u32,
    slots: Box<[LeapSlot]>,
}

impl LeapArray {
    /// Create a window of `sample_count` buckets spanning `interval_ms`.
    /// The window must divide evenly into buckets.
    pub fn new(sample_count: u32, interval_ms: u32) -> StatResult<Self> {
        if sample_count == 0 || interval_ms == 0 || interval_ms % sample_count != 0 {
            return Err(StatError::InvalidWindow {
                sample_count,
                interval_ms,
            });
        }

        Ok(Self::build(sample_count, interval_ms))
    }

    fn build(sample_count: u32, interval_ms: u32) -> Self {
        let slots: Vec<LeapSlot> = (0..sample_count).map(|_| LeapSlot::empty()).collect();
        Self {
            bucket_length_ms: interval_ms / sample_count,
            sample_count,
            interval_ms,
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn bucket_length_ms(&self) -> u32 {
        self.bucket_length_ms
    }

    #[inline]
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    #[inline]
    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    /// Slot index covering `now_ms`.
    #[inline]
    pub fn index_of(&self, now_ms: u64) -> usize {
        ((now_ms / self.bucket_length_ms as u64) % self.sample_count as u64) as usize
    }

    /// Start of the bucket covering `now_ms`.
    #[inline]
    pub fn bucket_start_of(&self, now_ms: u64) -> u64 {
        now_ms - now_ms % self.bucket_length_ms as u64
    }

    pub fn current_bucket(&self) -> StatResult<Arc<BucketSlot>> {
        self.current_bucket_of_time(current_time_millis())
    }

    /// Resolve the slot covering `now_ms`, rolling it into the current epoch
    /// when it still holds an older one.
    pub fn current_bucket_of_time(&self, now_ms: u64) -> StatResult<Arc<BucketSlot>> {
        let slot = &self.slots[self.index_of(now_ms)];
        let bucket_start = self.bucket_start_of(now_ms);
        let backoff = Backoff::new();

        loop {
            let old = slot.current.load_full();
            match old {
                Some(ref b) if b.start_ms == bucket_start => return Ok(Arc::clone(b)),
                Some(ref b) if bucket_start < b.start_ms => {
                    if self.sample_count == 1 {
                        return Ok(Arc::clone(b));
                    }
                    return Err(StatError::TimeBehind {
                        now_ms,
                        bucket_start_ms: b.start_ms,
                    });
                }
                _ => {
                    if !Self::try_roll(slot, bucket_start) {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    /// Replace a stale or empty slot. Only the caller that wins the
    /// `updating` flag writes; everyone else retries.
    fn try_roll(slot: &LeapSlot, bucket_start: u64) -> bool {
        if slot
            .updating
            .compare_exchange(false, true, AtomicOrdering::Acquire, AtomicOrdering::Relaxed)
            .is_err()
        {
            return false;
        }

        let stale = match &*slot.current.load() {
            Some(b) => b.start_ms < bucket_start,
            None => true,
        };
        if stale {
            slot.current.store(Some(Arc::new(BucketSlot::new(bucket_start))));
            trace!(target: "plato::stat", bucket_start, "bucket rolled");
        }

        slot.updating.store(false, AtomicOrdering::Release);
        true
    }

    pub fn add_count(&self, event: MetricEvent, count: i64) {
        self.add_count_with_time(current_time_millis(), event, count);
    }

    pub fn add_count_with_time(&self, now_ms: u64, event: MetricEvent, count: i64) {
        match self.current_bucket_of_time(now_ms) {
            Ok(slot) => slot.bucket.add(event, count),
            Err(e) => warn!(target: "plato::stat", error = %e, %event, "dropping count"),
        }
    }

    /// Live slots as of `now_ms` in chronological order.
    pub fn values_with_time(&self, now_ms: u64) -> Vec<Arc<BucketSlot>> {
        self.values_conditional(now_ms, |_| true)
    }

    pub fn values(&self) -> Vec<Arc<BucketSlot>> {
        self.values_with_time(current_time_millis())
    }

    /// Live slots whose start satisfies `predicate`, in chronological order.
    /// Reads never create or roll slots.
    pub fn values_conditional<P>(&self, now_ms: u64, predicate: P) -> Vec<Arc<BucketSlot>>
    where
        P: Fn(u64) -> bool,
    {
        let interval = self.interval_ms as u64;
        let mut live: Vec<Arc<BucketSlot>> = self
            .slots
            .iter()
            .filter_map(|slot| slot.current.load_full())
            .filter(|b| !b.is_deprecated(now_ms, interval) && predicate(b.start_ms))
            .collect();
        live.sort_by_key(|b| b.start_ms);
        live
    }

    pub fn count_with_time(&self, now_ms: u64, event: MetricEvent) -> i64 {
        self.values_with_time(now_ms)
            .iter()
            .map(|b| b.bucket.get(event))
            .sum()
    }

    pub fn count(&self, event: MetricEvent) -> i64 {
        self.count_with_time(current_time_millis(), event)
    }

    pub fn min_rt_with_time(&self, now_ms: u64) -> i64 {
        self.values_with_time(now_ms)
            .iter()
            .map(|b| b.bucket.min_rt())
            .min()
            .unwrap_or(DEFAULT_STATISTIC_MAX_RT)
    }

    /// Global minimum response time over the live window.
    pub fn min_rt(&self) -> i64 {
        self.min_rt_with_time(current_time_millis())
    }
}

// ============================================================================
// SECTION 8: SLIDING WINDOW METRIC
// ============================================================================
// Read adaptor over a leap array. Range arguments are snapped down to bucket
// boundaries, so partial buckets are either fully in or fully out.
// ============================================================================

#[derive(Debug)]
pub struct SlidingWindowMetric {
    last_passed_time_ns: AtomicU64,
    real: Arc<LeapArray>,
}

impl Default for LeapArray {
    /// 20 buckets over 2000ms.
    fn default() -> Self {
        Self::build(DEFAULT_SAMPLE_COUNT, DEFAULT_INTERVAL_MS)
    }
}

impl SlidingWindowMetric {
    pub fn new(real: Arc<LeapArray>) -> Self {
        Self {
            last_passed_time_ns: AtomicU64::new(0),
            real,
        }
    }

    pub fn with_window(sample_count: u32, interval_ms: u32) -> StatResult<Self> {
        Ok(Self::new(Arc::new(LeapArray::new(sample_count, interval_ms)?)))
    }

    pub fn real(&self) -> &Arc<LeapArray> {
        &self.real
    }

    /// Timestamp of the last request admitted by the pacing check.
    pub fn last_passed_time_ns(&self) -> &AtomicU64 {
        &self.last_passed_time_ns
    }

    #[inline]
    pub fn add_count(&self, event: MetricEvent, count: i64) {
        self.real.add_count(event, count);
    }

    #[inline]
    fn bucket_len(&self) -> u64 {
        self.real.bucket_length_ms() as u64
    }

    pub fn interval_secs(&self) -> f64 {
        self.real.interval_ms() as f64 / 1000.0
    }

    /// First and last bucket start of the full window ending at `now_ms`.
    pub fn bucket_start_range(&self, now_ms: u64) -> (u64, u64) {
        let bucket_len = self.bucket_len();
        let end = now_ms - now_ms % bucket_len;
        let start = (end + bucket_len).saturating_sub(self.real.interval_ms() as u64);
        (start, end)
    }

    /// Snap both ends of a range down to bucket starts.
    pub fn bucket_range(&self, start_ms: u64, end_ms: u64) -> (u64, u64) {
        let bucket_len = self.bucket_len();
        (start_ms - start_ms % bucket_len, end_ms - end_ms % bucket_len)
    }

    fn window_values(&self, now_ms: u64) -> Vec<Arc<BucketSlot>> {
        let (start, end) = self.bucket_start_range(now_ms);
        self.real
            .values_conditional(now_ms, |ts| ts >= start && ts <= end)
    }

    fn range_values(&self, start_ms: u64, end_ms: u64) -> Vec<Arc<BucketSlot>> {
        let (start, end) = self.bucket_range(start_ms, end_ms);
        self.real
            .values_conditional(end, |ts| ts >= start && ts <= end)
    }

    pub fn sum_with_time(&self, now_ms: u64, event: MetricEvent) -> i64 {
        self.window_values(now_ms)
            .iter()
            .map(|b| b.bucket().get(event))
            .sum()
    }

    /// Sum of `event` over the most recent full window.
    pub fn count(&self, event: MetricEvent) -> i64 {
        self.sum_with_time(current_time_millis(), event)
    }

    /// Sum of `event` over the aligned `[start_ms, end_ms]` range.
    pub fn count_in_range(&self, event: MetricEvent, start_ms: u64, end_ms: u64) -> i64 {
        if end_ms < start_ms {
            return 0;
        }
        self.range_values(start_ms, end_ms)
            .iter()
            .map(|b| b.bucket().get(event))
            .sum()
    }

    pub fn rate_with_time(&self, now_ms: u64, event: MetricEvent) -> f64 {
        self.sum_with_time(now_ms, event) as f64 / self.interval_secs()
    }

    /// Events per second over the most recent full window.
    pub fn rate(&self, event: MetricEvent) -> f64 {
        self.rate_with_time(current_time_millis(), event)
    }

    pub fn qps(&self, event: MetricEvent) -> f64 {
        self.rate(event)
    }

    /// Events per second over an aligned range. Ranges narrower than one
    /// bucket, or reversed, yield 0.
    pub fn avg_with_time(&self, event: MetricEvent, start_ms: u64, end_ms: u64) -> f64 {
        if end_ms < start_ms || end_ms - start_ms < self.bucket_len() {
            return 0.0;
        }
        let (start, end) = self.bucket_range(start_ms, end_ms);
        if end == start {
            return 0.0;
        }
        let total = self.count_in_range(event, start_ms, end_ms);
        total as f64 * 1000.0 / (end - start) as f64
    }

    /// Per-bucket minimum response times that hold a real measurement.
    pub fn min_rt_samples_with_time(&self, now_ms: u64) -> Vec<i64> {
        self.window_values(now_ms)
            .iter()
            .map(|b| b.bucket().min_rt())
            .filter(|rt| *rt != 0 && *rt != DEFAULT_STATISTIC_MAX_RT)
            .collect()
    }

    pub fn min_rt_samples(&self) -> Vec<i64> {
        self.min_rt_samples_with_time(current_time_millis())
    }

    /// Non-zero per-bucket values of `event`, oldest first.
    pub fn values_with_time(&self, now_ms: u64, event: MetricEvent) -> Vec<i64> {
        self.window_values(now_ms)
            .iter()
            .map(|b| b.bucket().get(event))
            .filter(|v| *v != 0)
            .collect()
    }

    pub fn min_rt(&self) -> i64 {
        self.real.min_rt()
    }
}

impl Default for SlidingWindowMetric {
    fn default() -> Self {
        Self::new(Arc::new(LeapArray::default()))
    }
}

// ============================================================================
// SECTION 9: SAMPLE WINDOW
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub timestamp_ms: u64,
    pub value: f64,
}

#[derive(Debug, Default)]
struct SampleWindowInner {
    data: VecDeque<DataPoint>,
    sum: f64,
}

/// Bounded list of recent data points that also expire by age.
///
/// `capacity = None` keeps every point until it expires; `Some(0)` keeps
/// nothing.
#[derive(Debug)]
pub struct SampleWindow {
    inner: Mutex<SampleWindowInner>,
    capacity: Option<usize>,
    expire_ms: u64,
}

impl SampleWindow {
    pub fn new(capacity: Option<usize>, expire: Duration) -> Self {
        Self {
            inner: Mutex::new(SampleWindowInner::default()),
            capacity,
            expire_ms: expire.as_millis() as u64,
        }
    }

    /// Append a point and return the sum of the window.
    pub fn add(&self, value: f64) -> f64 {
        self.add_at(value, current_time_millis())
    }

    pub fn add_at(&self, value: f64, now_ms: u64) -> f64 {
        let mut inner = self.inner.lock();
        Self::evict_expired(&mut inner, now_ms, self.expire_ms);

        inner.data.push_back(DataPoint {
            timestamp_ms: now_ms,
            value,
        });
        inner.sum += value;

        if let Some(capacity) = self.capacity {
            while inner.data.len() > capacity {
                if let Some(oldest) = inner.data.pop_front() {
                    inner.sum -= oldest.value;
                }
            }
        }
        inner.sum
    }

    fn evict_expired(inner: &mut SampleWindowInner, now_ms: u64, expire_ms: u64) {
        while let Some(oldest) = inner.data.front() {
            if now_ms.saturating_sub(oldest.timestamp_ms) > expire_ms {
                inner.sum -= oldest.value;
                inner.data.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn latest(&self) -> Option<f64> {
        self.inner.lock().data.back().map(|p| p.value)
    }

    /// Values in insertion order.
    pub fn data(&self) -> Vec<f64> {
        self.inner.lock().data.iter().map(|p| p.value).collect()
    }

    pub fn sum(&self) -> f64 {
        self.inner.lock().sum
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum per second over the expiry span.
    pub fn increase_ratio(&self) -> f64 {
        self.increase_ratio_at(current_time_millis())
    }

    pub fn increase_ratio_at(&self, now_ms: u64) -> f64 {
        let mut inner = self.inner.lock();
        Self::evict_expired(&mut inner, now_ms, self.expire_ms);
        if inner.data.is_empty() || self.expire_ms == 0 {
            return 0.0;
        }
        inner.sum / (self.expire_ms as f64 / 1000.0)
    }
}

// ============================================================================
// SECTION 10: ARITHMETIC & Z-SCORE FILTERING
// ============================================================================

pub fn sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

/// Arithmetic mean; 0 for an empty slice.
pub fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    sum(values) / values.len() as f64
}

/// Population standard deviation.
pub fn standard_deviation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = average(values);
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Keep the samples whose z-score magnitude is below `score`, in order.
/// A flat series (σ = 0) is returned unchanged.
pub fn zscore_filter(samples: &[f64], score: f64) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }
    let sigma = standard_deviation(samples);
    if sigma == 0.0 {
        return samples.to_vec();
    }
    let mean = average(samples);
    samples
        .iter()
        .copied()
        .filter(|v| ((v - mean) / sigma).abs() < score)
        .collect()
}

// ============================================================================
// SECTION 11: STATISTICS TESTS
// ============================================================================

#[cfg(test)]
mod stats_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn test_time_bucket_counters_and_min_rt() {
        let bucket = TimeBucket::new();
        assert_eq!(bucket.min_rt(), DEFAULT_STATISTIC_MAX_RT);

        bucket.add(MetricEvent::Complete, 3);
        bucket.add(MetricEvent::Rt, 40);
        bucket.add(MetricEvent::Rt, 15);
        bucket.add(MetricEvent::Rt, 90);

        assert_eq!(bucket.get(MetricEvent::Complete), 3);
        assert_eq!(bucket.get(MetricEvent::Rt), 145);
        assert_eq!(bucket.min_rt(), 15);
        assert_eq!(bucket.get(MetricEvent::Error), 0);
    }

    #[test]
    fn test_leap_array_rejects_uneven_window() {
        assert_eq!(
            LeapArray::new(3, 1000).unwrap_err(),
            StatError::InvalidWindow {
                sample_count: 3,
                interval_ms: 1000
            }
        );
        assert!(LeapArray::new(0, 1000).is_err());

        let array = LeapArray::new(200, 2000).unwrap();
        assert_eq!(array.bucket_length_ms(), 10);
    }

    #[test]
    fn test_add_count_then_count_in_same_bucket() {
        let array = LeapArray::new(200, 2000).unwrap();
        array.add_count(MetricEvent::Complete, 2);
        assert_eq!(array.count(MetricEvent::Complete), 2);
    }

    #[test]
    fn test_current_bucket_is_idempotent() {
        let array = LeapArray::new(20, 2000).unwrap();
        array.add_count_with_time(T0, MetricEvent::Pass, 7);

        let first = array.current_bucket_of_time(T0 + 5).unwrap();
        let second = array.current_bucket_of_time(T0 + 5).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.bucket().get(MetricEvent::Pass), 7);
        assert_eq!(second.bucket().get(MetricEvent::Pass), 7);
    }

    #[test]
    fn test_bucket_rotation_resets_reused_slot() {
        let array = LeapArray::new(4, 400).unwrap();
        let bucket_len = array.bucket_length_ms() as u64;

        let idx = array.index_of(T0);
        assert_eq!(array.index_of(T0 + bucket_len), (idx + 1) % 4);

        array.add_count_with_time(T0, MetricEvent::Complete, 5);
        let reused = array.current_bucket_of_time(T0 + 400).unwrap();
        assert_eq!(array.index_of(T0 + 400), idx);
        assert_eq!(reused.start_ms(), array.bucket_start_of(T0 + 400));
        assert_eq!(reused.bucket().get(MetricEvent::Complete), 0);
    }

    #[test]
    fn test_time_behind_is_an_error_unless_single_bucket() {
        let array = LeapArray::new(4, 400).unwrap();
        array.add_count_with_time(T0 + 400, MetricEvent::Complete, 1);
        assert!(matches!(
            array.current_bucket_of_time(T0),
            Err(StatError::TimeBehind { .. })
        ));

        let single = LeapArray::new(1, 1000).unwrap();
        single.add_count_with_time(T0 + 1000, MetricEvent::Complete, 1);
        let slot = single.current_bucket_of_time(T0).unwrap();
        assert_eq!(slot.start_ms(), single.bucket_start_of(T0 + 1000));
    }

    #[test]
    fn test_values_are_chronological_and_exclude_expired() {
        let array = LeapArray::new(4, 400).unwrap();
        array.add_count_with_time(T0 + 300, MetricEvent::Pass, 4);
        array.add_count_with_time(T0 + 100, MetricEvent::Pass, 2);
        array.add_count_with_time(T0, MetricEvent::Pass, 1);

        let starts: Vec<u64> = array
            .values_with_time(T0 + 300)
            .iter()
            .map(|b| b.start_ms())
            .collect();
        assert_eq!(starts, vec![T0, T0 + 100, T0 + 300]);

        // T0's bucket falls out of the window exactly one interval later.
        let live_starts = |now: u64| -> Vec<u64> {
            array.values_with_time(now).iter().map(|b| b.start_ms()).collect()
        };
        assert_eq!(live_starts(T0 + 399), vec![T0, T0 + 100, T0 + 300]);
        assert_eq!(live_starts(T0 + 400), vec![T0 + 100, T0 + 300]);
        assert_eq!(array.count_with_time(T0 + 399, MetricEvent::Pass), 7);
        assert_eq!(array.count_with_time(T0 + 400, MetricEvent::Pass), 6);
        assert_eq!(array.count_with_time(T0 + 800, MetricEvent::Pass), 0);
    }

    #[test]
    fn test_min_rt_defaults_without_data() {
        let array = LeapArray::new(10, 1000).unwrap();
        assert_eq!(array.min_rt_with_time(T0), DEFAULT_STATISTIC_MAX_RT);

        array.add_count_with_time(T0, MetricEvent::Rt, 30);
        array.add_count_with_time(T0 + 100, MetricEvent::Rt, 12);
        assert_eq!(array.min_rt_with_time(T0 + 100), 12);
    }

    #[test]
    fn test_concurrent_adds_on_live_bucket_lose_nothing() {
        let array = Arc::new(LeapArray::new(20, 2000).unwrap());
        let threads = 8;
        let per_thread = 10_000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let array = Arc::clone(&array);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        array.add_count_with_time(T0, MetricEvent::Complete, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            array.count_with_time(T0, MetricEvent::Complete),
            (threads * per_thread) as i64
        );
    }

    #[test]
    fn test_concurrent_roll_of_stale_slot_keeps_every_write() {
        let array = Arc::new(LeapArray::new(4, 400).unwrap());
        array.add_count_with_time(T0, MetricEvent::Complete, 1_000);

        let next_epoch = T0 + 400;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let array = Arc::clone(&array);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        array.add_count_with_time(next_epoch, MetricEvent::Complete, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let slot = array.current_bucket_of_time(next_epoch).unwrap();
        assert_eq!(slot.bucket().get(MetricEvent::Complete), 8_000);
    }

    #[test]
    fn test_bucket_start_range() {
        let metric = SlidingWindowMetric::with_window(20, 2000).unwrap();
        assert_eq!(metric.bucket_start_range(12_345), (10_400, 12_300));
    }

    #[test]
    fn test_bucket_range_alignment() {
        let metric = SlidingWindowMetric::with_window(200, 2000).unwrap();
        assert_eq!(metric.bucket_range(12, 43), (10, 40));
    }

    #[test]
    fn test_sum_with_time() {
        let metric = SlidingWindowMetric::with_window(200, 2000).unwrap();
        for n in 1..=3 {
            metric.real().add_count_with_time(T0, MetricEvent::Complete, n);
        }
        assert_eq!(metric.sum_with_time(T0, MetricEvent::Complete), 6);
        assert_eq!(metric.rate_with_time(T0, MetricEvent::Complete), 3.0);
    }

    #[test]
    fn test_avg_with_time_over_aligned_range() {
        let metric = SlidingWindowMetric::with_window(200, 2000).unwrap();
        metric.real().add_count_with_time(T0, MetricEvent::Complete, 30);
        metric.real().add_count_with_time(T0 + 20, MetricEvent::Complete, 20);

        let now = T0 + 20;
        assert_eq!(metric.avg_with_time(MetricEvent::Complete, now - 30, now + 20), 1000.0);
    }

    #[test]
    fn test_avg_with_time_degenerate_ranges() {
        let metric = SlidingWindowMetric::with_window(200, 2000).unwrap();
        metric.real().add_count_with_time(T0, MetricEvent::Complete, 30);

        assert_eq!(metric.avg_with_time(MetricEvent::Complete, T0 + 10, T0), 0.0);
        assert_eq!(metric.avg_with_time(MetricEvent::Complete, T0, T0 + 5), 0.0);
        assert_eq!(metric.count_in_range(MetricEvent::Complete, T0 + 10, T0), 0);
    }

    #[test]
    fn test_min_rt_samples_skip_empty_buckets() {
        let metric = SlidingWindowMetric::with_window(200, 2000).unwrap();
        for rt in 1..=4 {
            metric.real().add_count_with_time(T0, MetricEvent::Rt, rt);
        }
        metric.real().add_count_with_time(T0 + 10, MetricEvent::Complete, 1);
        metric.real().add_count_with_time(T0 + 20, MetricEvent::Rt, 9);

        assert_eq!(metric.min_rt_samples_with_time(T0 + 20), vec![1, 9]);
    }

    #[test]
    fn test_values_with_time_are_non_zero_and_ordered() {
        let metric = SlidingWindowMetric::with_window(20, 2000).unwrap();
        metric.real().add_count_with_time(T0 + 200, MetricEvent::Error, 2);
        metric.real().add_count_with_time(T0, MetricEvent::Error, 5);
        metric.real().add_count_with_time(T0 + 100, MetricEvent::Complete, 1);

        assert_eq!(metric.values_with_time(T0 + 200, MetricEvent::Error), vec![5, 2]);
    }

    #[test]
    fn test_sample_window_capacity_and_expiry() {
        let window = SampleWindow::new(Some(3), Duration::from_secs(6));
        for (i, v) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            window.add_at(*v, T0 + i as u64);
        }
        assert_eq!(window.data(), vec![2.0, 3.0, 4.0]);
        assert_eq!(window.sum(), 9.0);
        assert_eq!(window.latest(), Some(4.0));

        // Everything is older than six seconds by now.
        assert_eq!(window.add_at(10.0, T0 + 7_000), 10.0);
        assert_eq!(window.data(), vec![10.0]);
        assert!((window.increase_ratio_at(T0 + 7_000) - 10.0 / 6.0).abs() < 1e-9);
        assert_eq!(window.increase_ratio_at(T0 + 20_000), 0.0);
    }

    #[test]
    fn test_sample_window_zero_capacity_keeps_nothing() {
        let window = SampleWindow::new(Some(0), Duration::from_secs(1));
        window.add_at(1.0, T0);
        assert!(window.is_empty());
        assert_eq!(window.sum(), 0.0);
    }

    #[test]
    fn test_zscore_filter_reference_series() {
        let samples = [0.0, 3.1, 8.0, 3.0, 2.3, 3.5, 3.6, 8.9, 9.3];
        assert_eq!(zscore_filter(&samples, 1.0), vec![3.1, 3.0, 2.3, 3.5, 3.6]);
    }

    #[test]
    fn test_zscore_filter_drops_extreme_outlier() {
        let samples = [0.5, 0.52, 0.49, 0.51, 0.5, 0.48, 5.0];
        let filtered = zscore_filter(&samples, 1.0);
        assert!(!filtered.contains(&5.0));
        assert_eq!(filtered.len(), 6);
    }

    #[test]
    fn test_zscore_filter_flat_and_empty_series() {
        let flat = [0.7; 5];
        assert_eq!(zscore_filter(&flat, 1.0), flat.to_vec());
        assert!(zscore_filter(&[], 2.4).is_empty());
    }

    #[test]
    fn test_arithmetic_helpers() {
        assert_eq!(average(&[]), 0.0);
        assert_eq!(average(&[1.0, 2.0, 3.0]), 2.0);
        assert!((standard_deviation(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]) - 2.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_window_construction(sample_count in 1u32..500, interval_ms in 1u32..100_000) {
            let result = LeapArray::new(sample_count, interval_ms);
            if interval_ms % sample_count == 0 {
                prop_assert_eq!(result.unwrap().bucket_length_ms(), interval_ms / sample_count);
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn prop_rotation_advances_one_slot(
            sample_count in 1u32..64,
            bucket_len in 1u32..1000,
            now in 0u64..1_000_000_000_000,
        ) {
            let array = LeapArray::new(sample_count, sample_count * bucket_len).unwrap();
            let next = array.index_of(now + bucket_len as u64);
            prop_assert_eq!(next, (array.index_of(now) + 1) % sample_count as usize);
        }
    }
}

// ============================================================================
// SECTION 12: PID CONTROLLER
// ============================================================================
// Output is a negative reject intensity in basis points, clamped to
// [OUT_MIN, OUT_MAX]. `compute` mutates the integral and must only be driven
// from one sampling loop.
// ============================================================================

#[derive(Debug, Clone)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    set_point: DynamicPoint,
    err_sum: f64,
    last_err: f64,
    last_time: u64,
    out_max: f64,
    out_min: f64,
}

impl PidController {
    /// Controller with a fixed set-point.
    pub fn set_tunings(kp: f64, ki: f64, kd: f64, set_point: f64) -> Self {
        Self::with_set_point(kp, ki, kd, DynamicPoint::Fixed(set_point))
    }

    pub fn with_set_point(kp: f64, ki: f64, kd: f64, set_point: DynamicPoint) -> Self {
        Self {
            kp,
            ki,
            kd,
            set_point,
            err_sum: 0.0,
            last_err: 0.0,
            last_time: current_time_millis(),
            out_max: OUT_MAX,
            out_min: OUT_MIN,
        }
    }

    pub fn compute(&mut self, input: f64) -> f64 {
        self.compute_at(input, current_time_millis())
    }

    /// One control step at `now_ms`.
    ///
    /// The integral only commits when the output lands inside the clamp; a
    /// saturated step rolls it back. With no elapsed time the derivative term
    /// is skipped.
    pub fn compute_at(&mut self, input: f64, now_ms: u64) -> f64 {
        let dt = now_ms.saturating_sub(self.last_time) as f64;
        let err = self.set_point.value() - input;

        let committed = self.err_sum;
        self.err_sum += err * dt;
        let d_err = if dt > 0.0 { (err - self.last_err) / dt } else { 0.0 };

        self.last_err = err;
        self.last_time = now_ms;

        let output = self.kp * err + self.ki * self.err_sum + self.kd * d_err;
        if output > self.out_max {
            self.err_sum = committed;
            self.out_max
        } else if output < self.out_min {
            self.err_sum = committed;
            self.out_min
        } else {
            output
        }
    }

    /// Narrow the output clamp. Limits wider than the defaults, or an
    /// inverted pair, are ignored.
    pub fn set_out_limit(&mut self, max: f64, min: f64) {
        if max < min {
            return;
        }
        if max < OUT_MAX {
            self.out_max = max;
        }
        if min > OUT_MIN {
            self.out_min = min;
        }
    }

    /// Current set-point.
    pub fn threshold(&self) -> f64 {
        self.set_point.value()
    }

    pub fn gains(&self) -> (f64, f64, f64) {
        (self.kp, self.ki, self.kd)
    }

    pub fn out_limits(&self) -> (f64, f64) {
        (self.out_max, self.out_min)
    }

    pub fn err_sum(&self) -> f64 {
        self.err_sum
    }
}

// ============================================================================
// SECTION 13: RELAY AUTO-TUNER
// ============================================================================
// Bang-bang experiment: the relay flips between OUT_MAX and OUT_MIN as the
// input crosses the target. Each full oscillation yields an ultimate gain and
// period, and Ziegler-Nichols style gains are averaged over the run.
// ============================================================================

#[derive(Debug, Clone)]
pub struct RelayTuner {
    target: f64,
    max: f64,
    min: f64,
    output_on: bool,
    output_value: f64,
    t1: u64,
    t2: u64,
    t_high: u64,
    t_low: u64,
    cycle: u32,
    cycles: u32,
    samples: u32,
    p_sum: f64,
    i_sum: f64,
    d_sum: f64,
    kp: f64,
    ki: f64,
    kd: f64,
    finished: bool,
}

impl RelayTuner {
    pub fn new(target: f64) -> Self {
        Self::with_budget(target, TUNER_CYCLES, current_time_millis())
    }

    /// Tuner with an explicit cycle budget and experiment start time.
    pub fn with_budget(target: f64, cycles: u32, start_ms: u64) -> Self {
        Self {
            target,
            max: 1.0,
            min: 0.0,
            output_on: true,
            output_value: TUNER_OUTPUT_HIGH,
            t1: start_ms,
            t2: start_ms,
            t_high: 0,
            t_low: 0,
            cycle: 0,
            cycles: cycles.max(1),
            samples: 0,
            p_sum: 0.0,
            i_sum: 0.0,
            d_sum: 0.0,
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            finished: false,
        }
    }

    pub fn tune(&mut self, input: f64) -> f64 {
        self.tune_at(input, current_time_millis())
    }

    /// Feed one sample and return the relay output.
    pub fn tune_at(&mut self, input: f64, now_ms: u64) -> f64 {
        if self.finished {
            return TUNER_OUTPUT_HIGH;
        }

        self.max = self.max.max(input);
        self.min = self.min.min(input);

        if self.output_on && input > self.target {
            self.output_on = false;
            self.output_value = TUNER_OUTPUT_LOW;
            self.t1 = now_ms;
            self.t_high = self.t1.saturating_sub(self.t2);
            self.max = self.target;
        }

        if !self.output_on && input < self.target {
            self.output_on = true;
            self.output_value = TUNER_OUTPUT_HIGH;
            self.t2 = now_ms;
            self.t_low = self.t2.saturating_sub(self.t1);
            self.record_cycle();
            self.min = self.target;
            self.cycle += 1;
            debug!(target: "plato::pid", cycle = self.cycle, "relay cycle complete");
        }

        if self.cycle >= self.cycles {
            self.finish();
            return TUNER_OUTPUT_HIGH;
        }

        self.output_value
    }

    fn record_cycle(&mut self) {
        let input_amplitude = (self.max - self.min) / 2.0;
        let tu = (self.t_low + self.t_high) as f64;
        if input_amplitude <= 0.0 || tu <= 0.0 {
            return;
        }

        let output_amplitude = (TUNER_OUTPUT_HIGH - TUNER_OUTPUT_LOW) / 2.0;
        let ku = 4.0 * output_amplitude / (PI * input_amplitude);

        self.kp = TUNER_KP_FACTOR * ku;
        self.ki = self.kp / (TUNER_TI_DIVISOR * tu) * TUNER_LOOP_INTERVAL_MS;
        self.kd = TUNER_TD_FACTOR * self.kp * tu / TUNER_LOOP_INTERVAL_MS;

        // The first oscillation starts from an arbitrary state; skip it.
        if self.cycle >= 1 {
            self.p_sum += self.kp;
            self.i_sum += self.ki;
            self.d_sum += self.kd;
            self.samples += 1;
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.output_on = false;
        if self.samples > 0 {
            let n = self.samples as f64;
            self.kp = self.p_sum / n;
            self.ki = self.i_sum / n;
            self.kd = self.d_sum / n;
        }
        info!(
            target: "plato::pid",
            kp = self.kp,
            ki = self.ki,
            kd = self.kd,
            "relay tuning finished"
        );
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn kp(&self) -> f64 {
        self.kp
    }

    pub fn ki(&self) -> f64 {
        self.ki
    }

    pub fn kd(&self) -> f64 {
        self.kd
    }

    /// Final gains as a ready-to-use controller.
    pub fn controller(&self) -> PidController {
        PidController::set_tunings(self.kp, self.ki, self.kd, self.target)
    }
}

// ============================================================================
// SECTION 14: PERIODIC TASKS
// ============================================================================
// Every background loop in the engine is a PeriodicTask: a named thread that
// waits on a crossbeam ticker or its stop channel, and runs each tick inside
// a panic boundary so one bad tick never kills the loop.
// ============================================================================

pub struct PeriodicTask {
    name: String,
    interval: Duration,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawn `f` on a dedicated thread, first run one interval from now.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut f: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(interval);
        let task_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => run_guarded(&task_name, &mut f),
                }
            }
            debug!(target: "plato::loop", task = %task_name, "periodic task stopped");
        })?;

        debug!(target: "plato::loop", task = %name, ?interval, "periodic task started");
        Ok(Self {
            name,
            interval,
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    /// Signal the loop and wait for the current tick to finish. Idempotent.
    pub fn stop(&self) {
        drop(self.stop_tx.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // A task dropping its own owner cannot join itself.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(target: "plato::loop", task = %self.name, "periodic task exited abnormally");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Debug for PeriodicTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_guarded<F: FnMut()>(task: &str, f: &mut F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f())) {
        error!(
            target: "plato::loop",
            task,
            panic = %panic_message(&*payload),
            backtrace = %Backtrace::force_capture(),
            "recovered panic in periodic task"
        );
    }
}

// ============================================================================
// SECTION 15: LOAD SOURCES & CPU SAMPLER
// ============================================================================
// A load source turns OS counters into a usage ratio. Every source diffs two
// readings, so the first read after construction reports NotInitialized and
// a counter that did not move reports Unchanged; neither is ever turned into
// a fake 0.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Load Source Trait
// ----------------------------------------------------------------------------

/// Poll function returning current CPU utilization, nominally in `[0, 1]`.
pub trait LoadSource: Send + Sync {
    fn usage(&self) -> LoadResult<f64>;

    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> LoadSource for F
where
    F: Fn() -> LoadResult<f64> + Send + Sync,
{
    fn usage(&self) -> LoadResult<f64> {
        self()
    }
}

/// Which load source the sampler should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSourceKind {
    /// cgroup v2, then cgroup v1, then /proc/stat
    #[default]
    Auto,
    ProcStat,
    CgroupV1,
    CgroupV2,
}

fn read_file(path: &Path) -> LoadResult<String> {
    fs::read_to_string(path).map_err(|e| LoadSourceError::io(path, e))
}

fn read_i64(path: &Path) -> LoadResult<i64> {
    let raw = read_file(path)?;
    raw.trim()
        .parse::<i64>()
        .map_err(|e| LoadSourceError::parse(path, e.to_string()))
}

/// Join an absolute cgroup path under a mount prefix.
fn cgroup_dir(prefix: &Path, relative: &str) -> PathBuf {
    prefix.join(relative.trim_start_matches('/'))
}

// ----------------------------------------------------------------------------
// 15.2 /proc/stat Source
// ----------------------------------------------------------------------------

/// Aggregate CPU tick counters from the first line of /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    /// Parse the aggregate line: "cpu  12345 678 9012 34567 890 12 34 56"
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        if parts.next()? != "cpu" {
            return None;
        }

        let mut next = || parts.next().and_then(|s| s.parse::<u64>().ok());
        let user = next()?;
        let nice = next()?;
        let system = next()?;
        let idle = next()?;
        Some(Self {
            user,
            nice,
            system,
            idle,
            iowait: next().unwrap_or(0),
            irq: next().unwrap_or(0),
            softirq: next().unwrap_or(0),
            steal: next().unwrap_or(0),
        })
    }

    pub fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }

    /// User plus kernel ticks.
    pub fn busy(&self) -> u64 {
        self.user + self.nice + self.system + self.irq + self.softirq
    }
}

#[derive(Debug)]
pub struct ProcStatSource {
    path: PathBuf,
    prev: Mutex<Option<CpuTimes>>,
}

impl ProcStatSource {
    pub fn new() -> Self {
        Self::with_path(PROC_STAT_PATH)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            prev: Mutex::new(None),
        }
    }

    fn read_times(&self) -> LoadResult<CpuTimes> {
        let content = read_file(&self.path)?;
        content
            .lines()
            .find_map(CpuTimes::parse)
            .ok_or_else(|| LoadSourceError::parse(&self.path, "no aggregate cpu line"))
    }
}

impl Default for ProcStatSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSource for ProcStatSource {
    fn usage(&self) -> LoadResult<f64> {
        let current = self.read_times()?;
        let mut prev = self.prev.lock();

        let Some(previous) = *prev else {
            *prev = Some(current);
            return Err(LoadSourceError::NotInitialized);
        };

        let total = current.total().saturating_sub(previous.total());
        if total == 0 {
            return Err(LoadSourceError::Unchanged);
        }
        let busy = current.busy().saturating_sub(previous.busy());
        *prev = Some(current);
        Ok((busy as f64 / total as f64).max(0.0))
    }

    fn name(&self) -> &str {
        "proc_stat"
    }
}

// ----------------------------------------------------------------------------
// 15.3 Cgroup Sources
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct CounterReading {
    usage: i64,
    timestamp: u64,
}

/// Usage rate relative to the cgroup CPU quota. Usage and timestamps must be
/// in the same unit.
fn quota_rate(
    prev: &Mutex<Option<CounterReading>>,
    usage: i64,
    timestamp: u64,
    period: f64,
    quota: f64,
) -> LoadResult<f64> {
    let mut prev = prev.lock();
    let rate = match *prev {
        Some(p) if p.usage == usage => return Err(LoadSourceError::Unchanged),
        Some(p) if timestamp > p.timestamp => {
            (usage - p.usage) as f64 / (timestamp - p.timestamp) as f64 * period / quota
        }
        Some(_) => return Err(LoadSourceError::Unchanged),
        None => {
            *prev = Some(CounterReading { usage, timestamp });
            return Err(LoadSourceError::NotInitialized);
        }
    };
    *prev = Some(CounterReading { usage, timestamp });
    Ok(rate.max(0.0))
}

/// Extract the `cpu,cpuacct` hierarchy from /proc/self/cgroup.
fn extract_v1_path(content: &str) -> Option<&str> {
    content.lines().find_map(|line| {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        (parts.len() == 3 && parts[1] == CGROUP_V1_CONTROLLER).then_some(parts[2])
    })
}

/// Extract the unified hierarchy ("0::/path") from /proc/1/cgroup.
fn extract_v2_path(content: &str) -> Option<&str> {
    content.lines().find_map(|line| {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        (parts.len() == 3 && parts[1].is_empty())
            .then(|| parts[2].strip_suffix(CGROUP_V2_SCOPE_SUFFIX).unwrap_or(parts[2]))
    })
}

/// cgroup v1 CPU accounting: `cpuacct.usage` in nanoseconds against
/// `cpu.cfs_quota_us / cpu.cfs_period_us`.
#[derive(Debug)]
pub struct CgroupV1Source {
    usage_path: PathBuf,
    period: f64,
    quota: f64,
    prev: Mutex<Option<CounterReading>>,
}

impl CgroupV1Source {
    pub fn detect() -> LoadResult<Self> {
        Self::from_roots(Path::new(CGROUP_V1_SELF_PATH), Path::new(CGROUP_V1_PREFIX))
    }

    /// Resolve paths from a cgroup membership file and a hierarchy mount.
    pub fn from_roots(cgroup_file: &Path, prefix: &Path) -> LoadResult<Self> {
        let membership = read_file(cgroup_file)?;
        let relative = extract_v1_path(&membership)
            .ok_or_else(|| LoadSourceError::parse(cgroup_file, "no cpu,cpuacct hierarchy"))?;
        let dir = cgroup_dir(prefix, relative);

        let usage_path = dir.join("cpuacct.usage");
        let period = read_i64(&dir.join("cpu.cfs_period_us"))?;
        let quota = read_i64(&dir.join("cpu.cfs_quota_us"))?;
        if quota == -1 || quota == 0 || period == 0 {
            return Err(LoadSourceError::Unsupported(format!(
                "no cpu quota configured under {}",
                dir.display()
            )));
        }
        if !usage_path.exists() {
            return Err(LoadSourceError::Unsupported(format!(
                "missing {}",
                usage_path.display()
            )));
        }

        Ok(Self {
            usage_path,
            period: period as f64,
            quota: quota as f64,
            prev: Mutex::new(None),
        })
    }

    pub fn usage_at(&self, now_ns: u64) -> LoadResult<f64> {
        let usage = read_i64(&self.usage_path)?;
        quota_rate(&self.prev, usage, now_ns, self.period, self.quota)
    }

    /// Quota in cores.
    pub fn cpu_limit(&self) -> f64 {
        self.quota / self.period
    }
}

impl LoadSource for CgroupV1Source {
    fn usage(&self) -> LoadResult<f64> {
        self.usage_at(current_time_nanos())
    }

    fn name(&self) -> &str {
        "cgroup_v1"
    }
}

/// cgroup v2 CPU accounting: `usage_usec` from `cpu.stat` against the
/// `cpu.max` quota.
#[derive(Debug)]
pub struct CgroupV2Source {
    stat_path: PathBuf,
    period: f64,
    quota: f64,
    prev: Mutex<Option<CounterReading>>,
}

impl CgroupV2Source {
    pub fn detect() -> LoadResult<Self> {
        Self::from_roots(Path::new(CGROUP_V2_INIT_PATH), Path::new(CGROUP_V2_PREFIX))
    }

    pub fn from_roots(cgroup_file: &Path, prefix: &Path) -> LoadResult<Self> {
        let membership = read_file(cgroup_file)?;
        let relative = extract_v2_path(&membership)
            .ok_or_else(|| LoadSourceError::parse(cgroup_file, "no unified hierarchy"))?;
        let dir = cgroup_dir(prefix, relative);

        let max_path = dir.join("cpu.max");
        let (quota, period) = Self::parse_cpu_max(&max_path, &read_file(&max_path)?)?;
        if quota == -1.0 || quota == 0.0 || period == 0.0 {
            return Err(LoadSourceError::Unsupported(format!(
                "no cpu quota configured in {}",
                max_path.display()
            )));
        }

        let stat_path = dir.join("cpu.stat");
        if !stat_path.exists() {
            return Err(LoadSourceError::Unsupported(format!(
                "missing {}",
                stat_path.display()
            )));
        }

        Ok(Self {
            stat_path,
            period,
            quota,
            prev: Mutex::new(None),
        })
    }

    /// `cpu.max` holds "quota period"; "max" means unlimited.
    fn parse_cpu_max(path: &Path, content: &str) -> LoadResult<(f64, f64)> {
        let values: Vec<&str> = content.split_whitespace().collect();
        if values.len() != 2 {
            return Err(LoadSourceError::parse(path, format!("expected 2 values, got {:?}", content.trim())));
        }
        if values[0] == "max" {
            return Err(LoadSourceError::Unsupported("cpu.max is unlimited".into()));
        }
        let quota = values[0]
            .parse::<f64>()
            .map_err(|e| LoadSourceError::parse(path, format!("quota: {}", e)))?;
        let period = values[1]
            .parse::<f64>()
            .map_err(|e| LoadSourceError::parse(path, format!("period: {}", e)))?;
        Ok((quota, period))
    }

    fn read_usage_usec(&self) -> LoadResult<i64> {
        let content = read_file(&self.stat_path)?;
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            if parts.next() == Some("usage_usec") {
                return parts
                    .next()
                    .ok_or_else(|| LoadSourceError::parse(&self.stat_path, "usage_usec has no value"))?
                    .parse::<i64>()
                    .map_err(|e| LoadSourceError::parse(&self.stat_path, e.to_string()));
            }
        }
        Err(LoadSourceError::parse(&self.stat_path, "not found usage_usec"))
    }

    pub fn usage_at(&self, now_ns: u64) -> LoadResult<f64> {
        let usage = self.read_usage_usec()?;
        quota_rate(&self.prev, usage, now_ns / 1_000, self.period, self.quota)
    }

    pub fn cpu_limit(&self) -> f64 {
        self.quota / self.period
    }
}

impl LoadSource for CgroupV2Source {
    fn usage(&self) -> LoadResult<f64> {
        self.usage_at(current_time_nanos())
    }

    fn name(&self) -> &str {
        "cgroup_v2"
    }
}

// ----------------------------------------------------------------------------
// 15.4 Source Detection
// ----------------------------------------------------------------------------

/// Build the requested load source. `Auto` prefers a cgroup quota when the
/// process runs under one and falls back to host-wide /proc/stat.
pub fn detect_load_source(kind: LoadSourceKind) -> LoadResult<Arc<dyn LoadSource>> {
    let source: Arc<dyn LoadSource> = match kind {
        LoadSourceKind::ProcStat => Arc::new(ProcStatSource::new()),
        LoadSourceKind::CgroupV1 => Arc::new(CgroupV1Source::detect()?),
        LoadSourceKind::CgroupV2 => Arc::new(CgroupV2Source::detect()?),
        LoadSourceKind::Auto => {
            let unified = Path::new(CGROUP_V2_PREFIX).join("cgroup.controllers");
            let v2 = if unified.exists() {
                CgroupV2Source::detect()
                    .map_err(|e| debug!(target: "plato::sampler", error = %e, "cgroup v2 unavailable"))
                    .ok()
            } else {
                None
            };

            match v2 {
                Some(source) => Arc::new(source),
                None => match CgroupV1Source::detect() {
                    Ok(source) => Arc::new(source),
                    Err(e) => {
                        debug!(target: "plato::sampler", error = %e, "cgroup v1 unavailable");
                        Arc::new(ProcStatSource::new())
                    }
                },
            }
        }
    };

    info!(target: "plato::sampler", source = source.name(), "load source selected");
    Ok(source)
}

// ----------------------------------------------------------------------------
// 15.5 CPU Sampler
// ----------------------------------------------------------------------------

/// The latest reading plus the recent history handed to a monitor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSample {
    /// `None` when the last acquisition failed
    pub usage: Option<f64>,
    /// Recent non-zero readings, oldest first
    pub window: Vec<f64>,
}

/// Owns a load source, its latest good value and a short sample history.
///
/// Either run it on its own loop with [`CpuSampler::start`] or let a single
/// driver call [`CpuSampler::poll`].
pub struct CpuSampler {
    source: Arc<dyn LoadSource>,
    current: AtomicF64,
    last_ok: AtomicBool,
    last_error: Mutex<Option<String>>,
    failures: AtomicU64,
    window: SampleWindow,
    interval: Duration,
    task: OnceCell<PeriodicTask>,
}

impl CpuSampler {
    pub fn new(source: Arc<dyn LoadSource>) -> Self {
        Self::with_window(
            source,
            DEFAULT_SAMPLING_INTERVAL,
            DEFAULT_WINDOW_CAPACITY,
            DEFAULT_WINDOW_EXPIRE,
        )
    }

    pub fn with_window(
        source: Arc<dyn LoadSource>,
        interval: Duration,
        capacity: usize,
        expire: Duration,
    ) -> Self {
        Self {
            source,
            current: AtomicF64::new(0.0),
            last_ok: AtomicBool::new(false),
            last_error: Mutex::new(None),
            failures: AtomicU64::new(0),
            window: SampleWindow::new(Some(capacity), expire),
            interval,
            task: OnceCell::new(),
        }
    }

    pub fn from_config(source: Arc<dyn LoadSource>, config: &SamplerConfig) -> Self {
        Self::with_window(source, config.interval, config.window_capacity, config.window_expire)
    }

    /// Start the background poll loop. Only the first call spawns it; a
    /// stopped sampler stays stopped.
    pub fn start(self: &Arc<Self>) -> PlatoResult<()> {
        self.task.get_or_try_init(|| {
            self.poll();
            let weak = Arc::downgrade(self);
            PeriodicTask::spawn("plato-sampler", self.interval, move || {
                if let Some(sampler) = weak.upgrade() {
                    sampler.poll();
                }
            })
        })?;
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.get() {
            task.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.get().map_or(false, PeriodicTask::is_running)
    }

    pub fn poll(&self) -> Option<f64> {
        self.poll_at(current_time_millis())
    }

    /// Acquire one reading. A failed read keeps the previous value.
    pub fn poll_at(&self, now_ms: u64) -> Option<f64> {
        match self.source.usage() {
            Ok(usage) => {
                self.current.store(usage, AtomicOrdering::Release);
                self.last_ok.store(true, AtomicOrdering::Release);
                *self.last_error.lock() = None;
                self.window.add_at(usage, now_ms);
                Some(usage)
            }
            Err(e) => {
                self.last_ok.store(false, AtomicOrdering::Release);
                self.failures.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(target: "plato::sampler", source = self.source.name(), error = %e, "cpu usage unavailable");
                *self.last_error.lock() = Some(e.to_string());
                None
            }
        }
    }

    /// Last successful reading, 0 before the first one.
    pub fn current_usage(&self) -> f64 {
        self.current.load(AtomicOrdering::Acquire)
    }

    /// Recent readings in time order, zeros skipped.
    pub fn windows(&self) -> Vec<f64> {
        self.window.data().into_iter().filter(|v| *v != 0.0).collect()
    }

    pub fn snapshot(&self) -> LoadSample {
        LoadSample {
            usage: self
                .last_ok
                .load(AtomicOrdering::Acquire)
                .then(|| self.current_usage()),
            window: self.windows(),
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(AtomicOrdering::Relaxed)
    }

    /// Why the most recent poll failed, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Debug for CpuSampler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuSampler")
            .field("source", &self.source.name())
            .field("current", &self.current_usage())
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}


// ============================================================================
// SECTION 16: OVERLOAD MONITORS
// ============================================================================
// A monitor classifies the host as overloaded or not with hysteresis:
// enter at or above the upper bound, leave below the lower bound. Only the
// sampling driver calls `observe`; `is_overload` is read from request paths.
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorAlg {
    /// Compare the latest reading directly, confirm after a dwell
    #[default]
    Raw,
    /// Average a z-score filtered window, confirm after consecutive hits
    ZScore,
}

impl Display for MonitorAlg {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MonitorAlg::Raw => write!(f, "raw"),
            MonitorAlg::ZScore => write!(f, "zscore"),
        }
    }
}

pub trait OverloadMonitor: Send + Sync + Debug {
    fn is_overload(&self) -> bool;

    /// Feed one sampling tick.
    fn observe(&self, sample: &LoadSample, now_ms: u64);

    fn alg(&self) -> MonitorAlg;
}

/// Monitor settings; thresholds may follow a live value.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub upper: DynamicPoint,
    pub lower: DynamicPoint,
    pub alg: MonitorAlg,
    pub score: f64,
    pub dwell: Duration,
    pub continuous_times: u32,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            upper: DynamicPoint::Fixed(DEFAULT_UPPER_THRESHOLD),
            lower: DynamicPoint::Fixed(DEFAULT_LOWER_THRESHOLD),
            alg: MonitorAlg::Raw,
            score: DEFAULT_ZSCORE,
            dwell: DEFAULT_DWELL,
            continuous_times: DEFAULT_CONTINUOUS_TIMES,
        }
    }
}

impl MonitorOptions {
    pub fn with_upper_bound(mut self, upper: impl Into<DynamicPoint>) -> Self {
        self.upper = upper.into();
        self
    }

    pub fn with_lower_bound(mut self, lower: impl Into<DynamicPoint>) -> Self {
        self.lower = lower.into();
        self
    }

    pub fn with_alg(mut self, alg: MonitorAlg) -> Self {
        self.alg = alg;
        self
    }

    pub fn with_threshold_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell = dwell;
        self
    }

    pub fn with_continuous_times(mut self, times: u32) -> Self {
        self.continuous_times = times;
        self
    }
}

/// Build a CPU monitor for the configured algorithm.
pub fn new_cpu_monitor(options: MonitorOptions) -> Result<Arc<dyn OverloadMonitor>, ConfigError> {
    let upper = options.upper.value();
    if !(0.0..=1.0).contains(&upper) {
        return Err(ConfigError::invalid_value(
            "monitor.upper_threshold",
            "cpu usage threshold should be in 0 ~ 1",
        ));
    }

    debug!(target: "plato::monitor", alg = %options.alg, upper, lower = options.lower.value(), "cpu monitor created");
    Ok(match options.alg {
        MonitorAlg::Raw => Arc::new(RawThresholdMonitor::new(&options)),
        MonitorAlg::ZScore => Arc::new(ZScoreMonitor::new(&options)),
    })
}

fn log_transition(alg: MonitorAlg, overloaded: bool, usage: f64) {
    if overloaded {
        warn!(target: "plato::monitor", %alg, usage, "cpu overload detected");
    } else {
        info!(target: "plato::monitor", %alg, usage, "cpu overload cleared");
    }
}

// ----------------------------------------------------------------------------
// 16.1 Raw Threshold Monitor
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingTransition {
    to_overload: bool,
    due_ms: u64,
}

/// Crossing a bound schedules a transition; it commits only if the bound is
/// still crossed once the dwell has elapsed. Ticks in between are ignored.
#[derive(Debug)]
pub struct RawThresholdMonitor {
    upper: DynamicPoint,
    lower: DynamicPoint,
    dwell_ms: u64,
    overload: AtomicBool,
    pending: Mutex<Option<PendingTransition>>,
}

impl RawThresholdMonitor {
    pub fn new(options: &MonitorOptions) -> Self {
        Self {
            upper: options.upper.clone(),
            lower: options.lower.clone(),
            dwell_ms: options.dwell.as_millis() as u64,
            overload: AtomicBool::new(false),
            pending: Mutex::new(None),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn holds(&self, to_overload: bool, usage: f64) -> bool {
        if to_overload {
            usage >= self.upper.value()
        } else {
            usage < self.lower.value()
        }
    }
}

impl OverloadMonitor for RawThresholdMonitor {
    fn is_overload(&self) -> bool {
        self.overload.load(AtomicOrdering::Acquire)
    }

    fn observe(&self, sample: &LoadSample, now_ms: u64) {
        let Some(usage) = sample.usage else {
            return;
        };

        let mut pending = self.pending.lock();
        if pending.is_none() {
            let overloaded = self.is_overload();
            if self.holds(!overloaded, usage) {
                *pending = Some(PendingTransition {
                    to_overload: !overloaded,
                    due_ms: now_ms.saturating_add(self.dwell_ms),
                });
                debug!(target: "plato::monitor", to_overload = !overloaded, usage, "transition pending");
            }
        }

        if let Some(transition) = *pending {
            if now_ms < transition.due_ms {
                return;
            }
            *pending = None;
            if self.holds(transition.to_overload, usage) {
                self.overload.store(transition.to_overload, AtomicOrdering::Release);
                log_transition(MonitorAlg::Raw, transition.to_overload, usage);
            } else {
                debug!(target: "plato::monitor", usage, "pending transition abandoned");
            }
        }
    }

    fn alg(&self) -> MonitorAlg {
        MonitorAlg::Raw
    }
}

// ----------------------------------------------------------------------------
// 16.2 Z-Score Monitor
// ----------------------------------------------------------------------------

/// Transitions after more than `continuous_times` consecutive ticks whose
/// filtered window average is across the bound. A tick back inside the bound
/// resets the streak; ticks in the band between the bounds leave it alone.
#[derive(Debug)]
pub struct ZScoreMonitor {
    upper: DynamicPoint,
    lower: DynamicPoint,
    score: f64,
    continuous_times: u32,
    overload: AtomicBool,
    streak: AtomicU32,
}

impl ZScoreMonitor {
    pub fn new(options: &MonitorOptions) -> Self {
        Self {
            upper: options.upper.clone(),
            lower: options.lower.clone(),
            score: options.score,
            continuous_times: options.continuous_times,
            overload: AtomicBool::new(false),
            streak: AtomicU32::new(0),
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak.load(AtomicOrdering::Acquire)
    }

    fn hit(&self, to_overload: bool, avg: f64) {
        let streak = self.streak.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        if streak > self.continuous_times {
            self.overload.store(to_overload, AtomicOrdering::Release);
            self.streak.store(0, AtomicOrdering::Release);
            log_transition(MonitorAlg::ZScore, to_overload, avg);
        }
    }
}

impl OverloadMonitor for ZScoreMonitor {
    fn is_overload(&self) -> bool {
        self.overload.load(AtomicOrdering::Acquire)
    }

    fn observe(&self, sample: &LoadSample, _now_ms: u64) {
        let filtered = zscore_filter(&sample.window, self.score);
        if filtered.is_empty() {
            return;
        }
        let avg = average(&filtered);

        if self.is_overload() {
            if avg < self.lower.value() {
                self.hit(false, avg);
            } else if avg >= self.upper.value() {
                self.streak.store(0, AtomicOrdering::Release);
            }
        } else if avg >= self.upper.value() {
            self.hit(true, avg);
        } else if avg < self.lower.value() {
            self.streak.store(0, AtomicOrdering::Release);
        }
    }

    fn alg(&self) -> MonitorAlg {
        MonitorAlg::ZScore
    }
}

// ============================================================================
// SECTION 17: ADMISSION LIMITERS
// ============================================================================
// The driver loop samples CPU, ticks the monitor, runs the controller and
// publishes a reject rate in basis points. `limit()` reads that rate and the
// monitor flag; it never blocks and never touches the controller.
// ============================================================================

pub trait RateLimit: Send + Sync {
    /// True when this request should be shed.
    fn limit(&self) -> bool;

    /// Current reject intensity in `[0, 10000]`.
    fn limit_ratio(&self) -> f64;
}

/// Limiter construction options.
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    pub enable_metric: bool,
    pub enable_overload_scene: bool,
    pub monitor_alg: MonitorAlg,
    /// Live set-point; overrides the fixed threshold when present
    pub dynamic_point: Option<DynamicPoint>,
    pub drift: f64,
    /// Fixed monitor bounds replacing the drift band on that side
    pub upper_bound: Option<f64>,
    pub lower_bound: Option<f64>,
    pub score: f64,
    pub dwell: Duration,
    pub continuous_times: u32,
    pub interval: Duration,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            enable_metric: true,
            enable_overload_scene: false,
            monitor_alg: MonitorAlg::ZScore,
            dynamic_point: None,
            drift: DEFAULT_DRIFT,
            upper_bound: None,
            lower_bound: None,
            score: DEFAULT_ZSCORE,
            dwell: DEFAULT_DWELL,
            continuous_times: DEFAULT_CONTINUOUS_TIMES,
            interval: DEFAULT_SAMPLING_INTERVAL,
        }
    }
}

impl LimiterOptions {
    pub fn with_disable_metric(mut self) -> Self {
        self.enable_metric = false;
        self
    }

    pub fn with_enable_overload_scene(mut self) -> Self {
        self.enable_overload_scene = true;
        self
    }

    pub fn with_monitor_alg(mut self, alg: MonitorAlg) -> Self {
        self.monitor_alg = alg;
        self
    }

    pub fn with_dynamic_point<F>(mut self, f: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.dynamic_point = Some(DynamicPoint::dynamic(f));
        self
    }

    pub fn with_drift(mut self, drift: f64) -> Self {
        self.drift = drift;
        self
    }

    pub fn with_upper_bound(mut self, upper: f64) -> Self {
        self.upper_bound = Some(upper);
        self
    }

    pub fn with_lower_bound(mut self, lower: f64) -> Self {
        self.lower_bound = Some(lower);
        self
    }

    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell = dwell;
        self
    }

    pub fn with_continuous_times(mut self, times: u32) -> Self {
        self.continuous_times = times;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl From<&PlatoConfig> for LimiterOptions {
    fn from(config: &PlatoConfig) -> Self {
        Self {
            enable_metric: config.limiter.enable_metric,
            enable_overload_scene: config.limiter.enable_overload_scene,
            monitor_alg: config.monitor.alg,
            dynamic_point: None,
            drift: config.limiter.drift,
            upper_bound: config.monitor.upper_threshold,
            lower_bound: config.monitor.lower_threshold,
            score: config.monitor.score,
            dwell: config.monitor.dwell,
            continuous_times: config.monitor.continuous_times,
            interval: config.limiter.sampling_interval,
        }
    }
}

/// Upper and lower monitor bounds around the set-point, kept inside
/// `[0.01, 0.99]`. A fixed bound in `options` wins over its side of the band.
fn hysteresis_band(set_point: f64, options: &LimiterOptions) -> (DynamicPoint, DynamicPoint) {
    let (upper, lower) = drift_band(set_point, options);
    (
        options.upper_bound.map_or(upper, DynamicPoint::Fixed),
        options.lower_bound.map_or(lower, DynamicPoint::Fixed),
    )
}

fn drift_band(set_point: f64, options: &LimiterOptions) -> (DynamicPoint, DynamicPoint) {
    let drift = options.drift;
    match &options.dynamic_point {
        Some(point) => {
            let (upper, lower) = (point.clone(), point.clone());
            (
                DynamicPoint::dynamic(move || (upper.value() + drift).min(0.99)),
                DynamicPoint::dynamic(move || (lower.value() - drift).max(0.01)),
            )
        }
        None => (
            DynamicPoint::Fixed((set_point + drift).min(0.99)),
            DynamicPoint::Fixed((set_point - drift).max(0.01)),
        ),
    }
}

/// Point-in-time limiter state for status output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LimiterStatus {
    pub usage: f64,
    pub threshold: f64,
    pub reject_ratio: f64,
    pub overloaded: bool,
}

// ----------------------------------------------------------------------------
// 17.1 PID Limiter
// ----------------------------------------------------------------------------

pub struct PidLimiter {
    rate: AtomicU32,
    pid: Mutex<PidController>,
    monitor: Arc<dyn OverloadMonitor>,
    sampler: Arc<CpuSampler>,
    enable_metric: bool,
    enable_overload_scene: bool,
    interval: Duration,
    last_usage: AtomicF64,
    driver: OnceCell<PeriodicTask>,
}

impl PidLimiter {
    pub fn new(
        kp: f64,
        ki: f64,
        kd: f64,
        set_point: f64,
        options: LimiterOptions,
        sampler: Arc<CpuSampler>,
    ) -> Result<Self, ConfigError> {
        if options.dynamic_point.is_none() && !(0.0..=1.0).contains(&set_point) {
            return Err(ConfigError::invalid_value(
                "limiter.cpu_threshold",
                "cpu usage threshold should be in 0 ~ 1",
            ));
        }
        let (upper, lower) = hysteresis_band(set_point, &options);
        let monitor = new_cpu_monitor(MonitorOptions {
            upper,
            lower,
            alg: options.monitor_alg,
            score: options.score,
            dwell: options.dwell,
            continuous_times: options.continuous_times,
        })?;
        let point = options
            .dynamic_point
            .clone()
            .unwrap_or(DynamicPoint::Fixed(set_point));

        info!(
            target: "plato::limiter",
            kp, ki, kd,
            set_point = point.value(),
            alg = %options.monitor_alg,
            source = sampler.source_name(),
            "pid limiter created"
        );

        Ok(Self {
            rate: AtomicU32::new(0),
            pid: Mutex::new(PidController::with_set_point(kp, ki, kd, point)),
            monitor,
            sampler,
            enable_metric: options.enable_metric,
            enable_overload_scene: options.enable_overload_scene,
            interval: options.interval,
            last_usage: AtomicF64::new(0.0),
            driver: OnceCell::new(),
        })
    }

    /// Limiter with gains tuned for HTTP services.
    pub fn http_default(
        cpu_threshold: f64,
        options: LimiterOptions,
        sampler: Arc<CpuSampler>,
    ) -> Result<Self, ConfigError> {
        let (kp, ki, kd) = if options.enable_overload_scene {
            HTTP_OVERLOAD_SCENE_GAINS
        } else {
            HTTP_DEFAULT_GAINS
        };
        Self::new(kp, ki, kd, cpu_threshold, options, sampler)
    }

    pub fn from_config(config: &PlatoConfig, sampler: Arc<CpuSampler>) -> Result<Self, ConfigError> {
        let options = LimiterOptions::from(config);
        let (kp, ki, kd) = if options.enable_overload_scene {
            HTTP_OVERLOAD_SCENE_GAINS
        } else {
            HTTP_DEFAULT_GAINS
        };
        let limiter = &config.limiter;
        Self::new(
            limiter.kp.unwrap_or(kp),
            limiter.ki.unwrap_or(ki),
            limiter.kd.unwrap_or(kd),
            limiter.cpu_threshold,
            options,
            sampler,
        )
    }

    /// Start the driver loop. Only the first call spawns it.
    pub fn start(self: &Arc<Self>) -> PlatoResult<()> {
        self.driver.get_or_try_init(|| {
            let weak = Arc::downgrade(self);
            PeriodicTask::spawn("plato-limiter", self.interval, move || {
                if let Some(limiter) = weak.upgrade() {
                    limiter.tick();
                }
            })
        })?;
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(driver) = self.driver.get() {
            driver.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.driver.get().map_or(false, PeriodicTask::is_running)
    }

    pub fn tick(&self) {
        self.tick_at(current_time_millis());
    }

    /// One driver step. Polls the sampler unless it runs its own loop.
    pub fn tick_at(&self, now_ms: u64) {
        if !self.sampler.is_running() {
            self.sampler.poll_at(now_ms);
        }
        let sample = self.sampler.snapshot();
        self.monitor.observe(&sample, now_ms);

        let mut usage = self.sampler.current_usage();
        if !self.enable_overload_scene {
            usage = usage.min(1.0);
        }

        let (output, threshold) = {
            let mut pid = self.pid.lock();
            (pid.compute_at(usage, now_ms), pid.threshold())
        };
        let reject = (-output).max(0.0) as u32;
        self.rate.store(reject, AtomicOrdering::Release);
        self.last_usage.store(usage, AtomicOrdering::Release);

        if self.enable_metric {
            info!(
                target: "plato::limiter",
                usage,
                threshold,
                reject_rate = reject,
                overloaded = self.monitor.is_overload(),
                "limiter tick"
            );
        }
    }

    /// Raw controller output in basis points, whether or not overloaded.
    pub fn reject_rate(&self) -> u32 {
        self.rate.load(AtomicOrdering::Acquire)
    }

    pub fn monitor(&self) -> &Arc<dyn OverloadMonitor> {
        &self.monitor
    }

    pub fn sampler(&self) -> &Arc<CpuSampler> {
        &self.sampler
    }

    pub fn status(&self) -> LimiterStatus {
        LimiterStatus {
            usage: self.last_usage.load(AtomicOrdering::Acquire),
            threshold: self.pid.lock().threshold(),
            reject_ratio: self.limit_ratio(),
            overloaded: self.monitor.is_overload(),
        }
    }
}

impl RateLimit for PidLimiter {
    fn limit(&self) -> bool {
        self.monitor.is_overload()
            && fast_rand_u32n(REJECT_RATIO_SCALE) < self.rate.load(AtomicOrdering::Acquire)
    }

    fn limit_ratio(&self) -> f64 {
        if !self.monitor.is_overload() {
            return 0.0;
        }
        f64::from(self.rate.load(AtomicOrdering::Acquire)).clamp(0.0, f64::from(REJECT_RATIO_SCALE))
    }
}

impl Debug for PidLimiter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidLimiter")
            .field("reject_rate", &self.reject_rate())
            .field("monitor", &self.monitor)
            .field("sampler", &self.sampler)
            .field("running", &self.is_running())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 17.2 Tuning Limiter
// ----------------------------------------------------------------------------

/// Drives a relay experiment against live load and sheds with the relay
/// output while it runs. Once tuning finishes it admits everything and the
/// learned gains can seed a [`PidLimiter`].
pub struct TunedLimiter {
    output: AtomicF64,
    tuner: Mutex<RelayTuner>,
    sampler: Arc<CpuSampler>,
    interval: Duration,
    driver: OnceCell<PeriodicTask>,
}

impl TunedLimiter {
    pub fn new(target: f64, sampler: Arc<CpuSampler>) -> Self {
        Self::with_tuner(RelayTuner::new(target), sampler, DEFAULT_SAMPLING_INTERVAL)
    }

    pub fn with_tuner(tuner: RelayTuner, sampler: Arc<CpuSampler>, interval: Duration) -> Self {
        Self {
            output: AtomicF64::new(OUT_MAX),
            tuner: Mutex::new(tuner),
            sampler,
            interval,
            driver: OnceCell::new(),
        }
    }

    pub fn start(self: &Arc<Self>) -> PlatoResult<()> {
        self.driver.get_or_try_init(|| {
            let weak = Arc::downgrade(self);
            PeriodicTask::spawn("plato-tuner", self.interval, move || {
                if let Some(limiter) = weak.upgrade() {
                    limiter.tick();
                }
            })
        })?;
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(driver) = self.driver.get() {
            driver.stop();
        }
    }

    pub fn tick(&self) {
        self.tick_at(current_time_millis());
    }

    pub fn tick_at(&self, now_ms: u64) {
        if !self.sampler.is_running() {
            self.sampler.poll_at(now_ms);
        }
        let usage = self.sampler.current_usage();
        let output = self.tuner.lock().tune_at(usage, now_ms);
        self.output.store(output, AtomicOrdering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.tuner.lock().is_finished()
    }

    /// Learned `(kp, ki, kd)` once the experiment is over.
    pub fn gains(&self) -> Option<(f64, f64, f64)> {
        let tuner = self.tuner.lock();
        tuner
            .is_finished()
            .then(|| (tuner.kp(), tuner.ki(), tuner.kd()))
    }
}

impl RateLimit for TunedLimiter {
    fn limit(&self) -> bool {
        (fast_rand_u32n(REJECT_RATIO_SCALE) as f64) < self.limit_ratio()
    }

    fn limit_ratio(&self) -> f64 {
        (-self.output.load(AtomicOrdering::Acquire)).clamp(0.0, f64::from(REJECT_RATIO_SCALE))
    }
}

impl Debug for TunedLimiter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunedLimiter")
            .field("output", &self.output.load(AtomicOrdering::Acquire))
            .field("tuner", &*self.tuner.lock())
            .finish()
    }
}

#[cfg(test)]
mod limiter_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const T0: u64 = 1_700_000_000_000;

    fn reading(usage: f64) -> LoadSample {
        LoadSample {
            usage: Some(usage),
            window: vec![usage],
        }
    }

    fn flat(usage: f64) -> LoadSample {
        LoadSample {
            usage: Some(usage),
            window: vec![usage; 10],
        }
    }

    fn constant_sampler(usage: f64) -> Arc<CpuSampler> {
        Arc::new(CpuSampler::new(Arc::new(move || -> LoadResult<f64> { Ok(usage) })))
    }

    // ---- Raw monitor ----

    #[test]
    fn test_raw_monitor_sustained_load_transitions_once() {
        let monitor = new_cpu_monitor(
            MonitorOptions::default()
                .with_upper_bound(0.8)
                .with_lower_bound(0.72)
                .with_alg(MonitorAlg::Raw),
        )
        .unwrap();

        let mut transitions = Vec::new();
        let mut previous = monitor.is_overload();
        for step in 0..=100u64 {
            let now = T0 + step * 100;
            monitor.observe(&reading(0.95), now);
            let current = monitor.is_overload();
            if current != previous {
                transitions.push((now, current));
                previous = current;
            }
        }

        assert_eq!(transitions, vec![(T0 + 6_000, true)]);
        assert_eq!(monitor.alg(), MonitorAlg::Raw);
    }

    #[test]
    fn test_raw_monitor_abandons_transition_when_load_recedes() {
        let monitor = RawThresholdMonitor::new(
            &MonitorOptions::default()
                .with_upper_bound(0.8)
                .with_lower_bound(0.72)
                .with_dwell(Duration::from_secs(1)),
        );

        monitor.observe(&reading(0.9), T0);
        assert!(monitor.is_pending());
        // spike and recovery inside the dwell are ignored
        monitor.observe(&reading(0.1), T0 + 500);
        assert!(monitor.is_pending());

        monitor.observe(&reading(0.5), T0 + 1_000);
        assert!(!monitor.is_pending());
        assert!(!monitor.is_overload());

        monitor.observe(&reading(0.9), T0 + 1_100);
        monitor.observe(&reading(0.85), T0 + 2_100);
        assert!(monitor.is_overload());

        // recovery needs the lower bound to hold after the dwell too
        monitor.observe(&reading(0.7), T0 + 2_200);
        monitor.observe(&reading(0.75), T0 + 3_200);
        assert!(monitor.is_overload());
        monitor.observe(&reading(0.6), T0 + 3_300);
        monitor.observe(&reading(0.6), T0 + 4_300);
        assert!(!monitor.is_overload());
    }

    #[test]
    fn test_raw_monitor_ignores_failed_readings() {
        let monitor = RawThresholdMonitor::new(
            &MonitorOptions::default().with_upper_bound(0.8).with_dwell(Duration::ZERO),
        );
        monitor.observe(&LoadSample::default(), T0);
        assert!(!monitor.is_overload());
        assert!(!monitor.is_pending());

        monitor.observe(&reading(0.8), T0 + 100);
        assert!(monitor.is_overload());
    }

    #[test]
    fn test_monitor_rejects_upper_bound_outside_unit_range() {
        let err = new_cpu_monitor(MonitorOptions::default().with_upper_bound(1.2)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    // ---- Z-score monitor ----

    #[test]
    fn test_zscore_monitor_needs_more_than_continuous_hits() {
        let monitor = ZScoreMonitor::new(
            &MonitorOptions::default()
                .with_alg(MonitorAlg::ZScore)
                .with_upper_bound(0.9)
                .with_lower_bound(0.81),
        );

        for _ in 0..30 {
            monitor.observe(&flat(0.95), T0);
        }
        assert!(!monitor.is_overload());
        assert_eq!(monitor.streak(), 30);

        monitor.observe(&flat(0.95), T0);
        assert!(monitor.is_overload());
        assert_eq!(monitor.streak(), 0);

        for _ in 0..31 {
            monitor.observe(&flat(0.5), T0);
        }
        assert!(!monitor.is_overload());
    }

    #[test]
    fn test_zscore_monitor_streak_resets_and_band_holds() {
        let monitor = ZScoreMonitor::new(
            &MonitorOptions::default()
                .with_upper_bound(0.9)
                .with_lower_bound(0.81)
                .with_continuous_times(3),
        );

        monitor.observe(&flat(0.95), T0);
        monitor.observe(&flat(0.95), T0);
        assert_eq!(monitor.streak(), 2);

        // between the bounds: streak untouched
        monitor.observe(&flat(0.85), T0);
        assert_eq!(monitor.streak(), 2);

        monitor.observe(&flat(0.5), T0);
        assert_eq!(monitor.streak(), 0);

        monitor.observe(&LoadSample::default(), T0);
        assert_eq!(monitor.streak(), 0);
        assert!(!monitor.is_overload());
    }

    #[test]
    fn test_zscore_monitor_filters_spikes() {
        let monitor = ZScoreMonitor::new(
            &MonitorOptions::default()
                .with_upper_bound(0.9)
                .with_lower_bound(0.81)
                .with_continuous_times(0),
        );
        let mut window = vec![0.3; 20];
        window.push(1.0);
        monitor.observe(&LoadSample { usage: Some(1.0), window }, T0);
        assert!(!monitor.is_overload());
    }

    // ---- PID limiter ----

    #[test]
    fn test_limiter_sheds_everything_at_full_output() {
        let options = LimiterOptions::default()
            .with_monitor_alg(MonitorAlg::Raw)
            .with_dwell(Duration::ZERO)
            .with_disable_metric();
        let limiter = PidLimiter::new(1.0e6, 0.0, 0.0, 0.5, options, constant_sampler(0.95)).unwrap();

        assert!(!limiter.limit());
        assert_eq!(limiter.limit_ratio(), 0.0);

        limiter.tick_at(current_time_millis() + 100);
        assert!(limiter.monitor().is_overload());
        assert_eq!(limiter.reject_rate(), REJECT_RATIO_SCALE);
        assert_eq!(limiter.limit_ratio(), 10_000.0);
        assert!((0..1_000).all(|_| limiter.limit()));

        let status = limiter.status();
        assert_eq!(status.usage, 0.95);
        assert_eq!(status.threshold, 0.5);
        assert!(status.overloaded);
    }

    #[test]
    fn test_limiter_admits_while_monitor_is_calm() {
        let options = LimiterOptions::default().with_disable_metric();
        let limiter = PidLimiter::http_default(0.5, options, constant_sampler(0.95)).unwrap();

        limiter.tick_at(current_time_millis() + 100);
        assert!(limiter.reject_rate() > 0);
        assert!(!limiter.monitor().is_overload());
        assert_eq!(limiter.limit_ratio(), 0.0);
        assert!((0..1_000).all(|_| !limiter.limit()));
    }

    #[test]
    fn test_limiter_clamps_usage_outside_overload_scene() {
        let clamped = PidLimiter::http_default(
            0.8,
            LimiterOptions::default().with_disable_metric(),
            constant_sampler(1.5),
        )
        .unwrap();
        clamped.tick_at(current_time_millis() + 100);
        assert_eq!(clamped.status().usage, 1.0);

        let scene = PidLimiter::http_default(
            0.8,
            LimiterOptions::default().with_disable_metric().with_enable_overload_scene(),
            constant_sampler(1.5),
        )
        .unwrap();
        scene.tick_at(current_time_millis() + 100);
        assert_eq!(scene.status().usage, 1.5);
    }

    #[test]
    fn test_limiter_rejects_threshold_outside_unit_range() {
        let err = PidLimiter::http_default(1.5, LimiterOptions::default(), constant_sampler(0.1)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_limiter_follows_dynamic_set_point() {
        let point = Arc::new(AtomicF64::new(0.6));
        let shared = Arc::clone(&point);
        let options = LimiterOptions::default()
            .with_disable_metric()
            .with_dynamic_point(move || shared.load(AtomicOrdering::Acquire));
        let limiter = PidLimiter::http_default(0.0, options, constant_sampler(0.3)).unwrap();

        assert_eq!(limiter.status().threshold, 0.6);
        point.store(0.7, AtomicOrdering::Release);
        assert_eq!(limiter.status().threshold, 0.7);
    }

    #[test]
    fn test_hysteresis_band_is_clamped() {
        let options = LimiterOptions::default().with_drift(0.1);
        let (upper, lower) = hysteresis_band(0.95, &options);
        assert_eq!(upper.value(), 0.99);
        assert!((lower.value() - 0.85).abs() < 1e-12);

        let (_, lower) = hysteresis_band(0.05, &options);
        assert_eq!(lower.value(), 0.01);
    }

    #[test]
    fn test_limiter_uses_configured_monitor_bounds() {
        let mut config = PlatoConfig::default();
        config.limiter.enable_metric = false;
        config.monitor.continuous_times = 2;

        let banded = PidLimiter::from_config(&config, constant_sampler(0.5)).unwrap();

        config.monitor.upper_threshold = Some(0.3);
        config.monitor.lower_threshold = Some(0.2);
        let bounded = PidLimiter::from_config(&config, constant_sampler(0.5)).unwrap();

        let start = current_time_millis();
        for step in 1..=20u64 {
            banded.tick_at(start + step * 100);
            bounded.tick_at(start + step * 100);
        }
        assert_eq!(banded.monitor().alg(), MonitorAlg::ZScore);
        assert!(!banded.monitor().is_overload());
        assert!(bounded.monitor().is_overload());
        // the set-point itself is untouched
        assert_eq!(bounded.status().threshold, 0.8);
    }

    #[test]
    fn test_hysteresis_band_prefers_fixed_bounds() {
        let options = LimiterOptions::default().with_drift(0.1).with_upper_bound(0.6);
        let (upper, lower) = hysteresis_band(0.8, &options);
        assert_eq!(upper.value(), 0.6);
        assert!((lower.value() - 0.7).abs() < 1e-12);

        let (_, lower) = hysteresis_band(0.8, &options.with_lower_bound(0.4));
        assert_eq!(lower.value(), 0.4);
    }

    #[test]
    fn test_limiter_driver_start_stop() {
        let options = LimiterOptions::default()
            .with_disable_metric()
            .with_interval(Duration::from_millis(5));
        let limiter = Arc::new(PidLimiter::http_default(0.5, options, constant_sampler(0.9)).unwrap());

        limiter.start().unwrap();
        limiter.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(limiter.is_running());
        assert!(limiter.reject_rate() > 0);

        limiter.stop();
        assert!(!limiter.is_running());
    }

    // ---- Tuning limiter ----

    #[test]
    fn test_tuned_limiter_sheds_with_relay_output() {
        let step = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&step);
        let sampler = Arc::new(CpuSampler::new(Arc::new(move || -> LoadResult<f64> {
            let n = counter.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(if n % 2 == 0 { 0.8 } else { 0.2 })
        })));
        let limiter = TunedLimiter::with_tuner(
            RelayTuner::with_budget(0.5, 2, T0),
            sampler,
            Duration::from_millis(100),
        );

        limiter.tick_at(T0 + 100);
        assert_eq!(limiter.limit_ratio(), 10_000.0);
        assert!(limiter.limit());

        limiter.tick_at(T0 + 200);
        assert_eq!(limiter.limit_ratio(), 0.0);
        assert!(!limiter.limit());
        assert_eq!(limiter.gains(), None);

        limiter.tick_at(T0 + 300);
        limiter.tick_at(T0 + 400);
        assert!(limiter.is_finished());
        let (kp, ki, kd) = limiter.gains().unwrap();
        assert!(kp > 0.0 && ki > 0.0 && kd > 0.0);
        assert_eq!(limiter.limit_ratio(), 0.0);
    }
}

// ============================================================================
// SECTION 18: FIXED-SIZE EXECUTOR POOL
// ============================================================================
// Fixed worker threads draining a bounded job queue. Submission never
// blocks: a full queue completes the returned future with `Rejected`.
// ============================================================================

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion flag shared by a future and the job that fulfils it.
#[derive(Debug, Default)]
struct FutureState {
    done: AtomicBool,
}

impl FutureState {
    fn mark_done(&self) -> bool {
        self.done
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    fn is_done(&self) -> bool {
        self.done.load(AtomicOrdering::Acquire)
    }

    /// Deliver `result` unless someone else already completed the future.
    fn complete<T>(&self, tx: &Sender<ExecutorResult<T>>, result: ExecutorResult<T>) -> bool {
        if !self.mark_done() {
            return false;
        }
        let _ = tx.try_send(result);
        true
    }
}

/// Handle to the outcome of a submitted task.
#[derive(Debug)]
pub struct TaskFuture<T> {
    rx: Receiver<ExecutorResult<T>>,
    state: Arc<FutureState>,
}

impl<T> TaskFuture<T> {
    fn completed(result: ExecutorResult<T>) -> Self {
        let (tx, rx) = bounded(1);
        let state = Arc::new(FutureState::default());
        state.complete(&tx, result);
        Self { rx, state }
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Wait up to `timeout` for the result. A task that has not started by
    /// then is skipped by the worker.
    pub fn get(self, timeout: Duration) -> ExecutorResult<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                if self.state.mark_done() {
                    Err(ExecutorError::Timeout(timeout))
                } else {
                    // completed concurrently, the send is in flight
                    self.rx.recv().unwrap_or(Err(ExecutorError::Closed))
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(ExecutorError::Closed),
        }
    }

    /// Take the result if the task already finished. The result is consumed:
    /// a second call returns `None` just like an unfinished task.
    fn try_get(&self) -> Option<ExecutorResult<T>> {
        self.rx.try_recv().ok()
    }
}

pub struct FixedSizeExecutorPool {
    jobs: Sender<Job>,
    pending: Receiver<Job>,
    close_tx: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    queue_size: usize,
}

impl FixedSizeExecutorPool {
    pub fn new(workers: usize, queue_size: usize) -> ExecutorResult<Self> {
        if workers == 0 {
            return Err(ExecutorError::InvalidArgument("worker count must be positive".into()));
        }

        let (jobs_tx, jobs_rx) = bounded::<Job>(queue_size);
        let (close_tx, close_rx) = bounded::<()>(0);

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let jobs = jobs_rx.clone();
            let close = close_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("plato-worker-{}", id))
                .spawn(move || worker_loop(jobs, close))
                .map_err(|e| ExecutorError::Failed(format!("spawn worker {}: {}", id, e)))?;
            handles.push(handle);
        }

        debug!(target: "plato::executor", workers, queue_size, "executor pool started");
        Ok(Self {
            jobs: jobs_tx,
            pending: jobs_rx,
            close_tx: Mutex::new(Some(close_tx)),
            closed: AtomicBool::new(false),
            workers: Mutex::new(handles),
            worker_count: workers,
            queue_size,
        })
    }

    pub fn from_config(config: &ExecutorConfig) -> ExecutorResult<Self> {
        Self::new(config.workers, config.queue_size)
    }

    /// Queue `f` and return a future for its result.
    pub fn submit<T, F>(&self, f: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> ExecutorResult<T> + Send + 'static,
    {
        if self.is_closed() {
            return TaskFuture::completed(Err(ExecutorError::Closed));
        }

        let (tx, rx) = bounded(1);
        let state = Arc::new(FutureState::default());
        let future = TaskFuture {
            rx,
            state: Arc::clone(&state),
        };

        let job_state = Arc::clone(&state);
        let job_tx = tx.clone();
        let job: Job = Box::new(move || {
            if job_state.is_done() {
                return;
            }
            let result = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(&*payload);
                    error!(target: "plato::executor", panic = %message, "task panicked");
                    Err(ExecutorError::Panicked(message))
                }
            };
            job_state.complete(&job_tx, result);
        });

        match self.jobs.try_send(job) {
            Ok(()) => {
                // lost the race against close()
                if self.is_closed() {
                    self.discard_pending();
                }
            }
            Err(TrySendError::Full(_)) => {
                trace!(target: "plato::executor", "queue full, task rejected");
                state.complete(&tx, Err(ExecutorError::Rejected));
            }
            Err(TrySendError::Disconnected(_)) => {
                state.complete(&tx, Err(ExecutorError::Closed));
            }
        }
        future
    }

    /// Fire-and-forget submission. Errors only when the task could not be
    /// queued or already failed.
    pub fn run<F>(&self, f: F) -> ExecutorResult<()>
    where
        F: FnOnce() -> ExecutorResult<()> + Send + 'static,
    {
        let future = self.submit(f);
        if future.is_done() {
            return future.try_get().unwrap_or(Ok(()));
        }
        Ok(())
    }

    /// Stop accepting work and join the workers. In-flight tasks finish;
    /// queued ones resolve to `Closed`. Idempotent.
    pub fn close(&self) {
        let Some(close_tx) = self.close_tx.lock().take() else {
            return;
        };
        drop(close_tx);
        self.closed.store(true, AtomicOrdering::Release);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(target: "plato::executor", "worker exited abnormally");
            }
        }
        let discarded = self.discard_pending();
        debug!(target: "plato::executor", discarded, "executor pool closed");
    }

    /// Drop queued jobs. Each dropped job disconnects its future, which then
    /// resolves to `Closed`.
    fn discard_pending(&self) -> usize {
        self.pending.try_iter().count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.jobs.len()
    }
}

fn worker_loop(jobs: Receiver<Job>, close: Receiver<()>) {
    loop {
        select! {
            recv(close) -> _ => break,
            recv(jobs) -> job => match job {
                Ok(job) => {
                    // close wins over queued work
                    if let Err(TryRecvError::Disconnected) = close.try_recv() {
                        break;
                    }
                    job()
                }
                Err(_) => break,
            },
        }
    }
}

impl Drop for FixedSizeExecutorPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl Debug for FixedSizeExecutorPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizeExecutorPool")
            .field("workers", &self.worker_count)
            .field("queue_size", &self.queue_size)
            .field("queued", &self.queued())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// SECTION 19: ENTRIES, METRICS & RULES
// ============================================================================
// An entry is a named resource: callers bracket work with enter/exit, the
// outcomes land in its sliding window, and derived metrics are cached for
// cheap reads from rules.
// ============================================================================

// ----------------------------------------------------------------------------
// 19.1 Metrics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Qps,
    ErrorRate,
    AvgResponseTime,
    P90ResponseTimeApprox,
    Custom(&'static str),
}

impl MetricKind {
    pub const BUILTIN: [MetricKind; 4] = [
        MetricKind::Qps,
        MetricKind::ErrorRate,
        MetricKind::AvgResponseTime,
        MetricKind::P90ResponseTimeApprox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Qps => "qps",
            MetricKind::ErrorRate => "error_rate",
            MetricKind::AvgResponseTime => "avg_rt",
            MetricKind::P90ResponseTimeApprox => "p90_rt",
            MetricKind::Custom(name) => *name,
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric calculation over a window at a point in time.
pub type MetricFn = Arc<dyn Fn(&SlidingWindowMetric, u64) -> f64 + Send + Sync>;

/// Errors over everything that finished or was turned away.
pub fn error_rate_at(stats: &SlidingWindowMetric, now_ms: u64) -> f64 {
    let error = stats.sum_with_time(now_ms, MetricEvent::Error);
    let complete = stats.sum_with_time(now_ms, MetricEvent::Complete);
    let block = stats.sum_with_time(now_ms, MetricEvent::Block);
    let total = complete + block;
    if total == 0 {
        return 0.0;
    }
    error as f64 / total as f64
}

/// Completions per second over the last full second, excluding the bucket
/// still being written.
pub fn qps_at(stats: &SlidingWindowMetric, now_ms: u64) -> f64 {
    let end = now_ms.saturating_sub(stats.real().bucket_length_ms() as u64);
    stats.avg_with_time(MetricEvent::Complete, end.saturating_sub(1_000), end)
}

pub fn avg_response_time_at(stats: &SlidingWindowMetric, now_ms: u64) -> f64 {
    let complete = stats.sum_with_time(now_ms, MetricEvent::Complete);
    if complete == 0 {
        return 0.0;
    }
    stats.sum_with_time(now_ms, MetricEvent::Rt) as f64 / complete as f64
}

/// 90th percentile of the per-bucket minimum response times. A cheap
/// approximation, not a true latency percentile.
pub fn p90_response_time_approx_at(stats: &SlidingWindowMetric, now_ms: u64) -> f64 {
    let mut samples = stats.min_rt_samples_with_time(now_ms);
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_unstable();
    let index = ((samples.len() as f64 * 0.9).floor() as usize).min(samples.len() - 1);
    samples[index] as f64
}

fn builtin_metric_fn(kind: MetricKind) -> Option<MetricFn> {
    let f: MetricFn = match kind {
        MetricKind::Qps => Arc::new(qps_at),
        MetricKind::ErrorRate => Arc::new(error_rate_at),
        MetricKind::AvgResponseTime => Arc::new(avg_response_time_at),
        MetricKind::P90ResponseTimeApprox => Arc::new(p90_response_time_approx_at),
        MetricKind::Custom(_) => return None,
    };
    Some(f)
}

/// A derived value over an entry's window, cached between recalculations.
pub struct Metric {
    kind: MetricKind,
    value: AtomicF64,
    stats: Arc<SlidingWindowMetric>,
    calc: MetricFn,
}

impl Metric {
    pub fn new(kind: MetricKind, stats: Arc<SlidingWindowMetric>, calc: MetricFn) -> Self {
        Self {
            kind,
            value: AtomicF64::new(0.0),
            stats,
            calc,
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Cached value from the last refresh.
    pub fn value(&self) -> f64 {
        self.value.load(AtomicOrdering::Acquire)
    }

    pub fn calculate_at(&self, now_ms: u64) -> f64 {
        (self.calc)(&self.stats, now_ms)
    }

    pub fn refresh(&self) -> f64 {
        self.refresh_at(current_time_millis())
    }

    /// Recompute and publish the value.
    pub fn refresh_at(&self, now_ms: u64) -> f64 {
        let value = self.calculate_at(now_ms);
        self.value.set(value);
        value
    }
}

impl Debug for Metric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("kind", &self.kind)
            .field("value", &self.value())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 19.2 Entry
// ----------------------------------------------------------------------------

/// Admission decision for one request.
pub trait Rule: Send + Sync {
    /// True to admit.
    fn decide(&self, entry: &Entry, ctx: &EntryContext) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryContext {
    pub start_ms: u64,
}

impl EntryContext {
    pub fn new() -> Self {
        Self {
            start_ms: current_time_millis(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        current_time_millis().saturating_sub(self.start_ms)
    }
}

impl Default for EntryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of [`Entry::run`].
#[derive(Error, Debug)]
pub enum RunError<E> {
    #[error("reject by rule")]
    Rejected,

    #[error("{0}")]
    Failed(E),
}

pub struct Entry {
    name: String,
    rule: RwLock<Option<Arc<dyn Rule>>>,
    stats: Arc<SlidingWindowMetric>,
    metrics: HashMap<MetricKind, Arc<Metric>>,
}

impl Entry {
    /// Entry over the default window (20 buckets, 2s) with the given
    /// built-in metrics.
    pub fn new(name: impl Into<String>, kinds: &[MetricKind]) -> Self {
        Self::with_stats(name, Arc::new(SlidingWindowMetric::default()), kinds)
    }

    pub fn with_default_metrics(name: impl Into<String>) -> Self {
        Self::new(name, &MetricKind::BUILTIN)
    }

    pub fn with_window(
        name: impl Into<String>,
        sample_count: u32,
        interval_ms: u32,
        kinds: &[MetricKind],
    ) -> StatResult<Self> {
        let stats = SlidingWindowMetric::with_window(sample_count, interval_ms)?;
        Ok(Self::with_stats(name, Arc::new(stats), kinds))
    }

    /// Entry over the window described by `[stats]`.
    pub fn from_config(name: impl Into<String>, config: &StatsConfig, kinds: &[MetricKind]) -> StatResult<Self> {
        Self::with_window(name, config.sample_count, config.interval_ms, kinds)
    }

    fn with_stats(name: impl Into<String>, stats: Arc<SlidingWindowMetric>, kinds: &[MetricKind]) -> Self {
        let metrics = kinds
            .iter()
            .filter_map(|kind| {
                builtin_metric_fn(*kind).map(|calc| (*kind, Arc::new(Metric::new(*kind, Arc::clone(&stats), calc))))
            })
            .collect();
        Self {
            name: name.into(),
            rule: RwLock::new(None),
            stats,
            metrics,
        }
    }

    /// Register a custom metric computed from this entry's window.
    pub fn with_custom_metric<F>(mut self, name: &'static str, f: F) -> Self
    where
        F: Fn(&SlidingWindowMetric, u64) -> f64 + Send + Sync + 'static,
    {
        let kind = MetricKind::Custom(name);
        let metric = Metric::new(kind, Arc::clone(&self.stats), Arc::new(f));
        self.metrics.insert(kind, Arc::new(metric));
        self
    }

    pub fn with_rule(self, rule: Arc<dyn Rule>) -> Self {
        self.set_rule(rule);
        self
    }

    pub fn set_rule(&self, rule: Arc<dyn Rule>) {
        *self.rule.write() = Some(rule);
    }

    pub fn clear_rule(&self) {
        *self.rule.write() = None;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Arc<SlidingWindowMetric> {
        &self.stats
    }

    pub fn metric(&self, kind: MetricKind) -> Option<&Arc<Metric>> {
        self.metrics.get(&kind)
    }

    pub fn metric_list(&self) -> Vec<Arc<Metric>> {
        self.metrics.values().cloned().collect()
    }

    /// Count an admitted request without consulting the rule.
    pub fn record_start(&self) -> EntryContext {
        self.stats.add_count(MetricEvent::Pass, 1);
        EntryContext::new()
    }

    /// Consult the rule, counting the request as passed or blocked.
    pub fn enter(&self) -> PlatoResult<EntryContext> {
        let ctx = EntryContext::new();
        let rule = self.rule.read().clone();
        if let Some(rule) = rule {
            if !rule.decide(self, &ctx) {
                self.stats.add_count(MetricEvent::Block, 1);
                return Err(PlatoError::RejectedByRule);
            }
        }
        self.stats.add_count(MetricEvent::Pass, 1);
        Ok(ctx)
    }

    /// Record completion and response time.
    pub fn record_end(&self, ctx: &EntryContext) {
        self.stats.add_count(MetricEvent::Rt, ctx.elapsed_ms() as i64);
        self.stats.add_count(MetricEvent::Complete, 1);
    }

    pub fn exit(&self, ctx: &EntryContext) {
        self.record_end(ctx);
    }

    pub fn record_error(&self, _ctx: &EntryContext) {
        self.report_error();
    }

    pub fn report_error(&self) {
        self.stats.add_count(MetricEvent::Error, 1);
    }

    /// Enter, run `f`, exit, and count an error if it failed.
    pub fn run<T, E, F>(&self, f: F) -> Result<T, RunError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let ctx = self.enter().map_err(|_| RunError::Rejected)?;
        let result = f();
        self.record_end(&ctx);
        result.map_err(|e| {
            self.record_error(&ctx);
            RunError::Failed(e)
        })
    }

    /// Cached metric value; 0 when the entry does not track `kind`.
    pub fn query(&self, kind: MetricKind) -> f64 {
        self.metrics.get(&kind).map_or(0.0, |m| m.value())
    }

    /// Recompute `kind` now and refresh the cache.
    pub fn calculate(&self, kind: MetricKind) -> f64 {
        self.metrics.get(&kind).map_or(0.0, |m| m.refresh())
    }
}

impl Debug for Entry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("metrics", &self.metrics.keys().collect::<Vec<_>>())
            .field("has_rule", &self.rule.read().is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 19.3 Flow Checks
// ----------------------------------------------------------------------------

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Admit when the current completion rate plus `acquire` stays within
/// `threshold` per second.
pub fn check_qps(acquire: u32, threshold: f64, stats: &SlidingWindowMetric) -> bool {
    stats.qps(MetricEvent::Complete) + f64::from(acquire) <= threshold
}

/// Admit at most `threshold` requests per second, evenly spaced. Requests
/// are never queued: one arriving before its slot is rejected.
pub fn check_pacing(acquire: u32, threshold: f64, stats: &SlidingWindowMetric) -> bool {
    check_pacing_at(acquire, threshold, stats, current_time_nanos())
}

pub fn check_pacing_at(acquire: u32, threshold: f64, stats: &SlidingWindowMetric, now_ns: u64) -> bool {
    if acquire == 0 {
        return true;
    }
    if threshold <= 0.0 {
        return false;
    }

    let last = stats.last_passed_time_ns();
    let interval = (f64::from(acquire) / threshold * NANOS_PER_SEC).ceil() as u64;

    let previous = last.load(AtomicOrdering::Acquire);
    if previous.saturating_add(interval) > now_ns {
        return false;
    }
    // only one of several concurrent callers claims the slot
    last.compare_exchange(previous, now_ns, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
        .is_ok()
}

// ----------------------------------------------------------------------------
// 19.4 Rules
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct QpsThresholdRule {
    pub threshold: f64,
    pub acquire: u32,
}

impl QpsThresholdRule {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, acquire: 1 }
    }
}

impl Rule for QpsThresholdRule {
    fn decide(&self, entry: &Entry, _ctx: &EntryContext) -> bool {
        check_qps(self.acquire, self.threshold, entry.stats())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PacingRule {
    pub threshold: f64,
    pub acquire: u32,
}

impl PacingRule {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, acquire: 1 }
    }
}

impl Rule for PacingRule {
    fn decide(&self, entry: &Entry, _ctx: &EntryContext) -> bool {
        check_pacing(self.acquire, self.threshold, entry.stats())
    }
}

/// Shifts a percentage of traffic away while the entry's error rate is
/// high and restores it once errors recede. Needs the error-rate metric.
#[derive(Debug)]
pub struct RouteRule {
    ratio: AtomicU32,
    min_ratio: u32,
    step: u32,
    error_threshold: f64,
    recover_threshold: f64,
}

impl RouteRule {
    pub fn new(min_ratio: u32, step: u32, error_threshold: f64, recover_threshold: f64) -> Self {
        Self {
            ratio: AtomicU32::new(100),
            min_ratio: min_ratio.min(100),
            step: step.max(1),
            error_threshold,
            recover_threshold,
        }
    }

    /// Share of traffic admitted, in percent.
    pub fn ratio(&self) -> u32 {
        self.ratio.load(AtomicOrdering::Acquire)
    }

    fn adjust(&self, error_rate: f64) {
        let current = self.ratio();
        let next = if error_rate > self.error_threshold && current > self.min_ratio {
            current.saturating_sub(self.step).max(self.min_ratio)
        } else if error_rate < self.recover_threshold && current < 100 {
            (current + self.step).min(100)
        } else {
            return;
        };
        // a lost race means another request already moved the ratio
        let _ = self.ratio.compare_exchange(
            current,
            next,
            AtomicOrdering::AcqRel,
            AtomicOrdering::Acquire,
        );
    }
}

impl Default for RouteRule {
    fn default() -> Self {
        Self::new(1, 1, 0.01, 0.005)
    }
}

impl Rule for RouteRule {
    fn decide(&self, entry: &Entry, _ctx: &EntryContext) -> bool {
        self.adjust(entry.query(MetricKind::ErrorRate));
        fast_rand_u32n(100) < self.ratio()
    }
}

// ============================================================================
// SECTION 20: BACKGROUND METRIC RECALCULATION
// ============================================================================

/// Copy-on-write list of metrics. Readers take a lock-free snapshot; the
/// writer mutex serializes additions and dedups by identity.
pub struct MetricsContainer {
    metrics: ArcSwap<Vec<Arc<Metric>>>,
    writer: Mutex<HashSet<usize>>,
    next: AtomicUsize,
}

impl MetricsContainer {
    pub fn new() -> Self {
        Self {
            metrics: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(HashSet::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Add metrics not already present; returns how many were added.
    pub fn add_metrics(&self, metrics: &[Arc<Metric>]) -> usize {
        if metrics.is_empty() {
            return 0;
        }

        let mut seen = self.writer.lock();
        let fresh: Vec<Arc<Metric>> = metrics
            .iter()
            .filter(|m| seen.insert(Arc::as_ptr(*m) as usize))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return 0;
        }

        let current = self.metrics.load_full();
        let mut next = Vec::with_capacity(current.len() + fresh.len());
        next.extend(current.iter().cloned());
        next.extend(fresh.iter().cloned());
        self.metrics.store(Arc::new(next));
        fresh.len()
    }

    /// Round-robin over the current snapshot.
    pub fn next_metric(&self) -> Option<Arc<Metric>> {
        let snapshot = self.metrics.load();
        if snapshot.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, AtomicOrdering::Relaxed) % snapshot.len();
        Some(Arc::clone(&snapshot[index]))
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Metric>>> {
        self.metrics.load_full()
    }

    pub fn len(&self) -> usize {
        self.metrics.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MetricsContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MetricsContainer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsContainer")
            .field("len", &self.len())
            .finish()
    }
}

/// Refreshes one registered metric per tick on the executor pool.
#[derive(Debug)]
pub struct CalculateManager {
    pool: Arc<FixedSizeExecutorPool>,
    container: Arc<MetricsContainer>,
    entries: DashMap<String, Arc<Entry>>,
    interval: Duration,
    /// Window of entries built by `create_entry`
    window: (u32, u32),
    driver: OnceCell<PeriodicTask>,
}

impl CalculateManager {
    pub fn new(workers: usize, queue_size: usize) -> ExecutorResult<Self> {
        Self::with_interval(workers, queue_size, DEFAULT_CALCULATE_INTERVAL)
    }

    pub fn with_interval(workers: usize, queue_size: usize, interval: Duration) -> ExecutorResult<Self> {
        Ok(Self {
            pool: Arc::new(FixedSizeExecutorPool::new(workers, queue_size)?),
            container: Arc::new(MetricsContainer::new()),
            entries: DashMap::new(),
            interval,
            window: (DEFAULT_SAMPLE_COUNT, DEFAULT_INTERVAL_MS),
            driver: OnceCell::new(),
        })
    }

    pub fn from_config(config: &PlatoConfig) -> ExecutorResult<Self> {
        let mut manager = Self::with_interval(
            config.executor.workers,
            config.executor.queue_size,
            config.stats.calculate_interval,
        )?;
        manager.window = (config.stats.sample_count, config.stats.interval_ms);
        Ok(manager)
    }

    /// Build an entry over the manager's window and register it.
    pub fn create_entry(&self, name: impl Into<String>, kinds: &[MetricKind]) -> StatResult<Arc<Entry>> {
        let (sample_count, interval_ms) = self.window;
        let entry = Arc::new(Entry::with_window(name, sample_count, interval_ms, kinds)?);
        self.add_entry(&entry);
        Ok(entry)
    }

    pub fn add_metrics(&self, metrics: &[Arc<Metric>]) -> usize {
        self.container.add_metrics(metrics)
    }

    /// Register an entry and schedule its metrics.
    pub fn add_entry(&self, entry: &Arc<Entry>) -> usize {
        self.entries.insert(entry.name().to_string(), Arc::clone(entry));
        let added = self.container.add_metrics(&entry.metric_list());
        debug!(target: "plato::calculate", entry = entry.name(), added, "entry registered");
        added
    }

    pub fn entry(&self, name: &str) -> Option<Arc<Entry>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn container(&self) -> &Arc<MetricsContainer> {
        &self.container
    }

    /// Refresh every registered metric on the calling thread.
    pub fn recalculate_all(&self) {
        for metric in self.container.snapshot().iter() {
            metric.refresh();
        }
    }

    pub fn start(&self) -> PlatoResult<()> {
        self.driver.get_or_try_init(|| {
            let pool = Arc::clone(&self.pool);
            let container = Arc::clone(&self.container);
            PeriodicTask::spawn("plato-calculate", self.interval, move || {
                let Some(metric) = container.next_metric() else {
                    return;
                };
                if let Err(e) = pool.run(move || {
                    metric.refresh();
                    Ok(())
                }) {
                    trace!(target: "plato::calculate", error = %e, "metric refresh skipped");
                }
            })
        })?;
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(driver) = self.driver.get() {
            driver.stop();
        }
        self.pool.close();
    }

    pub fn is_running(&self) -> bool {
        self.driver.get().map_or(false, PeriodicTask::is_running)
    }
}

#[cfg(test)]
mod runtime_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const T0: u64 = 1_700_000_000_000;
    const WAIT: Duration = Duration::from_secs(5);

    /// Occupy the single worker until the returned sender is dropped.
    fn block_worker(pool: &FixedSizeExecutorPool) -> Sender<()> {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        let _ = pool.submit(move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
            Ok(())
        });
        started_rx.recv_timeout(WAIT).unwrap();
        gate_tx
    }

    // ---- Executor ----

    #[test]
    fn test_executor_returns_task_results() {
        let pool = FixedSizeExecutorPool::new(2, 8).unwrap();
        assert_eq!(pool.submit(|| Ok(42)).get(WAIT), Ok(42));
        assert_eq!(
            pool.submit(|| -> ExecutorResult<u32> { Err(ExecutorError::Failed("boom".into())) })
                .get(WAIT),
            Err(ExecutorError::Failed("boom".into()))
        );
    }

    #[test]
    fn test_executor_converts_panics() {
        let pool = FixedSizeExecutorPool::new(1, 8).unwrap();
        let result = pool.submit(|| -> ExecutorResult<u32> { panic!("kaboom") }).get(WAIT);
        assert_eq!(result, Err(ExecutorError::Panicked("kaboom".into())));

        // the worker survives
        assert_eq!(pool.submit(|| Ok("alive")).get(WAIT), Ok("alive"));
    }

    #[test]
    fn test_executor_rejects_when_queue_is_full() {
        let pool = FixedSizeExecutorPool::new(1, 1).unwrap();
        let gate = block_worker(&pool);

        let queued = pool.submit(|| Ok(1));
        assert!(!queued.is_done());

        let rejected = pool.submit(|| Ok(2));
        assert!(rejected.is_done());
        assert_eq!(rejected.get(WAIT), Err(ExecutorError::Rejected));
        assert_eq!(pool.run(|| Ok(())), Err(ExecutorError::Rejected));

        drop(gate);
        assert_eq!(queued.get(WAIT), Ok(1));
    }

    #[test]
    fn test_executor_timeout_skips_unstarted_task() {
        let pool = FixedSizeExecutorPool::new(1, 4).unwrap();
        let gate = block_worker(&pool);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let late = pool.submit(move || {
            flag.store(true, AtomicOrdering::SeqCst);
            Ok(())
        });
        let timeout = Duration::from_millis(20);
        assert_eq!(late.get(timeout), Err(ExecutorError::Timeout(timeout)));

        drop(gate);
        assert_eq!(pool.submit(|| Ok(())).get(WAIT), Ok(()));
        assert!(!ran.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn test_executor_close_is_idempotent() {
        let pool = FixedSizeExecutorPool::new(2, 4).unwrap();
        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.submit(|| Ok(1)).get(WAIT), Err(ExecutorError::Closed));
        assert_eq!(pool.run(|| Ok(())), Err(ExecutorError::Closed));
    }

    #[test]
    fn test_executor_close_resolves_queued_tasks() {
        let pool = Arc::new(FixedSizeExecutorPool::new(1, 8).unwrap());
        let gate = block_worker(&pool);
        let queued: Vec<_> = (0..4).map(|i| pool.submit(move || Ok(i))).collect();

        let closer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.close())
        };
        while !pool.is_closed() {
            thread::yield_now();
        }
        drop(gate);

        let started = Instant::now();
        for future in queued {
            assert_eq!(future.get(WAIT), Err(ExecutorError::Closed));
        }
        assert!(started.elapsed() < WAIT);
        closer.join().unwrap();
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_executor_requires_workers() {
        assert!(matches!(
            FixedSizeExecutorPool::new(0, 4),
            Err(ExecutorError::InvalidArgument(_))
        ));
    }

    // ---- Metrics ----

    #[test]
    fn test_error_rate_counts_blocks_as_finished() {
        let stats = SlidingWindowMetric::default();
        stats.real().add_count_with_time(T0, MetricEvent::Complete, 8);
        stats.real().add_count_with_time(T0, MetricEvent::Block, 2);
        stats.real().add_count_with_time(T0, MetricEvent::Error, 1);

        assert_eq!(error_rate_at(&stats, T0 + 50), 0.1);
        assert_eq!(error_rate_at(&SlidingWindowMetric::default(), T0), 0.0);
    }

    #[test]
    fn test_qps_excludes_bucket_in_progress() {
        let stats = SlidingWindowMetric::default();
        for i in 0..20 {
            stats.real().add_count_with_time(T0 + i * 100, MetricEvent::Complete, 10);
        }
        // buckets T0+800 ..= T0+1800, inclusive of both ends
        assert_eq!(qps_at(&stats, T0 + 1_950), 110.0);
    }

    #[test]
    fn test_avg_response_time() {
        let stats = SlidingWindowMetric::default();
        stats.real().add_count_with_time(T0, MetricEvent::Complete, 4);
        stats.real().add_count_with_time(T0, MetricEvent::Rt, 100);
        assert_eq!(avg_response_time_at(&stats, T0), 25.0);
        assert_eq!(avg_response_time_at(&SlidingWindowMetric::default(), T0), 0.0);
    }

    #[test]
    fn test_p90_uses_floor_index_of_bucket_minimums() {
        let stats = SlidingWindowMetric::default();
        for (i, rt) in [30, 5, 7].iter().enumerate() {
            stats.real().add_count_with_time(T0 + i as u64 * 100, MetricEvent::Rt, *rt);
        }
        assert_eq!(p90_response_time_approx_at(&stats, T0 + 200), 30.0);

        let stats = SlidingWindowMetric::default();
        for i in 1..=10u64 {
            stats.real().add_count_with_time(T0 + i * 100, MetricEvent::Rt, (i * 10) as i64);
        }
        assert_eq!(p90_response_time_approx_at(&stats, T0 + 1_000), 100.0);
        assert_eq!(p90_response_time_approx_at(&SlidingWindowMetric::default(), T0), 0.0);
    }

    // ---- Entry ----

    struct DenyAll;

    impl Rule for DenyAll {
        fn decide(&self, _entry: &Entry, _ctx: &EntryContext) -> bool {
            false
        }
    }

    #[test]
    fn test_entry_run_records_outcomes() {
        let entry = Entry::with_default_metrics("checkout");
        assert_eq!(entry.run(|| Ok::<_, String>(7)).unwrap(), 7);
        let failed = entry.run(|| Err::<(), _>("upstream".to_string()));
        assert!(matches!(failed, Err(RunError::Failed(ref e)) if e == "upstream"));

        let stats = entry.stats();
        assert_eq!(stats.count(MetricEvent::Pass), 2);
        assert_eq!(stats.count(MetricEvent::Complete), 2);
        assert_eq!(stats.count(MetricEvent::Error), 1);

        assert_eq!(entry.query(MetricKind::ErrorRate), 0.0);
        assert_eq!(entry.calculate(MetricKind::ErrorRate), 0.5);
        assert_eq!(entry.query(MetricKind::ErrorRate), 0.5);
    }

    #[test]
    fn test_entry_rule_rejection_counts_block() {
        let entry = Entry::new("search", &[MetricKind::ErrorRate]).with_rule(Arc::new(DenyAll));
        assert!(matches!(entry.enter(), Err(PlatoError::RejectedByRule)));
        assert!(matches!(entry.run(|| Ok::<_, String>(())), Err(RunError::Rejected)));
        assert_eq!(entry.stats().count(MetricEvent::Block), 2);
        assert_eq!(entry.stats().count(MetricEvent::Pass), 0);

        entry.clear_rule();
        let ctx = entry.enter().unwrap();
        entry.exit(&ctx);
        assert_eq!(entry.stats().count(MetricEvent::Complete), 1);
    }

    #[test]
    fn test_entry_untracked_and_custom_metrics() {
        let entry = Entry::new("login", &[MetricKind::Qps])
            .with_custom_metric("passed", |stats, now| stats.sum_with_time(now, MetricEvent::Pass) as f64);
        entry.record_start();
        entry.record_start();

        assert_eq!(entry.query(MetricKind::AvgResponseTime), 0.0);
        assert_eq!(entry.calculate(MetricKind::AvgResponseTime), 0.0);
        assert_eq!(entry.calculate(MetricKind::Custom("passed")), 2.0);
        assert_eq!(entry.metric_list().len(), 2);
        assert_eq!(MetricKind::Custom("passed").to_string(), "passed");
    }

    #[test]
    fn test_entry_window_must_divide_evenly() {
        assert!(Entry::with_window("bad", 7, 2000, &MetricKind::BUILTIN).is_err());
        assert!(Entry::with_window("good", 10, 1000, &MetricKind::BUILTIN).is_ok());
    }

    // ---- Flow checks & rules ----

    #[test]
    fn test_pacing_spaces_requests() {
        let stats = SlidingWindowMetric::default();
        let t = 5_000_000_000;
        assert!(check_pacing_at(1, 10.0, &stats, t));
        assert!(!check_pacing_at(1, 10.0, &stats, t + 50_000_000));
        assert!(check_pacing_at(1, 10.0, &stats, t + 100_000_000));
        assert!(!check_pacing_at(1, 10.0, &stats, t + 100_000_001));

        assert!(check_pacing_at(0, 10.0, &stats, t));
        assert!(!check_pacing_at(1, 0.0, &stats, t + 10_000_000_000));
    }

    #[test]
    fn test_qps_threshold_rule() {
        let strict = Entry::new("strict", &[]).with_rule(Arc::new(QpsThresholdRule::new(0.5)));
        assert!(strict.enter().is_err());

        let relaxed = Entry::new("relaxed", &[]).with_rule(Arc::new(QpsThresholdRule::new(100.0)));
        assert!(relaxed.enter().is_ok());
    }

    #[test]
    fn test_route_rule_backs_off_and_recovers() {
        let noisy = Entry::new("noisy", &[MetricKind::ErrorRate]);
        for _ in 0..4 {
            let ctx = noisy.record_start();
            noisy.record_end(&ctx);
        }
        noisy.report_error();
        noisy.calculate(MetricKind::ErrorRate);

        let rule = RouteRule::new(10, 5, 0.1, 0.05);
        for _ in 0..30 {
            rule.decide(&noisy, &EntryContext::new());
        }
        assert_eq!(rule.ratio(), 10);

        let healthy = Entry::new("healthy", &[MetricKind::ErrorRate]);
        rule.decide(&healthy, &EntryContext::new());
        assert_eq!(rule.ratio(), 15);
        for _ in 0..30 {
            rule.decide(&healthy, &EntryContext::new());
        }
        assert_eq!(rule.ratio(), 100);
    }

    // ---- Background recalculation ----

    fn metric(stats: &Arc<SlidingWindowMetric>) -> Arc<Metric> {
        Arc::new(Metric::new(MetricKind::Qps, Arc::clone(stats), Arc::new(qps_at)))
    }

    #[test]
    fn test_container_dedups_by_identity() {
        let stats = Arc::new(SlidingWindowMetric::default());
        let (a, b) = (metric(&stats), metric(&stats));
        let container = MetricsContainer::new();

        assert_eq!(container.add_metrics(&[Arc::clone(&a), Arc::clone(&b)]), 2);
        assert_eq!(container.add_metrics(&[Arc::clone(&a)]), 0);
        assert_eq!(container.add_metrics(&[]), 0);
        assert_eq!(container.len(), 2);
    }

    #[test]
    fn test_container_round_robin() {
        let stats = Arc::new(SlidingWindowMetric::default());
        let metrics: Vec<Arc<Metric>> = (0..3).map(|_| metric(&stats)).collect();
        let container = MetricsContainer::new();
        assert!(container.next_metric().is_none());
        container.add_metrics(&metrics);

        for round in 0..6 {
            let next = container.next_metric().unwrap();
            assert!(Arc::ptr_eq(&next, &metrics[round % 3]));
        }
    }

    #[test]
    fn test_container_snapshot_is_stable_across_writes() {
        let stats = Arc::new(SlidingWindowMetric::default());
        let container = MetricsContainer::new();
        container.add_metrics(&[metric(&stats)]);
        let before = container.snapshot();
        container.add_metrics(&[metric(&stats)]);
        assert_eq!(before.len(), 1);
        assert_eq!(container.snapshot().len(), 2);
    }

    #[test]
    fn test_calculate_manager_refreshes_in_background() {
        let manager = CalculateManager::with_interval(2, 16, Duration::from_millis(2)).unwrap();
        let entry = Arc::new(Entry::new("orders", &[MetricKind::ErrorRate, MetricKind::AvgResponseTime]));
        assert_eq!(manager.add_entry(&entry), 2);
        assert_eq!(manager.add_entry(&entry), 0);
        assert!(manager.entry("orders").is_some());
        assert!(manager.entry("missing").is_none());

        let _ = entry.run(|| Ok::<_, String>(()));
        let _ = entry.run(|| Err::<(), _>("oops".to_string()));

        manager.start().unwrap();
        manager.start().unwrap();
        thread::sleep(Duration::from_millis(150));
        manager.stop();
        assert!(!manager.is_running());

        assert_eq!(entry.query(MetricKind::ErrorRate), 0.5);
    }

    #[test]
    fn test_entries_follow_stats_window() {
        let stats = StatsConfig {
            sample_count: 4,
            interval_ms: 1_000,
            ..StatsConfig::default()
        };
        let entry = Entry::from_config("search", &stats, &[MetricKind::Qps]).unwrap();
        assert_eq!(entry.stats().real().sample_count(), 4);
        assert_eq!(entry.stats().real().bucket_length_ms(), 250);

        let bad = StatsConfig {
            sample_count: 3,
            ..stats.clone()
        };
        assert!(Entry::from_config("search", &bad, &[]).is_err());

        let mut config = PlatoConfig::default();
        config.stats = stats;
        let manager = CalculateManager::from_config(&config).unwrap();
        let entry = manager.create_entry("orders", &MetricKind::BUILTIN).unwrap();
        assert_eq!(entry.stats().real().interval_ms(), 1_000);
        assert!(manager.entry("orders").is_some());
        assert_eq!(manager.container().len(), MetricKind::BUILTIN.len());

        let default_manager = CalculateManager::new(1, 4).unwrap();
        let entry = default_manager.create_entry("orders", &[]).unwrap();
        assert_eq!(entry.stats().real().sample_count(), DEFAULT_SAMPLE_COUNT);
    }

    // ---- Configuration ----

    #[test]
    fn test_config_defaults_validate() {
        let config = PlatoConfig::default();
        config.validate().unwrap();
        assert_eq!(config.limiter.cpu_threshold, 0.8);
        assert_eq!(config.monitor.alg, MonitorAlg::ZScore);
        assert_eq!(config.sampler.source, LoadSourceKind::Auto);
    }

    #[test]
    fn test_config_from_toml() {
        let config = PlatoConfig::from_str(
            r#"
            [limiter]
            cpu_threshold = 0.7
            kp = 100.0
            sampling_interval = "250ms"

            [monitor]
            alg = "raw"
            dwell = "3s"

            [sampler]
            source = "proc_stat"
            "#,
        )
        .unwrap();

        assert_eq!(config.limiter.cpu_threshold, 0.7);
        assert_eq!(config.limiter.kp, Some(100.0));
        assert_eq!(config.limiter.ki, None);
        assert_eq!(config.limiter.sampling_interval, Duration::from_millis(250));
        assert_eq!(config.monitor.alg, MonitorAlg::Raw);
        assert_eq!(config.monitor.dwell, Duration::from_secs(3));
        assert_eq!(config.sampler.source, LoadSourceKind::ProcStat);
        assert_eq!(config.executor, ExecutorConfig::default());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = PlatoConfig::from_str("[limiter]\ncpu_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "limiter.cpu_threshold"));

        let err = PlatoConfig::from_str("[stats]\nsample_count = 7\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = PlatoConfig::from_str("[monitor]\nupper_threshold = 0.5\nlower_threshold = 0.6\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "monitor.lower_threshold"));

        let config = PlatoConfig::from_str("[monitor]\nupper_threshold = 0.5\n").unwrap();
        assert_eq!(config.monitor.upper_threshold, Some(0.5));
        assert_eq!(config.monitor.lower_threshold, None);

        let err = PlatoConfig::from_str("[limiter\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_config_file_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plato.toml");
        fs::write(&path, "[limiter]\ncpu_threshold = 0.6\n").unwrap();

        let manager = ConfigManager::from_file(&path).unwrap();
        assert_eq!(manager.get().limiter.cpu_threshold, 0.6);

        let seen = Arc::new(AtomicF64::new(0.0));
        let sink = Arc::clone(&seen);
        manager.on_reload(move |config| sink.store(config.limiter.cpu_threshold, AtomicOrdering::SeqCst));

        fs::write(&path, "[limiter]\ncpu_threshold = 0.75\n").unwrap();
        manager.reload().unwrap();
        assert_eq!(manager.get().limiter.cpu_threshold, 0.75);
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 0.75);

        assert!(matches!(
            PlatoConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_generated_config_parses_back() {
        let generated = PlatoConfig::generate_default_config();
        assert_eq!(PlatoConfig::from_str(&generated).unwrap(), PlatoConfig::default());
    }
}

// ============================================================================
// SECTION 21: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 21.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Plato CLI
#[derive(Parser, Debug)]
#[command(
    name = "plato",
    author = "Plato Team",
    version,
    about = "Adaptive CPU admission control",
    long_about = "Plato samples host or cgroup CPU usage, classifies overload with \
                  hysteresis and drives a PID controller that decides what share \
                  of incoming requests to shed."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "plato.toml", env = "PLATO_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PLATO_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the limiter against live CPU load and log its state
    Run {
        /// Override limiter.cpu_threshold
        #[arg(short, long)]
        threshold: Option<f64>,

        /// How often to print the limiter status
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        status_interval: Duration,
    },

    /// Print CPU usage readings from the configured load source
    Sample {
        /// Number of readings
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 21.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Load the file if it exists, defaults otherwise.
pub fn load_config_or_default(path: &Path) -> Result<PlatoConfig, ConfigError> {
    if path.exists() {
        PlatoConfig::load(path)
    } else {
        warn!("Config file not found at {}, using defaults", path.display());
        Ok(PlatoConfig::default())
    }
}

pub fn handle_validate(config_path: &Path, verbose: bool) -> PlatoResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match PlatoConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • CPU threshold: {}", config.limiter.cpu_threshold);
            println!("  • Monitor: {}", config.monitor.alg);
            println!("  • Load source: {:?}", config.sampler.source);
            println!("  • Sampling interval: {:?}", config.limiter.sampling_interval);
            println!(
                "  • Stats window: {} buckets over {}ms",
                config.stats.sample_count, config.stats.interval_ms
            );
            println!("  • Executor: {} workers, queue {}", config.executor.workers, config.executor.queue_size);
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(PlatoError::Config(e))
        }
    }
}

pub fn handle_generate_config(output: Option<&Path>) -> PlatoResult<()> {
    let config_str = PlatoConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

pub fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Lock-light sliding-window statistics");
    println!("  • cgroup v1/v2 and /proc/stat load sources");
    println!("  • Z-score and raw-threshold overload monitors");
    println!("  • Anti-windup PID and relay auto-tuning");
}

#[derive(Debug, Serialize)]
struct SampleLine<'a> {
    seq: usize,
    timestamp_ms: u64,
    source: &'a str,
    usage: Option<f64>,
}

/// Print `count` readings, one sampler interval apart. Blocks the caller.
pub fn handle_sample(config: &PlatoConfig, count: usize, json: bool) -> PlatoResult<()> {
    let source = detect_load_source(config.sampler.source)?;
    let sampler = CpuSampler::from_config(source, &config.sampler);

    // first reading only primes the counters
    sampler.poll();
    for seq in 0..count {
        thread::sleep(sampler.interval());
        let line = SampleLine {
            seq,
            timestamp_ms: current_time_millis(),
            source: sampler.source_name(),
            usage: sampler.poll(),
        };
        if json {
            let encoded = serde_json::to_string(&line).map_err(|e| PlatoError::Internal(e.to_string()))?;
            println!("{}", encoded);
        } else {
            match line.usage {
                Some(usage) => println!("[{:>3}] {:>6.2}% ({})", seq, usage * 100.0, line.source),
                None => println!("[{:>3}]    n/a ({})", seq, line.source),
            }
        }
    }
    Ok(())
}
