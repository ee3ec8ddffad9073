//! Engine configuration.
//!
//! Every tunable is exposed here rather than hard-coded, since the right
//! thresholds depend on the hardware generation. A configuration can be
//! loaded from TOML:
//!
//! ```
//! use taskring_core::config::{EngineStrategy, TaskRingConfig};
//!
//! let config = TaskRingConfig::from_toml_str(
//!     r#"
//!     [engine]
//!     strategy = "direct"
//!
//!     [stream]
//!     ring_depth = 64
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.engine.strategy, EngineStrategy::Direct);
//! assert_eq!(config.stream.ring_depth, 64);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRingConfig {
    /// Dispatch engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-stream defaults.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Flow control thresholds.
    #[serde(default)]
    pub flow: FlowConfig,

    /// Completion reconciliation settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl TaskRingConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: TaskRingConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    /// Create a builder starting from the defaults.
    #[must_use]
    pub fn builder() -> TaskRingConfigBuilder {
        TaskRingConfigBuilder::default()
    }

    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.stream.validate()?;
        self.flow.validate(self.stream.ring_depth)?;
        Ok(())
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Dispatch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStrategy {
    /// Dedicated sender and receiver threads per device.
    #[default]
    Threaded,
    /// Caller threads submit and reconcile inline.
    Direct,
}

/// Dispatch engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Which dispatch strategy the device runs.
    #[serde(default)]
    pub strategy: EngineStrategy,

    /// Consecutive `RingFull` results before the sender parks.
    #[serde(default = "default_sender_backoff_threshold")]
    pub sender_backoff_threshold: u32,

    /// How long a parked sender waits for a reclaim signal before retrying.
    #[serde(default = "default_sender_wait_slice_ms")]
    pub sender_wait_slice_ms: u64,

    /// Completion poll timeout.
    #[serde(default = "default_completion_poll_interval_ms")]
    pub completion_poll_interval_ms: u64,
}

fn default_sender_backoff_threshold() -> u32 {
    10
}

fn default_sender_wait_slice_ms() -> u64 {
    50
}

fn default_completion_poll_interval_ms() -> u64 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: EngineStrategy::default(),
            sender_backoff_threshold: default_sender_backoff_threshold(),
            sender_wait_slice_ms: default_sender_wait_slice_ms(),
            completion_poll_interval_ms: default_completion_poll_interval_ms(),
        }
    }
}

impl EngineConfig {
    /// Sender wait slice as a duration.
    pub fn sender_wait_slice(&self) -> Duration {
        Duration::from_millis(self.sender_wait_slice_ms)
    }

    /// Completion poll interval as a duration.
    pub fn completion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.completion_poll_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sender_backoff_threshold == 0 {
            return Err(invalid(
                "engine.sender_backoff_threshold",
                "must be at least 1",
            ));
        }
        if self.completion_poll_interval_ms == 0 {
            return Err(invalid(
                "engine.completion_poll_interval_ms",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Stream
// ============================================================================

/// Smallest supported hardware task id width.
pub const MIN_TASK_ID_BITS: u8 = 4;

/// Largest supported hardware task id width.
pub const MAX_TASK_ID_BITS: u8 = 16;

/// Per-stream defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Submission ring depth in command entries.
    #[serde(default = "default_ring_depth")]
    pub ring_depth: u32,

    /// Task arena size. Defaults to `ring_depth + 1` rounded up to a power of two.
    #[serde(default)]
    pub pool_size: Option<u32>,

    /// Width of the hardware task id.
    #[serde(default = "default_task_id_bits")]
    pub task_id_bits: u8,

    /// Request a completion report for every task instead of only for
    /// synchronization points.
    #[serde(default = "default_eager_completion")]
    pub eager_completion: bool,

    /// Timeout used by `synchronize` when the caller passes none.
    #[serde(default = "default_sync_timeout_ms")]
    pub default_sync_timeout_ms: u64,

    /// How long a direct-engine submit may wait for ring space.
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,

    /// How long stream destruction waits for outstanding work.
    #[serde(default = "default_destroy_drain_timeout_ms")]
    pub destroy_drain_timeout_ms: u64,
}

fn default_ring_depth() -> u32 {
    1024
}

fn default_task_id_bits() -> u8 {
    MAX_TASK_ID_BITS
}

fn default_eager_completion() -> bool {
    true
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_admission_timeout_ms() -> u64 {
    5_000
}

fn default_destroy_drain_timeout_ms() -> u64 {
    1_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ring_depth: default_ring_depth(),
            pool_size: None,
            task_id_bits: default_task_id_bits(),
            eager_completion: default_eager_completion(),
            default_sync_timeout_ms: default_sync_timeout_ms(),
            admission_timeout_ms: default_admission_timeout_ms(),
            destroy_drain_timeout_ms: default_destroy_drain_timeout_ms(),
        }
    }
}

impl StreamConfig {
    /// Size of the hardware task id space.
    pub fn task_id_space(&self) -> u32 {
        1u32 << self.task_id_bits
    }

    /// Arena slot count (a power of two, never larger than the id space).
    pub fn arena_capacity(&self) -> u32 {
        let wanted = self
            .pool_size
            .unwrap_or_else(|| self.ring_depth.saturating_add(1));
        wanted
            .max(2)
            .checked_next_power_of_two()
            .unwrap_or(u32::MAX)
            .min(self.task_id_space())
    }

    /// Default synchronization timeout.
    pub fn default_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.default_sync_timeout_ms)
    }

    /// Admission timeout.
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    /// Destroy drain timeout.
    pub fn destroy_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_drain_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_TASK_ID_BITS..=MAX_TASK_ID_BITS).contains(&self.task_id_bits) {
            return Err(invalid(
                "stream.task_id_bits",
                format!(
                    "{} is outside {}..={}",
                    self.task_id_bits, MIN_TASK_ID_BITS, MAX_TASK_ID_BITS
                ),
            ));
        }
        if self.ring_depth < 2 {
            return Err(invalid("stream.ring_depth", "must be at least 2"));
        }
        if let Some(pool) = self.pool_size {
            if pool < 2 {
                return Err(invalid("stream.pool_size", "must be at least 2"));
            }
            if pool > self.task_id_space() {
                return Err(invalid(
                    "stream.pool_size",
                    format!(
                        "{pool} exceeds the {}-entry task id space",
                        self.task_id_space()
                    ),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Flow control
// ============================================================================

/// Flow control thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Fraction of ring depth at which a stream becomes limited.
    #[serde(default = "default_high_water_fraction")]
    pub high_water_fraction: f64,

    /// Issued-but-unconsumed entries that mark a stream limited.
    /// Defaults to `ring_depth - 1`.
    #[serde(default)]
    pub wait_exec_threshold: Option<u32>,

    /// Slots kept free on abort-on-failure streams before admission drains.
    #[serde(default = "default_abort_drain_margin")]
    pub abort_drain_margin: u32,
}

fn default_high_water_fraction() -> f64 {
    0.75
}

fn default_abort_drain_margin() -> u32 {
    2
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            high_water_fraction: default_high_water_fraction(),
            wait_exec_threshold: None,
            abort_drain_margin: default_abort_drain_margin(),
        }
    }
}

impl FlowConfig {
    /// Pending-task count at which a stream of `depth` becomes limited.
    pub fn high_water_mark(&self, depth: u32) -> u32 {
        ((depth as f64 * self.high_water_fraction) as u32).max(1)
    }

    /// Wait-execution threshold for a stream of `depth`.
    pub fn wait_exec_threshold(&self, depth: u32) -> u32 {
        self.wait_exec_threshold
            .unwrap_or_else(|| depth.saturating_sub(1))
            .max(1)
    }

    fn validate(&self, depth: u32) -> Result<(), ConfigError> {
        if !(self.high_water_fraction > 0.0 && self.high_water_fraction <= 1.0) {
            return Err(invalid(
                "flow.high_water_fraction",
                format!("{} is outside (0, 1]", self.high_water_fraction),
            ));
        }
        if let Some(threshold) = self.wait_exec_threshold {
            if threshold == 0 || threshold > depth {
                return Err(invalid(
                    "flow.wait_exec_threshold",
                    format!("{threshold} is outside 1..={depth}"),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Completion reconciliation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Re-issues allowed for a retryable device fault.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u8,
}

fn default_retry_limit() -> u8 {
    1
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`TaskRingConfig`].
#[derive(Debug, Default)]
pub struct TaskRingConfigBuilder {
    config: TaskRingConfig,
}

impl TaskRingConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dispatch strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: EngineStrategy) -> Self {
        self.config.engine.strategy = strategy;
        self
    }

    /// Sets the ring depth.
    #[must_use]
    pub fn with_ring_depth(mut self, depth: u32) -> Self {
        self.config.stream.ring_depth = depth;
        self
    }

    /// Sets the arena size.
    #[must_use]
    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.config.stream.pool_size = Some(size);
        self
    }

    /// Sets the hardware task id width.
    #[must_use]
    pub fn with_task_id_bits(mut self, bits: u8) -> Self {
        self.config.stream.task_id_bits = bits;
        self
    }

    /// Enables or disables a completion report for every task.
    #[must_use]
    pub fn with_eager_completion(mut self, eager: bool) -> Self {
        self.config.stream.eager_completion = eager;
        self
    }

    /// Sets the default synchronization timeout.
    #[must_use]
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream.default_sync_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the direct-engine admission timeout.
    #[must_use]
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream.admission_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the high-water fraction.
    #[must_use]
    pub fn with_high_water_fraction(mut self, fraction: f64) -> Self {
        self.config.flow.high_water_fraction = fraction;
        self
    }

    /// Sets the wait-execution threshold.
    #[must_use]
    pub fn with_wait_exec_threshold(mut self, threshold: u32) -> Self {
        self.config.flow.wait_exec_threshold = Some(threshold);
        self
    }

    /// Sets the sender backoff threshold.
    #[must_use]
    pub fn with_sender_backoff_threshold(mut self, failures: u32) -> Self {
        self.config.engine.sender_backoff_threshold = failures;
        self
    }

    /// Sets the sender wait slice.
    #[must_use]
    pub fn with_sender_wait_slice(mut self, slice: Duration) -> Self {
        self.config.engine.sender_wait_slice_ms = slice.as_millis() as u64;
        self
    }

    /// Sets the completion poll interval.
    #[must_use]
    pub fn with_completion_poll_interval(mut self, interval: Duration) -> Self {
        self.config.engine.completion_poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    /// Sets the retry limit for retryable faults.
    #[must_use]
    pub fn with_retry_limit(mut self, limit: u8) -> Self {
        self.config.reconcile.retry_limit = limit;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<TaskRingConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TaskRingConfig::default();
        assert_eq!(config.engine.sender_backoff_threshold, 10);
        assert_eq!(config.stream.arena_capacity(), 2048);
        assert_eq!(config.flow.high_water_mark(1024), 768);
        assert_eq!(config.flow.wait_exec_threshold(1024), 1023);
        assert_eq!(config.reconcile.retry_limit, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_arena_capped_by_id_space() {
        let config = TaskRingConfig::builder()
            .with_ring_depth(64)
            .with_task_id_bits(4)
            .build()
            .unwrap();
        assert_eq!(config.stream.arena_capacity(), 16);
    }

    #[test]
    fn test_parse_partial_document() {
        let config = TaskRingConfig::from_toml_str(
            r#"
            [stream]
            ring_depth = 4
            eager_completion = false

            [flow]
            high_water_fraction = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.stream.ring_depth, 4);
        assert!(!config.stream.eager_completion);
        assert_eq!(config.flow.high_water_mark(4), 2);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_rejects_out_of_range() {
        let err = TaskRingConfig::from_toml_str("[stream]\ntask_id_bits = 20\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "stream.task_id_bits",
                ..
            }
        ));

        let err = TaskRingConfig::builder()
            .with_high_water_fraction(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_parse_error_surfaces() {
        let err = TaskRingConfig::from_toml_str("[engine]\nstrategy = \"fast\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskring.toml");
        std::fs::write(&path, "[engine]\nstrategy = \"direct\"\n").unwrap();
        let config = TaskRingConfig::load(&path).unwrap();
        assert_eq!(config.engine.strategy, EngineStrategy::Direct);
    }
}
