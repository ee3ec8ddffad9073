//! # TaskRing
//!
//! Host-side task dispatch for accelerators fed through hardware command
//! rings: admission with backpressure, threaded or direct dispatch, and
//! exactly-once retirement of every task from hardware completion reports.
//!
//! ## Quick Start
//!
//! ```ignore
//! use taskring::prelude::*;
//!
//! let ring = TaskRing::builder()
//!     .strategy(EngineStrategy::Threaded)
//!     .build()?;
//!
//! let stream = ring.create_stream(StreamOptions::default())?;
//! let id = stream.submit(TaskPayload::kernel(0x1000, 0))?;
//! stream.synchronize_task(id, None)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Host                                │
//! │  submit ─► FlowController ─► TaskArena ─► Engine ──┐     │
//! │  synchronize ◄─ Reconciler ◄─ completion records ◄─┼──┐  │
//! └────────────────────────────────────────────────────┼──┼──┘
//!                                                      │  │
//! ┌────────────────────────────────────────────────────┼──┼──┐
//! │                     Device                         ▼  │  │
//! │   submission ring (per stream)  ──►  completion ring ─┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The `sim` feature (on by default) provides an in-memory device used when
//! no driver is supplied.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

// Re-export core types
pub use taskring_core::*;

#[cfg(feature = "sim")]
pub use taskring_sim::{CompletionMode, Fault, SimDriver};

use std::sync::Arc;
use std::time::Duration;

use taskring_core::config::{EngineStrategy, TaskRingConfig};
use taskring_core::device::DeviceStats;
use taskring_core::error::SyncError;
use taskring_core::observer::TaskObserver;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::TaskRing;
    #[cfg(feature = "sim")]
    pub use crate::{CompletionMode, Fault, SimDriver};
    pub use taskring_core::prelude::*;
}

/// Main facade: one device and its streams.
pub struct TaskRing {
    device: Device,
}

impl TaskRing {
    /// Create a builder.
    pub fn builder() -> TaskRingBuilder {
        TaskRingBuilder::new()
    }

    /// Device with default settings over the simulated driver.
    #[cfg(feature = "sim")]
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// The device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Create a stream.
    pub fn create_stream(&self, options: StreamOptions) -> Result<StreamHandle> {
        self.device.create_stream(options)
    }

    /// Drain and remove a stream.
    pub fn destroy_stream(&self, id: StreamId) -> Result<()> {
        self.device.destroy_stream(id)
    }

    /// Handle to an existing stream.
    pub fn stream(&self, id: StreamId) -> Option<StreamHandle> {
        self.device.stream(id)
    }

    /// Live stream ids.
    pub fn list_streams(&self) -> Vec<StreamId> {
        self.device.list_streams()
    }

    /// Register a lifecycle observer.
    pub fn register_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.device.register_observer(observer);
    }

    /// Statistics.
    pub fn stats(&self) -> DeviceStats {
        self.device.stats()
    }

    /// Stop the engine and release every ring.
    pub fn shutdown(self) {
        self.device.shutdown();
    }

    /// Wait for everything submitted to `stream` so far without blocking the
    /// async runtime.
    pub async fn synchronize_async(
        stream: &StreamHandle,
        timeout: Option<Duration>,
    ) -> std::result::Result<(), SyncError> {
        let handle = stream.clone();
        Self::blocking(stream.id(), move || handle.synchronize(timeout)).await
    }

    /// Wait for one task without blocking the async runtime.
    pub async fn synchronize_task_async(
        stream: &StreamHandle,
        id: LogicalTaskId,
        timeout: Option<Duration>,
    ) -> std::result::Result<(), SyncError> {
        let handle = stream.clone();
        Self::blocking(stream.id(), move || handle.synchronize_task(id, timeout)).await
    }

    async fn blocking<F>(stream_id: StreamId, wait: F) -> std::result::Result<(), SyncError>
    where
        F: FnOnce() -> std::result::Result<(), SyncError> + Send + 'static,
    {
        match tokio::task::spawn_blocking(wait).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(SyncError::Aborted(stream_id)),
        }
    }
}

impl std::fmt::Debug for TaskRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRing").field("device", &self.device).finish()
    }
}

/// Builder for [`TaskRing`].
pub struct TaskRingBuilder {
    config: TaskRingConfig,
    strategy: Option<EngineStrategy>,
    driver: Option<Arc<dyn Driver>>,
}

impl TaskRingBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: TaskRingConfig::default(),
            strategy: None,
            driver: None,
        }
    }

    /// Use `config`.
    pub fn config(mut self, config: TaskRingConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the dispatch strategy of the configuration.
    pub fn strategy(mut self, strategy: EngineStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Drive `driver` instead of the simulated device.
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Open the device.
    pub fn build(self) -> Result<TaskRing> {
        let mut config = self.config;
        if let Some(strategy) = self.strategy {
            config.engine.strategy = strategy;
        }

        let driver = match self.driver {
            Some(driver) => driver,
            None => Self::default_driver()?,
        };

        tracing::info!(strategy = ?config.engine.strategy, "opening task ring");
        Ok(TaskRing {
            device: Device::new(driver, config)?,
        })
    }

    #[cfg(feature = "sim")]
    fn default_driver() -> Result<Arc<dyn Driver>> {
        tracing::info!("no driver supplied, using simulated device");
        Ok(Arc::new(SimDriver::with_mode(CompletionMode::Immediate)))
    }

    #[cfg(not(feature = "sim"))]
    fn default_driver() -> Result<Arc<dyn Driver>> {
        Err(taskring_core::error::ConfigError::Invalid {
            field: "driver",
            reason: "no driver supplied and the `sim` feature is disabled".to_string(),
        }
        .into())
    }
}

impl Default for TaskRingBuilder {
    fn default() -> Self {
        Self::new()
    }
}
