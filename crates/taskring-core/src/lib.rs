//! # TaskRing Core
//!
//! Host-side task admission, dispatch and completion reconciliation for
//! accelerators fed through hardware command rings.
//!
//! Every [`Stream`](stream::Stream) owns a submission ring on the device and
//! a completion ring (private, or shared by the device). Tasks are admitted
//! by the [`FlowController`](flow::FlowController), recorded in a reusable
//! [`TaskArena`](arena::TaskArena), written to the ring by one of two
//! dispatch strategies, and retired by the [`Reconciler`](reconcile::Reconciler)
//! when the hardware reports them.
//!
//! ## Core Abstractions
//!
//! - [`Driver`] - physical ring operations implemented by a backend
//! - [`Device`] - stream registry and engine owner
//! - [`StreamHandle`] - submit, synchronize and abort on one stream
//! - [`Engine`](engine::Engine) - threaded or direct dispatch
//! - [`ControlOp`] - maintenance operations serialized with user work
//!
//! ## Example
//!
//! ```ignore
//! use taskring_core::prelude::*;
//!
//! let device = Device::new(driver, TaskRingConfig::default())?;
//! let stream = device.create_stream(StreamOptions::default())?;
//! stream.submit(TaskPayload::kernel(0x1000, 0))?;
//! stream.synchronize(None)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod command;
pub mod config;
pub mod control;
pub mod device;
pub mod driver;
pub mod engine;
pub mod error;
pub mod failure;
pub mod flip;
pub mod flow;
pub mod observer;
pub mod reconcile;
pub mod ring;
pub mod stream;
pub mod task;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        EngineConfig, EngineStrategy, FlowConfig, ReconcileConfig, StreamConfig, TaskRingConfig,
        TaskRingConfigBuilder,
    };
    pub use crate::control::ControlOp;
    pub use crate::device::{Device, DeviceStats, StreamHandle};
    pub use crate::driver::{error_bits, CompletionRecord, Driver, RingKind, RingRequest};
    pub use crate::engine::{Engine, EngineStats};
    pub use crate::error::*;
    pub use crate::failure::{AbortCause, FailureMode, FailureSnapshot};
    pub use crate::observer::TaskObserver;
    pub use crate::ring::RingPos;
    pub use crate::stream::{StreamOptions, StreamStats};
    pub use crate::task::{CompletionCallback, TaskCompletion, TaskKind, TaskPayload};
    pub use crate::types::*;
}

// Re-exports for convenience
pub use control::ControlOp;
pub use device::{Device, DeviceStats, StreamHandle};
pub use driver::{CompletionRecord, Driver};
pub use error::{Result, TaskRingError};
pub use failure::FailureMode;
pub use stream::StreamOptions;
pub use task::{TaskCompletion, TaskKind, TaskPayload};
pub use types::{LogicalTaskId, RingId, StreamId, TaskId};
