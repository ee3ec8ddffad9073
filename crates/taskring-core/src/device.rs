//! Device registry: streams, rings and the selected engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{EngineStrategy, TaskRingConfig};
use crate::control::{ControlChannel, ControlOp};
use crate::driver::{Driver, RingKind, RingRequest};
use crate::engine::{
    DirectEngine, Engine, EngineContext, EngineStats, SubmitRequest, ThreadedEngine,
};
use crate::error::{Result, SyncError, TaskRingError};
use crate::failure::{AbortCause, FailureMode, FailureSnapshot};
use crate::observer::TaskObserver;
use crate::stream::{Stream, StreamOptions, StreamStats};
use crate::task::{CompletionCallback, TaskPayload};
use crate::types::{LogicalTaskId, RingId, StreamId, TaskId};

/// Device-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Live streams.
    pub streams: usize,
    /// Engine counters.
    pub engine: EngineStats,
    /// The transport is gone.
    pub transport_down: bool,
    /// An abort-on-failure stream has failed.
    pub device_aborting: bool,
}

/// One accelerator and its streams.
pub struct Device {
    ctx: Arc<EngineContext>,
    engine: Arc<dyn Engine>,
    control: Arc<ControlChannel>,
    shared_cq: Option<RingId>,
    /// Where the next stream id search starts; held while a stream is created.
    next_stream: Mutex<u16>,
    shut_down: AtomicBool,
}

impl Device {
    /// Open a device over `driver`.
    pub fn new(driver: Arc<dyn Driver>, config: TaskRingConfig) -> Result<Self> {
        config.validate()?;
        let strategy = config.engine.strategy;
        let depth = config.stream.ring_depth;
        let sync_timeout = config.stream.default_sync_timeout();
        let ctx = Arc::new(EngineContext::new(driver, config));

        let (engine, shared_cq) = match strategy {
            EngineStrategy::Threaded => {
                let cq = ctx.driver().allocate_ring(RingRequest {
                    stream_id: StreamId(0),
                    kind: RingKind::Completion,
                    depth,
                    completion_ring: None,
                    priority: 0,
                })?;
                ctx.driver().enable_ring(cq)?;
                let engine: Arc<dyn Engine> = Arc::new(ThreadedEngine::start(ctx.clone(), cq)?);
                (engine, Some(cq))
            }
            EngineStrategy::Direct => {
                let engine: Arc<dyn Engine> = Arc::new(DirectEngine::new(ctx.clone()));
                (engine, None)
            }
        };

        info!(strategy = ?strategy, "device opened");

        Ok(Self {
            control: Arc::new(ControlChannel::new(engine.clone(), sync_timeout)),
            ctx,
            engine,
            shared_cq,
            next_stream: Mutex::new(1),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Engine strategy in use.
    pub fn strategy(&self) -> EngineStrategy {
        self.engine.strategy()
    }

    /// Configuration.
    pub fn config(&self) -> &TaskRingConfig {
        self.ctx.config()
    }

    /// Shared engine state.
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Create a stream with its rings.
    pub fn create_stream(&self, options: StreamOptions) -> Result<StreamHandle> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(crate::error::AdmissionError::EngineStopped.into());
        }
        let config = options.resolve(&self.ctx.config().stream)?;
        let mut next_stream = self.next_stream.lock();
        let id = next_free_stream_id(*next_stream, |id| self.ctx.stream(id).is_some())
            .ok_or(TaskRingError::StreamIdsExhausted)?;
        *next_stream = id.0.wrapping_add(1);
        let driver = self.ctx.driver();

        let cq = match self.shared_cq {
            Some(cq) => cq,
            None => {
                let cq = driver.allocate_ring(RingRequest {
                    stream_id: id,
                    kind: RingKind::Completion,
                    depth: config.ring_depth,
                    completion_ring: None,
                    priority: options.priority,
                })?;
                driver.enable_ring(cq)?;
                cq
            }
        };
        let sq = match driver.allocate_ring(RingRequest {
            stream_id: id,
            kind: RingKind::Submission,
            depth: config.ring_depth,
            completion_ring: Some(cq),
            priority: options.priority,
        }) {
            Ok(sq) => sq,
            Err(e) => {
                self.release_cq(cq);
                return Err(e.into());
            }
        };
        if let Err(e) = driver.enable_ring(sq) {
            let _ = driver.free_ring(sq);
            self.release_cq(cq);
            return Err(e.into());
        }

        let stream = Arc::new(Stream::new(
            id,
            sq,
            cq,
            &config,
            &self.ctx.config().flow,
            &options,
        ));
        self.ctx.insert_stream(stream.clone());
        drop(next_stream);

        info!(
            stream_id = %id,
            sq = %sq,
            cq = %cq,
            depth = config.ring_depth,
            pool = config.arena_capacity(),
            failure_mode = ?options.failure_mode,
            "stream created"
        );

        Ok(self.handle(stream))
    }

    fn release_cq(&self, cq: RingId) {
        if self.shared_cq.is_none() {
            let _ = self.ctx.driver().free_ring(cq);
        }
    }

    fn handle(&self, stream: Arc<Stream>) -> StreamHandle {
        StreamHandle {
            stream,
            engine: self.engine.clone(),
            control: self.control.clone(),
        }
    }

    /// Drain and remove a stream. Work that does not finish within the drain
    /// timeout is retired with an abort error.
    pub fn destroy_stream(&self, id: StreamId) -> Result<()> {
        let stream = self.ctx.stream(id).ok_or(TaskRingError::UnknownStream(id))?;
        let drain = self.ctx.config().stream.destroy_drain_timeout();

        if let Err(e) = self.engine.synchronize(&stream, None, drain) {
            debug!(stream_id = %id, error = %e, "stream not drained before destroy");
        }
        self.ctx.abort_stream(&stream, AbortCause::Destroyed);
        self.ctx.remove_stream(id);
        self.ctx.clear_device_aborting();
        self.release_rings(&stream);

        info!(stream_id = %id, "stream destroyed");
        Ok(())
    }

    fn release_rings(&self, stream: &Stream) {
        let driver = self.ctx.driver();
        let sq = stream.sq();
        if let Err(e) = driver.disable_ring(sq).and_then(|()| driver.free_ring(sq)) {
            warn!(
                stream_id = %stream.id(),
                ring = %sq,
                error = %e,
                "failed to free submission ring"
            );
        }
        if self.shared_cq.is_none() {
            let cq = stream.cq();
            if let Err(e) = driver.disable_ring(cq).and_then(|()| driver.free_ring(cq)) {
                warn!(
                    stream_id = %stream.id(),
                    ring = %cq,
                    error = %e,
                    "failed to free completion ring"
                );
            }
        }
    }

    /// Handle to an existing stream.
    pub fn stream(&self, id: StreamId) -> Option<StreamHandle> {
        self.ctx.stream(id).map(|s| self.handle(s))
    }

    /// Ids of live streams, sorted.
    pub fn list_streams(&self) -> Vec<StreamId> {
        self.ctx.stream_ids()
    }

    /// Receive launch and completion events of every stream.
    pub fn register_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.ctx.observers().register(observer);
    }

    /// Statistics.
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            streams: self.ctx.stream_ids().len(),
            engine: self.engine.stats(),
            transport_down: self.ctx.is_transport_down(),
            device_aborting: self.ctx.is_device_aborting(),
        }
    }

    /// Abort every stream.
    pub fn abort_device(&self) {
        warn!("aborting all streams");
        self.ctx.set_device_aborting();
        for stream in self.ctx.streams() {
            self.ctx.abort_stream(&stream, AbortCause::User);
        }
    }

    /// Stop the engine and release every ring. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.engine.shutdown();
        for id in self.ctx.stream_ids() {
            if let Some(stream) = self.ctx.remove_stream(id) {
                self.ctx.abort_stream(&stream, AbortCause::Destroyed);
                self.release_rings(&stream);
            }
        }
        if let Some(cq) = self.shared_cq {
            let driver = self.ctx.driver();
            if let Err(e) = driver.disable_ring(cq).and_then(|()| driver.free_ring(cq)) {
                warn!(ring = %cq, error = %e, "failed to free completion ring");
            }
        }
        info!("device shut down");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("strategy", &self.engine.strategy())
            .field("streams", &self.ctx.stream_ids())
            .field("shared_cq", &self.shared_cq)
            .finish()
    }
}

// ============================================================================
// Stream handle
// ============================================================================

/// Caller-facing handle to a stream.
#[derive(Clone)]
pub struct StreamHandle {
    stream: Arc<Stream>,
    engine: Arc<dyn Engine>,
    control: Arc<ControlChannel>,
}

impl StreamHandle {
    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.stream.id()
    }

    /// The underlying stream.
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Submit a task.
    pub fn submit(&self, payload: TaskPayload) -> Result<LogicalTaskId> {
        self.engine.submit(&self.stream, SubmitRequest::new(payload))
    }

    /// Submit a task and run `callback` once when it retires.
    pub fn submit_with_callback(
        &self,
        payload: TaskPayload,
        callback: CompletionCallback,
    ) -> Result<LogicalTaskId> {
        self.engine
            .submit(&self.stream, SubmitRequest::new(payload).with_callback(callback))
    }

    /// Wait until everything submitted so far retired. Reports the stream's
    /// recorded failure, if any.
    pub fn synchronize(&self, timeout: Option<Duration>) -> std::result::Result<(), SyncError> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        self.engine
            .synchronize(&self.stream, self.stream.last_task(), timeout)
    }

    /// Wait until one task retired.
    pub fn synchronize_task(
        &self,
        id: LogicalTaskId,
        timeout: Option<Duration>,
    ) -> std::result::Result<(), SyncError> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        self.engine.synchronize(&self.stream, Some(id), timeout)
    }

    fn default_timeout(&self) -> Duration {
        self.engine.context().config().stream.default_sync_timeout()
    }

    /// Abort the stream: outstanding tasks retire with an abort error and
    /// admission fails until the stream is cleared.
    pub fn abort(&self) {
        self.engine
            .context()
            .abort_stream(&self.stream, AbortCause::User);
    }

    /// Change the failure mode through the control channel.
    pub fn set_failure_mode(&self, mode: FailureMode) -> Result<()> {
        self.control.execute(&self.stream, ControlOp::SetFailureMode(mode))
    }

    /// Run a maintenance operation.
    pub fn control(&self, op: ControlOp) -> Result<()> {
        self.control.execute(&self.stream, op)
    }

    /// Failure state.
    pub fn failure(&self) -> FailureSnapshot {
        self.stream.failure().snapshot()
    }

    /// Tasks admitted and not yet retired.
    pub fn query_pending(&self) -> u32 {
        self.stream.query_pending()
    }

    /// Statistics.
    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }

    /// Hardware task id of `id`.
    pub fn hardware_id(&self, id: LogicalTaskId) -> TaskId {
        self.stream.hardware_id(id)
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream", &self.stream)
            .finish()
    }
}

/// First id at or after `start`, wrapping, that is neither 0 nor in use.
fn next_free_stream_id(start: u16, in_use: impl Fn(StreamId) -> bool) -> Option<StreamId> {
    (0..=u16::MAX)
        .map(|offset| StreamId(start.wrapping_add(offset)))
        .find(|&id| id.0 != 0 && !in_use(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_ids_skip_live_ones_across_wrap() {
        let live = [u16::MAX, 1, 2];
        let in_use = |id: StreamId| live.contains(&id.0);
        assert_eq!(next_free_stream_id(u16::MAX - 1, in_use), Some(StreamId(u16::MAX - 1)));
        assert_eq!(next_free_stream_id(u16::MAX, in_use), Some(StreamId(3)));
        assert_eq!(next_free_stream_id(0, in_use), Some(StreamId(3)));
    }

    #[test]
    fn test_stream_ids_exhausted() {
        assert_eq!(next_free_stream_id(7, |_| true), None);
        assert_eq!(next_free_stream_id(7, |id| id.0 != 5), Some(StreamId(5)));
    }
}
