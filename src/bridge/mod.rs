//! Composed duplex
//!
//! [`ComposedDuplex`] is the unit `compose` hands back: writes go to the head
//! stage, reads come from the tail stage, and the whole chain shares one
//! lifecycle. Handles are cheap to clone; dropping the last one tears an
//! unfinished composition down.

pub mod state;

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::Instrument;
use uuid::Uuid;

use crate::adapter::StageSource;
use crate::capability::{
    ChunkMode, StageEvent, StageSides, StageSignals, StageStatus, StreamCapability,
};
use crate::config::ComposeOptions;
use crate::error::{ComposeError, ErrorCategory, Result};
use crate::pipeline::LinkedPipeline;
use crate::teardown::TeardownCoordinator;
use crate::utils::lock;
use state::CompositionState;

/// Lifecycle of the composed unit itself, as seen by its observers.
struct Outcome {
    signals: StageSignals,
    closed: watch::Sender<Option<Option<ComposeError>>>,
}

struct BridgeInner<T> {
    id: Uuid,
    label: Option<String>,
    span: tracing::Span,
    pipeline: LinkedPipeline<T>,
    state: Arc<Mutex<CompositionState>>,
    coordinator: TeardownCoordinator<T>,
    outcome: Arc<Outcome>,
    write_serial: tokio::sync::Mutex<()>,
    read_serial: tokio::sync::Mutex<()>,
}

impl<T: Send + 'static> BridgeInner<T> {
    fn sides(&self) -> StageSides {
        StageSides {
            readable: self.pipeline.tail.readable_side,
            writable: self.pipeline.head.writable_side,
        }
    }

    /// A unit is done once its pipeline settled or every exposed side
    /// completed.
    fn is_done(&self) -> bool {
        self.pipeline.is_settled() || self.outcome.signals.snapshot().is_complete(self.sides())
    }

    fn destroy(&self, reason: Option<ComposeError>) {
        let reason = reason.or_else(|| (!self.is_done()).then(ComposeError::abort));
        self.coordinator.finalize(reason);
    }

    /// Prefer the pipeline's terminal error over the stage-local view of it.
    fn surface(&self, error: ComposeError) -> ComposeError {
        if error.category() == ErrorCategory::Misuse {
            return error;
        }
        self.pipeline.first_error().unwrap_or(error)
    }
}

/// The single duplex a chain of stages is composed into.
pub struct ComposedDuplex<T> {
    inner: Arc<BridgeInner<T>>,
    _guard: Arc<DropGuard>,
}

/// Destroys the composition when the last user handle goes away.
struct DropGuard {
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl<T> Clone for ComposedDuplex<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _guard: self._guard.clone(),
        }
    }
}

impl<T> fmt::Debug for ComposedDuplex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedDuplex")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ComposedDuplex<T> {
    pub(crate) fn new(
        id: Uuid,
        pipeline: LinkedPipeline<T>,
        options: &ComposeOptions,
        runtime: Handle,
        span: tracing::Span,
    ) -> Self {
        let (closed, _) = watch::channel(None);
        let outcome = Arc::new(Outcome {
            signals: StageSignals::new(),
            closed,
        });

        let on_finalize = {
            let outcome = outcome.clone();
            Box::new(move |error: Option<ComposeError>| {
                match &error {
                    Some(error) => {
                        tracing::debug!(error = %error, "composition closed with error");
                        outcome.signals.fail(error.clone());
                    }
                    None => tracing::debug!("composition closed"),
                }
                outcome.signals.close();
                outcome.closed.send_replace(Some(error));
            })
        };
        let state = Arc::new(Mutex::new(CompositionState::new(
            pipeline.head.writable_side,
            pipeline.tail.readable_side,
            on_finalize,
        )));
        let coordinator = TeardownCoordinator::new(
            pipeline.clone(),
            state.clone(),
            runtime.clone(),
            options.teardown_timeout(),
        );
        let inner = Arc::new(BridgeInner {
            id,
            label: options.label.clone(),
            span: span.clone(),
            pipeline,
            state,
            coordinator,
            outcome,
            write_serial: tokio::sync::Mutex::new(()),
            read_serial: tokio::sync::Mutex::new(()),
        });

        let settlement = inner.clone();
        runtime.spawn(
            async move {
                let error = settlement.pipeline.wait_settled().await;
                settlement.coordinator.finalize(error);
            }
            .instrument(span.clone()),
        );

        if let Some(signal) = options.signal.clone() {
            let aborted = inner.clone();
            runtime.spawn(
                async move {
                    let mut closed = aborted.outcome.closed.subscribe();
                    tokio::select! {
                        _ = signal.cancelled() => {
                            tracing::debug!("abort signal received");
                            aborted.destroy(Some(ComposeError::Aborted(
                                "abort signal received".to_string(),
                            )));
                        }
                        _ = closed.wait_for(Option::is_some) => {}
                    }
                }
                .instrument(span),
            );
        }

        let dropped = inner.clone();
        let guard = DropGuard {
            on_drop: Some(Box::new(move || {
                if !lock(&dropped.state).is_finalizing {
                    let _entered = dropped.span.enter();
                    tracing::debug!("last handle dropped, tearing down");
                    dropped.destroy(None);
                }
            })),
        };

        Self {
            inner,
            _guard: Arc::new(guard),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// Framing of the writable side; the head stage's.
    pub fn writable_mode(&self) -> ChunkMode {
        self.inner.pipeline.head.capability.writable_mode()
    }

    /// Framing of the readable side; the tail stage's.
    pub fn readable_mode(&self) -> ChunkMode {
        self.inner.pipeline.tail.capability.readable_mode()
    }

    /// Write a chunk into the head stage.
    ///
    /// Resolves once the head accepted it. Writes are serialized, so their
    /// acknowledgements resolve in call order.
    pub async fn write(&self, chunk: T) -> Result<()> {
        let inner = &self.inner;
        let _serial = inner.write_serial.lock().await;
        let (accept, released) = oneshot::channel();
        {
            let mut state = lock(&inner.state);
            if !state.head_writable {
                return Err(ComposeError::NotWritable);
            }
            if state.is_finalizing {
                return Err(state.teardown_error());
            }
            if state.write_ended {
                return Err(ComposeError::WriteAfterEnd);
            }
            state.pending_accept = Some(accept);
        }

        let head = inner.pipeline.head.capability.clone();
        let result = tokio::select! {
            biased;
            reason = released => Err(reason.ok().flatten().unwrap_or(ComposeError::Destroyed)),
            accepted = head.submit_write(chunk) => accepted.map_err(|error| inner.surface(error)),
        };
        lock(&inner.state).pending_accept.take();
        result
    }

    /// Close the writable side and wait until the whole chain consumed the
    /// input. Calling it again only waits.
    ///
    /// Writes issued while `end` waits fail with
    /// [`ComposeError::WriteAfterEnd`].
    pub async fn end(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let _serial = inner.write_serial.lock().await;
            let first = {
                let mut state = lock(&inner.state);
                if !state.head_writable {
                    return Err(ComposeError::NotWritable);
                }
                if state.write_ended {
                    false
                } else if state.is_finalizing {
                    return Err(state.teardown_error());
                } else {
                    state.write_ended = true;
                    true
                }
            };

            if first {
                tracing::trace!(composition = %inner.id, "ending writable side");
                let head = inner.pipeline.head.capability.clone();
                head.request_finalize()
                    .await
                    .map_err(|error| inner.surface(error))?;
            }
        }

        let mut status = inner.pipeline.tail.capability.status();
        let tail = match status.wait_for(|status| status.finished || status.closed).await {
            Ok(tail) => (*tail).clone(),
            Err(_) => StageStatus {
                closed: true,
                ..StageStatus::default()
            },
        };
        if tail.finished && tail.error.is_none() {
            inner.outcome.signals.mark_finished();
            Ok(())
        } else {
            Err(inner
                .pipeline
                .first_error()
                .unwrap_or(ComposeError::PrematureClose))
        }
    }

    /// Read the next chunk from the tail stage. `None` is the end marker.
    pub async fn read(&self) -> Result<Option<T>> {
        let inner = &self.inner;
        let _serial = inner.read_serial.lock().await;
        let (data, released) = oneshot::channel();
        {
            let mut state = lock(&inner.state);
            if !state.tail_readable {
                return Err(ComposeError::NotReadable);
            }
            if state.read_ended {
                return Ok(None);
            }
            if state.is_finalizing {
                return Err(state.teardown_error());
            }
            state.pending_read = Some(data);
        }

        let tail = inner.pipeline.tail.capability.clone();
        let result = tokio::select! {
            biased;
            reason = released => Err(reason.ok().flatten().unwrap_or(ComposeError::Destroyed)),
            pulled = tail.pull_read() => pulled.map_err(|error| inner.surface(error)),
        };
        {
            let mut state = lock(&inner.state);
            state.pending_read.take();
            if matches!(result, Ok(None)) {
                state.read_ended = true;
            }
        }
        if matches!(result, Ok(None)) {
            inner.outcome.signals.mark_ended();
        }
        result
    }

    /// Tear the composition down.
    ///
    /// Without a reason, an unfinished composition is destroyed with
    /// [`ComposeError::Aborted`]; a finished one closes cleanly.
    pub fn destroy(&self, reason: Option<ComposeError>) {
        self.inner.destroy(reason);
    }

    /// Wait for the final outcome: `None` on clean completion.
    pub async fn closed(&self) -> Option<ComposeError> {
        let mut closed = self.inner.outcome.closed.subscribe();
        match closed.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().flatten(),
            Err(_) => Some(ComposeError::Destroyed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.outcome.closed.borrow().is_some()
    }

    /// Errors raised after the terminal error and dropped in its favour.
    pub fn discarded_errors(&self) -> Vec<ComposeError> {
        self.inner.pipeline.discarded_errors()
    }

    /// Read the composition as a stream of chunks.
    pub fn into_stream(self) -> BoxStream<'static, Result<T>> {
        async_stream::stream! {
            loop {
                match self.read().await {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => break,
                    Err(error) => {
                        yield Err(error);
                        break;
                    }
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl<T: Send + 'static> StreamCapability<T> for ComposedDuplex<T> {
    fn sides(&self) -> StageSides {
        self.inner.sides()
    }

    fn readable_mode(&self) -> ChunkMode {
        ComposedDuplex::readable_mode(self)
    }

    fn writable_mode(&self) -> ChunkMode {
        ComposedDuplex::writable_mode(self)
    }

    fn is_readable_active(&self) -> bool {
        let state = lock(&self.inner.state);
        state.tail_readable && !state.read_ended && !state.is_finalizing
    }

    fn is_writable_active(&self) -> bool {
        let state = lock(&self.inner.state);
        state.head_writable && !state.write_ended && !state.is_finalizing
    }

    async fn submit_write(&self, chunk: T) -> Result<()> {
        self.write(chunk).await
    }

    async fn request_finalize(&self) -> Result<()> {
        self.end().await
    }

    async fn pull_read(&self) -> Result<Option<T>> {
        self.read().await
    }

    fn destroy(&self, reason: Option<ComposeError>) -> Result<()> {
        self.inner.destroy(reason);
        Ok(())
    }

    fn status(&self) -> watch::Receiver<StageStatus> {
        self.inner.outcome.signals.status()
    }

    fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.inner.outcome.signals.subscribe()
    }
}

impl<T: Send + 'static> From<ComposedDuplex<T>> for StageSource<T> {
    fn from(duplex: ComposedDuplex<T>) -> Self {
        Self::Capability(Arc::new(duplex))
    }
}
