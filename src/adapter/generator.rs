//! Generator-backed duplex stage
//!
//! Wraps a function that turns an input chunk stream into an output stream.
//! Input and output each go through a single-slot [`Handshake`], so the stage
//! holds at most one chunk in each direction.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::handshake::{Delivery, Handshake};
use crate::capability::{StageEvent, StageSides, StageSignals, StageStatus, StreamCapability};
use crate::error::{ComposeError, Result};
use crate::utils::lock;

/// Inbound chunks as seen by a generator or async function body.
pub type ChunkSource<T> = BoxStream<'static, T>;

/// Transform body: consumes the inbound chunks, yields outbound chunks.
pub type GeneratorFn<T> =
    Box<dyn FnOnce(ChunkSource<T>) -> BoxStream<'static, Result<T>> + Send>;

/// Build the inbound stream a body pulls from.
pub(crate) fn chunk_source<T: Send + 'static>(input: Arc<Handshake<T>>) -> ChunkSource<T> {
    futures::stream::unfold(input, |input| async move {
        match input.take().await {
            Some(Delivery::Chunk(chunk)) => Some((chunk, input)),
            Some(Delivery::End) | None => None,
        }
    })
    .boxed()
}

struct GeneratorShared<T> {
    input: Arc<Handshake<T>>,
    output: Handshake<T>,
    signals: StageSignals,
    /// The body returned; remaining input is discarded.
    exhausted: std::sync::atomic::AtomicBool,
}

impl<T: Send + 'static> GeneratorShared<T> {
    fn shutdown(&self, reason: Option<ComposeError>) {
        self.input.close();
        self.output.close();
        if let Some(err) = reason {
            self.signals.fail(err);
        }
        self.signals.close();
    }

    fn close_if_complete(&self) {
        if self.signals.snapshot().is_complete(StageSides::DUPLEX) {
            self.input.close();
            self.output.close();
            self.signals.close();
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Duplex stage driven by a [`GeneratorFn`].
///
/// The body runs on a spawned task started by the first read or write.
pub struct GeneratorStage<T> {
    shared: Arc<GeneratorShared<T>>,
    body: Mutex<Option<GeneratorFn<T>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    finalized: std::sync::atomic::AtomicBool,
}

impl<T: Send + 'static> GeneratorStage<T> {
    pub fn new(body: GeneratorFn<T>) -> Self {
        Self {
            shared: Arc::new(GeneratorShared {
                input: Arc::new(Handshake::new()),
                output: Handshake::new(),
                signals: StageSignals::new(),
                exhausted: std::sync::atomic::AtomicBool::new(false),
            }),
            body: Mutex::new(Some(body)),
            driver: Mutex::new(None),
            finalized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn ensure_started(&self) {
        let Some(body) = lock(&self.body).take() else {
            return;
        };
        let shared = self.shared.clone();
        let source = chunk_source(shared.input.clone());
        let span = tracing::debug_span!("generator_stage");
        let handle = tokio::spawn(
            async move {
                let mut produced = body(source);
                while let Some(item) = produced.next().await {
                    match item {
                        Ok(chunk) => {
                            if shared.output.put(Delivery::Chunk(chunk)).await.is_err() {
                                return;
                            }
                            shared.signals.emit(StageEvent::ReadableAvailable);
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "generator body failed");
                            shared.shutdown(Some(err));
                            return;
                        }
                    }
                }
                shared
                    .exhausted
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                // Unread input can no longer be consumed.
                shared.input.close();
                let _ = shared.output.put(Delivery::End).await;
            }
            .instrument(span),
        );
        *lock(&self.driver) = Some(handle);
    }

    fn destroyed_error(&self) -> ComposeError {
        self.shared.signals.error().unwrap_or(ComposeError::Destroyed)
    }

    /// A failed input hand-off after the body returned is not an error: the
    /// body simply stopped consuming.
    fn input_outcome(&self, handed_off: Result<()>) -> Result<()> {
        match handed_off {
            Ok(()) => Ok(()),
            Err(_) if self.shared.is_exhausted() && self.shared.signals.error().is_none() => {
                Ok(())
            }
            Err(_) => Err(self.destroyed_error()),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> StreamCapability<T> for GeneratorStage<T> {
    fn sides(&self) -> StageSides {
        StageSides::DUPLEX
    }

    fn is_readable_active(&self) -> bool {
        let status = self.shared.signals.snapshot();
        !status.ended && !status.closed
    }

    fn is_writable_active(&self) -> bool {
        !self.finalized.load(std::sync::atomic::Ordering::SeqCst)
            && !self.shared.signals.is_closed()
    }

    async fn submit_write(&self, chunk: T) -> Result<()> {
        if self.finalized.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ComposeError::WriteAfterEnd);
        }
        if self.shared.signals.is_closed() {
            return Err(self.destroyed_error());
        }
        self.ensure_started();
        let handed_off = self.shared.input.put(Delivery::Chunk(chunk)).await;
        self.input_outcome(handed_off)
    }

    async fn request_finalize(&self) -> Result<()> {
        if self
            .finalized
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return Ok(());
        }
        if self.shared.signals.is_closed() {
            return Err(self.destroyed_error());
        }
        self.ensure_started();
        let handed_off = self.shared.input.put(Delivery::End).await;
        self.input_outcome(handed_off)?;
        self.shared.signals.mark_finished();
        self.shared.close_if_complete();
        Ok(())
    }

    async fn pull_read(&self) -> Result<Option<T>> {
        if self.shared.signals.snapshot().ended {
            return Ok(None);
        }
        self.ensure_started();
        match self.shared.output.take().await {
            Some(Delivery::Chunk(chunk)) => Ok(Some(chunk)),
            Some(Delivery::End) => {
                self.shared.signals.mark_ended();
                self.shared.close_if_complete();
                Ok(None)
            }
            None => Err(self.destroyed_error()),
        }
    }

    fn destroy(&self, reason: Option<ComposeError>) -> Result<()> {
        if self.shared.signals.is_closed() {
            return Ok(());
        }
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
        lock(&self.body).take();
        self.shared.shutdown(reason);
        Ok(())
    }

    fn status(&self) -> watch::Receiver<StageStatus> {
        self.shared.signals.status()
    }

    fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.shared.signals.subscribe()
    }
}

impl<T> Drop for GeneratorStage<T> {
    fn drop(&mut self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
    }
}
