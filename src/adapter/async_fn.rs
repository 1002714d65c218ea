//! Async-function stages
//!
//! An async function receives the inbound chunks and either hands back a
//! stream (the stage becomes read-only) or a future that settles once the
//! function is done consuming (the stage becomes write-only).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::generator::{ChunkSource, chunk_source};
use super::handshake::{Delivery, Handshake};
use super::iterable::IterableStage;
use crate::capability::{
    SharedCapability, StageEvent, StageSides, StageSignals, StageStatus, StreamCapability,
};
use crate::error::{ComposeError, Result};
use crate::utils::lock;

/// What an async function hands back when invoked.
pub enum AsyncFnOutput<T> {
    /// A sequence of produced chunks; the stage is readable only.
    Stream(BoxStream<'static, Result<T>>),
    /// Completion of the consumer; the stage is writable only.
    Settled(BoxFuture<'static, Result<()>>),
}

/// Async function body.
pub type AsyncFn<T> = Box<dyn FnOnce(ChunkSource<T>) -> AsyncFnOutput<T> + Send>;

/// Invoke `body` and build the stage shape its output calls for.
///
/// The returned stream or future is lazy, so invoking the body performs no
/// work until the stage is driven.
pub(crate) fn adapt_async_fn<T: Send + 'static>(body: AsyncFn<T>) -> SharedCapability<T> {
    let input = Arc::new(Handshake::new());
    match body(chunk_source(input.clone())) {
        AsyncFnOutput::Stream(produced) => {
            // Nothing will ever be written to a read-only stage.
            input.close();
            Arc::new(IterableStage::from_stream(produced))
        }
        AsyncFnOutput::Settled(settled) => Arc::new(SettledStage::new(input, settled)),
    }
}

#[derive(Clone)]
enum Settlement {
    Pending,
    Settled(Result<()>),
    TornDown,
}

struct SettledShared {
    signals: StageSignals,
    outcome: watch::Sender<Settlement>,
}

/// Write-only stage completing with the async function's future.
pub struct SettledStage<T> {
    input: Arc<Handshake<T>>,
    shared: Arc<SettledShared>,
    settled: Mutex<Option<BoxFuture<'static, Result<()>>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    finalized: AtomicBool,
}

impl<T: Send + 'static> SettledStage<T> {
    fn new(input: Arc<Handshake<T>>, settled: BoxFuture<'static, Result<()>>) -> Self {
        let (outcome, _) = watch::channel(Settlement::Pending);
        Self {
            input,
            shared: Arc::new(SettledShared {
                signals: StageSignals::new(),
                outcome,
            }),
            settled: Mutex::new(Some(settled)),
            driver: Mutex::new(None),
            finalized: AtomicBool::new(false),
        }
    }

    fn ensure_started(&self) {
        let Some(settled) = lock(&self.settled).take() else {
            return;
        };
        let shared = self.shared.clone();
        let input = self.input.clone();
        let span = tracing::debug_span!("async_fn_stage");
        let handle = tokio::spawn(
            async move {
                let result = settled.await;
                input.close();
                if let Err(err) = &result {
                    tracing::debug!(error = %err, "async function rejected");
                    shared.signals.fail(err.clone());
                    shared.signals.close();
                }
                shared.outcome.send_replace(Settlement::Settled(result));
            }
            .instrument(span),
        );
        *lock(&self.driver) = Some(handle);
    }

    fn settled_ok(&self) -> bool {
        matches!(*self.shared.outcome.borrow(), Settlement::Settled(Ok(())))
    }

    fn destroyed_error(&self) -> ComposeError {
        self.shared
            .signals
            .error()
            .unwrap_or(ComposeError::Destroyed)
    }

    /// Input refused because the function already settled successfully is
    /// discarded rather than reported.
    fn input_outcome(&self, handed_off: Result<()>) -> Result<()> {
        match handed_off {
            Ok(()) => Ok(()),
            Err(_) if self.settled_ok() => Ok(()),
            Err(_) => Err(self.destroyed_error()),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> StreamCapability<T> for SettledStage<T> {
    fn sides(&self) -> StageSides {
        StageSides::WRITABLE
    }

    fn is_readable_active(&self) -> bool {
        false
    }

    fn is_writable_active(&self) -> bool {
        !self.finalized.load(Ordering::SeqCst) && !self.shared.signals.is_closed()
    }

    async fn submit_write(&self, chunk: T) -> Result<()> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(ComposeError::WriteAfterEnd);
        }
        if self.shared.signals.is_closed() {
            return Err(self.destroyed_error());
        }
        self.ensure_started();
        let handed_off = self.input.put(Delivery::Chunk(chunk)).await;
        self.input_outcome(handed_off)
    }

    async fn request_finalize(&self) -> Result<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.shared.signals.is_closed() {
            return Err(self.destroyed_error());
        }
        self.ensure_started();
        let handed_off = self.input.put(Delivery::End).await;
        self.input_outcome(handed_off)?;

        let mut outcome = self.shared.outcome.subscribe();
        let settled = match outcome
            .wait_for(|state| !matches!(state, Settlement::Pending))
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => Settlement::TornDown,
        };
        match settled {
            Settlement::Settled(Ok(())) => {
                self.shared.signals.mark_finished();
                self.shared.signals.close();
                Ok(())
            }
            Settlement::Settled(Err(err)) => Err(err),
            Settlement::Pending | Settlement::TornDown => Err(self.destroyed_error()),
        }
    }

    async fn pull_read(&self) -> Result<Option<T>> {
        Err(ComposeError::NotReadable)
    }

    fn destroy(&self, reason: Option<ComposeError>) -> Result<()> {
        if self.shared.signals.is_closed() {
            return Ok(());
        }
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
        lock(&self.settled).take();
        self.input.close();
        if let Some(err) = reason {
            self.shared.signals.fail(err);
        }
        self.shared.signals.close();
        self.shared.outcome.send_if_modified(|state| {
            if matches!(state, Settlement::Pending) {
                *state = Settlement::TornDown;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    fn status(&self) -> watch::Receiver<StageStatus> {
        self.shared.signals.status()
    }

    fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.shared.signals.subscribe()
    }
}

impl<T> Drop for SettledStage<T> {
    fn drop(&mut self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
    }
}
