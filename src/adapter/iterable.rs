//! Read-only stage republishing an iterator or stream.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::capability::{StageEvent, StageSides, StageSignals, StageStatus, StreamCapability};
use crate::error::{ComposeError, Result};

/// Pulls lazily from its source: one `pull_read` advances the source by one item.
pub struct IterableStage<T> {
    source: tokio::sync::Mutex<Option<BoxStream<'static, Result<T>>>>,
    signals: StageSignals,
    cancel: CancellationToken,
}

impl<T: Send + 'static> IterableStage<T> {
    pub fn from_stream(source: BoxStream<'static, Result<T>>) -> Self {
        Self {
            source: tokio::sync::Mutex::new(Some(source)),
            signals: StageSignals::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(futures::stream::iter(items.into_iter().map(Ok)).boxed())
    }

    fn destroyed_error(&self) -> ComposeError {
        self.signals.error().unwrap_or(ComposeError::Destroyed)
    }
}

#[async_trait]
impl<T: Send + 'static> StreamCapability<T> for IterableStage<T> {
    fn sides(&self) -> StageSides {
        StageSides::READABLE
    }

    fn is_readable_active(&self) -> bool {
        let status = self.signals.snapshot();
        !status.ended && !status.closed
    }

    fn is_writable_active(&self) -> bool {
        false
    }

    async fn submit_write(&self, _chunk: T) -> Result<()> {
        Err(ComposeError::NotWritable)
    }

    async fn request_finalize(&self) -> Result<()> {
        Err(ComposeError::NotWritable)
    }

    async fn pull_read(&self) -> Result<Option<T>> {
        if self.signals.snapshot().ended {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            return Err(self.destroyed_error());
        }
        let mut source = self.source.lock().await;
        let Some(stream) = source.as_mut() else {
            return Err(self.destroyed_error());
        };
        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.destroyed_error()),
            item = stream.next() => item,
        };
        match item {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => {
                source.take();
                drop(source);
                let _ = self.destroy(Some(err.clone()));
                Err(err)
            }
            None => {
                source.take();
                drop(source);
                self.signals.mark_ended();
                self.signals.close();
                Ok(None)
            }
        }
    }

    fn destroy(&self, reason: Option<ComposeError>) -> Result<()> {
        if self.signals.is_closed() {
            return Ok(());
        }
        self.cancel.cancel();
        if let Some(err) = reason {
            self.signals.fail(err);
        }
        self.signals.close();
        Ok(())
    }

    fn status(&self) -> watch::Receiver<StageStatus> {
        self.signals.status()
    }

    fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.signals.subscribe()
    }
}
