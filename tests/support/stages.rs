//! Test stages and helpers shared by the composition tests

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use streamsplice::{
    BufferedStage, ComposeError, Result, StageEvent, StageSides, StageSignals, StageSource,
    StageStatus, StreamCapability,
};
use tokio::sync::{broadcast, watch};

/// Fail the test if `future` does not finish within two seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("operation did not complete in time")
}

pub fn doubler() -> StageSource<i32> {
    StageSource::generator(|chunks| chunks.map(|x: i32| Ok(x * 2)))
}

pub fn plus_one() -> StageSource<i32> {
    StageSource::generator(|chunks| chunks.map(|x: i32| Ok(x + 1)))
}

/// Pass-through stage whose first `destroy` reports a failure of its own.
pub struct FailingDestroy {
    inner: BufferedStage<i32>,
    raised: AtomicBool,
}

impl FailingDestroy {
    pub fn new() -> Self {
        Self {
            inner: BufferedStage::pass_through(4),
            raised: AtomicBool::new(false),
        }
    }

    pub fn error() -> ComposeError {
        ComposeError::stage("destroy failed")
    }
}

#[async_trait]
impl StreamCapability<i32> for FailingDestroy {
    fn sides(&self) -> StageSides {
        self.inner.sides()
    }

    fn is_readable_active(&self) -> bool {
        self.inner.is_readable_active()
    }

    fn is_writable_active(&self) -> bool {
        self.inner.is_writable_active()
    }

    async fn submit_write(&self, chunk: i32) -> Result<()> {
        self.inner.submit_write(chunk).await
    }

    async fn request_finalize(&self) -> Result<()> {
        self.inner.request_finalize().await
    }

    async fn pull_read(&self) -> Result<Option<i32>> {
        self.inner.pull_read().await
    }

    fn destroy(&self, reason: Option<ComposeError>) -> Result<()> {
        self.inner.destroy(reason)?;
        if self.raised.swap(true, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Self::error())
        }
    }

    fn status(&self) -> watch::Receiver<StageStatus> {
        self.inner.status()
    }

    fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.inner.subscribe()
    }
}

/// Pass-through stage that closes with its own error whenever it is torn down.
pub struct FailsOnTeardown {
    inner: BufferedStage<i32>,
    error: ComposeError,
}

impl FailsOnTeardown {
    pub fn new(error: ComposeError) -> Self {
        Self {
            inner: BufferedStage::pass_through(4),
            error,
        }
    }
}

#[async_trait]
impl StreamCapability<i32> for FailsOnTeardown {
    fn sides(&self) -> StageSides {
        self.inner.sides()
    }

    fn is_readable_active(&self) -> bool {
        self.inner.is_readable_active()
    }

    fn is_writable_active(&self) -> bool {
        self.inner.is_writable_active()
    }

    async fn submit_write(&self, chunk: i32) -> Result<()> {
        self.inner.submit_write(chunk).await
    }

    async fn request_finalize(&self) -> Result<()> {
        self.inner.request_finalize().await
    }

    async fn pull_read(&self) -> Result<Option<i32>> {
        self.inner.pull_read().await
    }

    fn destroy(&self, _reason: Option<ComposeError>) -> Result<()> {
        self.inner.destroy(Some(self.error.clone()))
    }

    fn status(&self) -> watch::Receiver<StageStatus> {
        self.inner.status()
    }

    fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.inner.subscribe()
    }
}

/// Duplex stage that never closes, whatever happens to it.
#[derive(Default)]
pub struct StuckStage {
    signals: StageSignals,
}

#[async_trait]
impl StreamCapability<i32> for StuckStage {
    fn sides(&self) -> StageSides {
        StageSides::DUPLEX
    }

    fn is_readable_active(&self) -> bool {
        true
    }

    fn is_writable_active(&self) -> bool {
        true
    }

    async fn submit_write(&self, _chunk: i32) -> Result<()> {
        std::future::pending().await
    }

    async fn request_finalize(&self) -> Result<()> {
        std::future::pending().await
    }

    async fn pull_read(&self) -> Result<Option<i32>> {
        std::future::pending().await
    }

    fn destroy(&self, _reason: Option<ComposeError>) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> watch::Receiver<StageStatus> {
        self.signals.status()
    }

    fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.signals.subscribe()
    }
}
