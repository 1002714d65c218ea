//! Stream capability contract
//!
//! The minimal readable/writable surface the compositor needs from a stream
//! stage. Implementations keep their own state machines; the compositor only
//! drives them through [`StreamCapability`] and observes them through the
//! [`StageStatus`] watch channel and the [`StageEvent`] broadcast channel.

mod signals;

pub use signals::StageSignals;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::{ComposeError, Result};

/// Which endpoints a stage exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageSides {
    pub readable: bool,
    pub writable: bool,
}

impl StageSides {
    pub const DUPLEX: Self = Self {
        readable: true,
        writable: true,
    };
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };
}

/// Chunk framing a side operates in. Purely informational for the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    #[default]
    Object,
    Binary,
}

/// Lifecycle snapshot of a stage.
///
/// Every flag only ever goes from `false` to `true`, and `error` is set at
/// most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageStatus {
    /// The writable side ran its finalize handler.
    pub finished: bool,
    /// The readable side delivered its end marker.
    pub ended: bool,
    pub error: Option<ComposeError>,
    /// The stage has been fully torn down.
    pub closed: bool,
}

impl StageStatus {
    /// True when every exposed side is done and no error was raised.
    pub fn is_complete(&self, sides: StageSides) -> bool {
        self.error.is_none()
            && (!sides.readable || self.ended)
            && (!sides.writable || self.finished)
    }
}

/// Notifications a stage publishes while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    /// Backpressure relieved: a previously deferred write was accepted.
    Drain,
    /// New data can be pulled.
    ReadableAvailable,
    /// No more data will be produced.
    Ended,
    /// The writable side has been finalized.
    Finished,
    Errored(ComposeError),
    /// Fully torn down; carries the error the stage closed with, if any.
    Closed(Option<ComposeError>),
}

/// Readable/writable contract consumed by the compositor.
///
/// `submit_write` resolves once the chunk is accepted into the stage (not when
/// it is fully processed). `pull_read` may suspend and yields `None` as the end
/// marker. `destroy` must be idempotent; an `Err` reports a failure while
/// tearing the stage down, the stage is still considered destroyed.
#[async_trait]
pub trait StreamCapability<T: Send + 'static>: Send + Sync {
    fn sides(&self) -> StageSides;

    fn readable_mode(&self) -> ChunkMode {
        ChunkMode::Object
    }

    fn writable_mode(&self) -> ChunkMode {
        ChunkMode::Object
    }

    fn is_readable_active(&self) -> bool;

    fn is_writable_active(&self) -> bool;

    async fn submit_write(&self, chunk: T) -> Result<()>;

    async fn request_finalize(&self) -> Result<()>;

    async fn pull_read(&self) -> Result<Option<T>>;

    fn destroy(&self, reason: Option<ComposeError>) -> Result<()>;

    fn status(&self) -> watch::Receiver<StageStatus>;

    fn subscribe(&self) -> broadcast::Receiver<StageEvent>;
}

/// Shared handle to a capability, as stored in a pipeline stage.
pub type SharedCapability<T> = Arc<dyn StreamCapability<T>>;
