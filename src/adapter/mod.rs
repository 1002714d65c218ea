//! Adapter factory
//!
//! Turns the accepted chain elements (ready-made capabilities, generator
//! functions, async functions, iterables and streams) into pipeline stages.

pub mod async_fn;
pub mod generator;
pub mod handshake;
pub mod iterable;

pub use async_fn::{AsyncFn, AsyncFnOutput, SettledStage};
pub use generator::{ChunkSource, GeneratorFn, GeneratorStage};
pub use handshake::{Delivery, Handshake, HandshakePhase};
pub use iterable::IterableStage;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};

use crate::capability::{SharedCapability, StreamCapability};
use crate::error::{ComposeError, Result};
use crate::pipeline::{Stage, StageRole};
use crate::utils::cancel::{CancelHandle, make_cancellable_stream};

/// A chain element accepted by `compose`.
pub enum StageSource<T> {
    Capability(SharedCapability<T>),
    Generator(GeneratorFn<T>),
    AsyncFn(AsyncFn<T>),
    Iterable(Box<dyn Iterator<Item = T> + Send>),
    /// Async iterable.
    Stream(BoxStream<'static, Result<T>>),
}

/// Which adapter produced a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Capability,
    Generator,
    AsyncFn,
    Iterable,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capability => f.write_str("capability"),
            Self::Generator => f.write_str("generator"),
            Self::AsyncFn => f.write_str("async-fn"),
            Self::Iterable => f.write_str("iterable"),
        }
    }
}

impl<T: Send + 'static> StageSource<T> {
    pub fn capability<C>(capability: C) -> Self
    where
        C: StreamCapability<T> + 'static,
    {
        Self::Capability(Arc::new(capability))
    }

    /// A duplex transform over the inbound chunks.
    pub fn generator<F, S>(body: F) -> Self
    where
        F: FnOnce(ChunkSource<T>) -> S + Send + 'static,
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        Self::Generator(Box::new(move |source: ChunkSource<T>| body(source).boxed()))
    }

    pub fn async_fn<F>(body: F) -> Self
    where
        F: FnOnce(ChunkSource<T>) -> AsyncFnOutput<T> + Send + 'static,
    {
        Self::AsyncFn(Box::new(body))
    }

    /// A write-only async function: consumes every inbound chunk and settles.
    pub fn consumer<F, Fut>(body: F) -> Self
    where
        F: FnOnce(ChunkSource<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::async_fn(move |source| AsyncFnOutput::Settled(body(source).boxed()))
    }

    /// A read-only async function producing a stream; its input is never fed.
    pub fn producer<F, S>(body: F) -> Self
    where
        F: FnOnce() -> S + Send + 'static,
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        Self::async_fn(move |_source| AsyncFnOutput::Stream(body().boxed()))
    }

    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::Iterable(Box::new(items.into_iter()))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// A stream source that can be cut short through the returned handle.
    /// Cancelling fails the stage with [`ComposeError::Aborted`].
    pub fn cancellable_stream<S>(stream: S) -> (Self, CancelHandle)
    where
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        let (stream, handle) = make_cancellable_stream(stream);
        (Self::Stream(stream), handle)
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Capability(_) => SourceKind::Capability,
            Self::Generator(_) => SourceKind::Generator,
            Self::AsyncFn(_) => SourceKind::AsyncFn,
            Self::Iterable(_) | Self::Stream(_) => SourceKind::Iterable,
        }
    }
}

impl<T> fmt::Debug for StageSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Capability(_) => "Capability",
            Self::Generator(_) => "Generator",
            Self::AsyncFn(_) => "AsyncFn",
            Self::Iterable(_) => "Iterable",
            Self::Stream(_) => "Stream",
        };
        f.debug_tuple(name).finish_non_exhaustive()
    }
}

impl<T: Send + 'static> From<Vec<T>> for StageSource<T> {
    fn from(items: Vec<T>) -> Self {
        Self::iter(items)
    }
}

impl<T: Send + 'static> From<GeneratorFn<T>> for StageSource<T> {
    fn from(body: GeneratorFn<T>) -> Self {
        Self::Generator(body)
    }
}

impl<T: Send + 'static> From<AsyncFn<T>> for StageSource<T> {
    fn from(body: AsyncFn<T>) -> Self {
        Self::AsyncFn(body)
    }
}

impl<T: Send + 'static> From<SharedCapability<T>> for StageSource<T> {
    fn from(capability: SharedCapability<T>) -> Self {
        Self::Capability(capability)
    }
}

/// Resolve a dynamically typed chain element.
///
/// Accepts a [`StageSource`], a shared capability, a composed duplex, a
/// `Vec<T>`, a [`GeneratorFn`] or an [`AsyncFn`].
pub fn classify<T: Send + 'static>(
    index: usize,
    value: Box<dyn Any + Send>,
) -> Result<StageSource<T>> {
    let value = match value.downcast::<StageSource<T>>() {
        Ok(source) => return Ok(*source),
        Err(value) => value,
    };
    let value = match value.downcast::<SharedCapability<T>>() {
        Ok(capability) => return Ok(StageSource::Capability(*capability)),
        Err(value) => value,
    };
    let value = match value.downcast::<crate::bridge::ComposedDuplex<T>>() {
        Ok(duplex) => return Ok(StageSource::from(*duplex)),
        Err(value) => value,
    };
    let value = match value.downcast::<Vec<T>>() {
        Ok(items) => return Ok(StageSource::from(*items)),
        Err(value) => value,
    };
    let value = match value.downcast::<GeneratorFn<T>>() {
        Ok(body) => return Ok(StageSource::Generator(*body)),
        Err(value) => value,
    };
    match value.downcast::<AsyncFn<T>>() {
        Ok(body) => Ok(StageSource::AsyncFn(*body)),
        Err(value) => Err(ComposeError::InvalidStageType {
            index,
            found: format!("unsupported value ({:?})", (*value).type_id()),
        }),
    }
}

/// Wrap `source` into the stage sitting at `index` with the given role.
pub fn make_adapter<T: Send + 'static>(
    index: usize,
    source: StageSource<T>,
    role: StageRole,
) -> Stage<T> {
    let kind = source.kind();
    let capability: SharedCapability<T> = match source {
        StageSource::Capability(capability) => capability,
        StageSource::Generator(body) => Arc::new(GeneratorStage::new(body)),
        StageSource::AsyncFn(body) => async_fn::adapt_async_fn(body),
        StageSource::Iterable(items) => Arc::new(IterableStage::from_items(items)),
        StageSource::Stream(stream) => Arc::new(IterableStage::from_stream(stream)),
    };
    tracing::trace!(index, %kind, ?role, "stage adapted");
    Stage::new(index, role, capability, kind)
}
