//! # streamsplice
//!
//! Compose a chain of heterogeneous stream stages into a single duplex unit
//! with shared backpressure, error propagation and teardown.
//!
//! ## Stages
//!
//! A chain element is a [`StageSource`]:
//! - a ready-made [`StreamCapability`] (for example a [`BufferedStage`] or
//!   another [`ComposedDuplex`])
//! - a generator function transforming the inbound chunks
//! - an async function that either produces a stream or consumes the input
//! - an iterable or stream of values
//!
//! Every stage except the last must be readable; every stage except the first
//! must be writable.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use streamsplice::{StageSource, compose};
//!
//! #[tokio::main]
//! async fn main() -> streamsplice::Result<()> {
//!     let duplex = compose(vec![
//!         StageSource::generator(|chunks| chunks.map(|x: i32| Ok(x * 2))),
//!         StageSource::generator(|chunks| chunks.map(|x: i32| Ok(x + 1))),
//!     ])?;
//!
//!     let reader = duplex.clone();
//!     let consumer = tokio::spawn(async move { reader.into_stream().collect::<Vec<_>>().await });
//!     for x in [1, 2, 3] {
//!         duplex.write(x).await?;
//!     }
//!     duplex.end().await?;
//!     println!("{:?}", consumer.await);
//!     Ok(())
//! }
//! ```
//!
//! ## Lifecycle
//!
//! The first error raised anywhere in the chain becomes the composition's
//! terminal error; every stage is then destroyed with it and
//! [`ComposedDuplex::closed`] resolves with it. Destroying the composed unit
//! tears the whole chain down exactly once.

#![deny(unsafe_code)]

pub mod adapter;
pub mod bridge;
pub mod capability;
pub mod config;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod teardown;
pub mod telemetry;
pub mod utils;

use std::any::Any;

use tokio::runtime::Handle;
use uuid::Uuid;

pub use adapter::{
    AsyncFn, AsyncFnOutput, ChunkSource, GeneratorFn, SourceKind, StageSource, classify,
};
pub use bridge::ComposedDuplex;
pub use capability::{
    ChunkMode, SharedCapability, StageEvent, StageSides, StageSignals, StageStatus,
    StreamCapability,
};
pub use config::ComposeOptions;
pub use error::{ComposeError, Direction, ErrorCategory, Result};
pub use memory::BufferedStage;
pub use utils::cancel::CancelHandle;

use adapter::make_adapter;
use pipeline::{PipelineLinker, StageRole};

/// Compose `stages` into one duplex with default options.
pub fn compose<T: Send + 'static>(stages: Vec<StageSource<T>>) -> Result<ComposedDuplex<T>> {
    compose_with(stages, ComposeOptions::default())
}

/// Compose `stages` into one duplex.
///
/// Must be called from within a Tokio runtime; the stages are driven by tasks
/// spawned on it. Nothing is spawned when the chain is rejected.
pub fn compose_with<T: Send + 'static>(
    stages: Vec<StageSource<T>>,
    options: ComposeOptions,
) -> Result<ComposedDuplex<T>> {
    if stages.is_empty() {
        return Err(ComposeError::MissingStages);
    }
    let runtime = Handle::try_current().map_err(|_| ComposeError::NoRuntime)?;
    let len = stages.len();
    let id = Uuid::new_v4();
    let span = tracing::debug_span!(
        "compose",
        id = %id,
        label = options.label.as_deref().unwrap_or_default(),
        stages = len,
    );

    span.in_scope(|| {
        let stages = stages
            .into_iter()
            .enumerate()
            .map(|(index, source)| {
                make_adapter(index, source, StageRole::for_position(index, len))
            })
            .collect();
        let pipeline = PipelineLinker::link(stages, &runtime).inspect_err(|error| {
            tracing::debug!(error = %error, "composition rejected");
        })?;
        Ok(ComposedDuplex::new(
            id,
            pipeline,
            &options,
            runtime.clone(),
            span.clone(),
        ))
    })
}

/// Compose dynamically typed chain elements.
///
/// Every element goes through [`classify`]; an unsupported value fails with
/// [`ComposeError::InvalidStageType`] carrying its position.
pub fn compose_any<T: Send + 'static>(stages: Vec<Box<dyn Any + Send>>) -> Result<ComposedDuplex<T>> {
    let stages = stages
        .into_iter()
        .enumerate()
        .map(|(index, value)| classify(index, value))
        .collect::<Result<Vec<_>>>()?;
    compose(stages)
}

/// Compose the listed stages. Each argument is converted with
/// `StageSource::from`.
///
/// ```rust,ignore
/// let duplex = streamsplice::compose!(vec![1, 2, 3], StageSource::generator(double))?;
/// ```
#[macro_export]
macro_rules! compose {
    () => {
        $crate::compose(::std::vec::Vec::new())
    };
    ($($stage:expr),+ $(,)?) => {
        $crate::compose(::std::vec![$($crate::StageSource::from($stage)),+])
    };
}
