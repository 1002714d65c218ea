//! In-memory stream primitives
//!
//! [`BufferedStage`] is a bounded, in-memory [`StreamCapability`]. It covers
//! the shapes a chain usually needs:
//! - duplex transforms (`pass_through`, `map`, `filter_map`)
//! - pushed sources (`readable` + `push` / `push_end`)
//! - sinks (`sink`, `collector`)
//!
//! Writes are acknowledged once the transformed chunk fits in the readable
//! buffer; while the buffer holds `high_water_mark` chunks, writes wait.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast, watch};

use crate::capability::{
    ChunkMode, StageEvent, StageSides, StageSignals, StageStatus, StreamCapability,
};
use crate::error::{ComposeError, Result};
use crate::utils::lock;

pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

type MapFn<T> = Box<dyn FnMut(T) -> Result<Option<T>> + Send>;
type SinkFn<T> = Box<dyn FnMut(T) -> Result<()> + Send>;

enum Operation<T> {
    PassThrough,
    Map(MapFn<T>),
    Sink(SinkFn<T>),
}

struct BufferState<T> {
    queue: VecDeque<T>,
    operation: Operation<T>,
    input_closed: bool,
    destroyed: bool,
}

/// Bounded in-memory stage.
///
/// Operations passed to the constructors run while the stage state is locked
/// and must not call back into the same stage.
pub struct BufferedStage<T> {
    sides: StageSides,
    high_water_mark: usize,
    readable_mode: ChunkMode,
    writable_mode: ChunkMode,
    state: Mutex<BufferState<T>>,
    space: Notify,
    data: Notify,
    signals: StageSignals,
}

impl<T: Send + 'static> BufferedStage<T> {
    fn build(sides: StageSides, high_water_mark: usize, operation: Operation<T>) -> Self {
        Self {
            sides,
            high_water_mark: high_water_mark.max(1),
            readable_mode: ChunkMode::Object,
            writable_mode: ChunkMode::Object,
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                operation,
                input_closed: false,
                destroyed: false,
            }),
            space: Notify::new(),
            data: Notify::new(),
            signals: StageSignals::new(),
        }
    }

    /// Duplex stage forwarding chunks unchanged.
    pub fn pass_through(high_water_mark: usize) -> Self {
        Self::build(StageSides::DUPLEX, high_water_mark, Operation::PassThrough)
    }

    /// Duplex stage applying `f` to every chunk. An `Err` fails the stage.
    pub fn map<F>(high_water_mark: usize, mut f: F) -> Self
    where
        F: FnMut(T) -> Result<T> + Send + 'static,
    {
        Self::build(
            StageSides::DUPLEX,
            high_water_mark,
            Operation::Map(Box::new(move |chunk: T| f(chunk).map(Some))),
        )
    }

    /// Duplex stage that may drop chunks by returning `Ok(None)`.
    pub fn filter_map<F>(high_water_mark: usize, f: F) -> Self
    where
        F: FnMut(T) -> Result<Option<T>> + Send + 'static,
    {
        Self::build(
            StageSides::DUPLEX,
            high_water_mark,
            Operation::Map(Box::new(f)),
        )
    }

    /// Readable-only stage fed through [`push`](Self::push).
    pub fn readable(high_water_mark: usize) -> Self {
        Self::build(StageSides::READABLE, high_water_mark, Operation::PassThrough)
    }

    /// Writable-only stage handing every chunk to `f`.
    pub fn sink<F>(f: F) -> Self
    where
        F: FnMut(T) -> Result<()> + Send + 'static,
    {
        Self::build(StageSides::WRITABLE, 1, Operation::Sink(Box::new(f)))
    }

    /// Writable-only stage collecting every chunk it accepts.
    pub fn collector() -> (Self, Arc<Mutex<Vec<T>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let stage = Self::sink(move |chunk| {
            lock(&sink).push(chunk);
            Ok(())
        });
        (stage, collected)
    }

    pub fn with_modes(mut self, readable: ChunkMode, writable: ChunkMode) -> Self {
        self.readable_mode = readable;
        self.writable_mode = writable;
        self
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Chunks currently waiting to be read.
    pub fn buffered_len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Push a chunk into the readable buffer, bypassing the write path.
    ///
    /// Returns `Ok(false)` once the buffer is at or above its high water mark;
    /// the chunk is still queued.
    pub fn push(&self, chunk: T) -> Result<bool> {
        if !self.sides.readable {
            return Err(ComposeError::NotReadable);
        }
        let below_mark = {
            let mut state = lock(&self.state);
            if state.destroyed {
                return Err(self.destroyed_error());
            }
            if state.input_closed {
                return Err(ComposeError::WriteAfterEnd);
            }
            state.queue.push_back(chunk);
            state.queue.len() < self.high_water_mark
        };
        self.data.notify_waiters();
        self.signals.emit(StageEvent::ReadableAvailable);
        Ok(below_mark)
    }

    /// Signal that no more chunks will be pushed.
    pub fn push_end(&self) {
        {
            let mut state = lock(&self.state);
            if state.destroyed {
                return;
            }
            state.input_closed = true;
        }
        self.data.notify_waiters();
    }

    /// Raise a stage-internal error and tear the stage down.
    pub fn fail(&self, error: ComposeError) {
        let _ = self.destroy(Some(error));
    }

    fn destroyed_error(&self) -> ComposeError {
        self.signals.error().unwrap_or(ComposeError::Destroyed)
    }

    fn accept(&self, mut state: MutexGuard<'_, BufferState<T>>, chunk: T) -> Result<()> {
        let outcome = match &mut state.operation {
            Operation::PassThrough => Ok(Some(chunk)),
            Operation::Map(f) => f(chunk),
            Operation::Sink(f) => f(chunk).map(|()| None),
        };
        match outcome {
            Ok(Some(out)) => {
                state.queue.push_back(out);
                drop(state);
                self.data.notify_waiters();
                self.signals.emit(StageEvent::ReadableAvailable);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                drop(state);
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    fn close_if_complete(&self) {
        if !self.signals.snapshot().is_complete(self.sides) {
            return;
        }
        {
            let mut state = lock(&self.state);
            state.destroyed = true;
            state.queue.clear();
        }
        self.space.notify_waiters();
        self.data.notify_waiters();
        self.signals.close();
    }
}

#[async_trait]
impl<T: Send + 'static> StreamCapability<T> for BufferedStage<T> {
    fn sides(&self) -> StageSides {
        self.sides
    }

    fn readable_mode(&self) -> ChunkMode {
        self.readable_mode
    }

    fn writable_mode(&self) -> ChunkMode {
        self.writable_mode
    }

    fn is_readable_active(&self) -> bool {
        self.sides.readable && !lock(&self.state).destroyed && !self.signals.snapshot().ended
    }

    fn is_writable_active(&self) -> bool {
        let state = lock(&self.state);
        self.sides.writable && !state.destroyed && !state.input_closed
    }

    async fn submit_write(&self, chunk: T) -> Result<()> {
        if !self.sides.writable {
            return Err(ComposeError::NotWritable);
        }
        let mut deferred = false;
        loop {
            let mut space = pin!(self.space.notified());
            space.as_mut().enable();
            {
                let state = lock(&self.state);
                if state.destroyed {
                    return Err(self.destroyed_error());
                }
                if state.input_closed {
                    return Err(ComposeError::WriteAfterEnd);
                }
                if !self.sides.readable || state.queue.len() < self.high_water_mark {
                    self.accept(state, chunk)?;
                    if deferred {
                        self.signals.emit(StageEvent::Drain);
                    }
                    return Ok(());
                }
            }
            deferred = true;
            space.await;
        }
    }

    async fn request_finalize(&self) -> Result<()> {
        if !self.sides.writable {
            return Err(ComposeError::NotWritable);
        }
        {
            let mut state = lock(&self.state);
            if state.destroyed {
                return Err(self.destroyed_error());
            }
            if state.input_closed {
                return Ok(());
            }
            state.input_closed = true;
        }
        self.data.notify_waiters();
        self.signals.mark_finished();
        self.close_if_complete();
        Ok(())
    }

    async fn pull_read(&self) -> Result<Option<T>> {
        if !self.sides.readable {
            return Err(ComposeError::NotReadable);
        }
        loop {
            let mut data = pin!(self.data.notified());
            data.as_mut().enable();
            {
                let mut state = lock(&self.state);
                if state.destroyed {
                    return match self.signals.error() {
                        Some(err) => Err(err),
                        None if self.signals.snapshot().ended => Ok(None),
                        None => Err(ComposeError::Destroyed),
                    };
                }
                if let Some(chunk) = state.queue.pop_front() {
                    drop(state);
                    self.space.notify_waiters();
                    return Ok(Some(chunk));
                }
                if state.input_closed {
                    drop(state);
                    self.signals.mark_ended();
                    self.close_if_complete();
                    return Ok(None);
                }
            }
            data.await;
        }
    }

    fn destroy(&self, reason: Option<ComposeError>) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.destroyed {
                return Ok(());
            }
            state.destroyed = true;
            state.queue.clear();
        }
        self.space.notify_waiters();
        self.data.notify_waiters();
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
