//! Pipeline linking
//!
//! [`PipelineLinker`] validates a chain of stages, spawns one forwarder per
//! adjacent pair and one watcher per stage, and folds every stage's lifecycle
//! into a single [`Settlement`].
//!
//! Failure handling follows a first-cause-wins rule:
//! - the first error recorded becomes the terminal error and every stage is
//!   destroyed with it
//! - a synthesized premature close may still be replaced by a real error
//! - later errors are discarded (logged and kept for diagnostics)
//! - when teardown started without an error, the first error raised during it
//!   becomes the terminal error

mod stage;

pub use stage::{Stage, StageRole};

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::capability::StageStatus;
use crate::error::{ComposeError, Direction, Result};
use crate::utils::lock;

/// The single outcome of a linked pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Pending,
    /// Every stage closed; carries the terminal error, if any.
    Settled(Option<ComposeError>),
}

impl Settlement {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Settled(_))
    }

    pub fn error(&self) -> Option<ComposeError> {
        match self {
            Self::Settled(error) => error.clone(),
            Self::Pending => None,
        }
    }
}

#[derive(Default)]
struct LinkState {
    terminal: Option<ComposeError>,
    /// `terminal` is a synthesized premature close.
    synthesized: bool,
    teardown_started: bool,
    closed: Vec<bool>,
    settled: bool,
    discarded: Vec<ComposeError>,
}

struct LinkShared<T> {
    stages: Vec<Stage<T>>,
    state: Mutex<LinkState>,
    settlement: watch::Sender<Settlement>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> LinkShared<T> {
    /// Apply the first-cause-wins rule. Returns true when `error` became the
    /// terminal error.
    fn record(state: &mut LinkState, error: ComposeError, synthesized: bool) -> bool {
        if state.terminal.as_ref() == Some(&error) {
            return false;
        }
        match &state.terminal {
            None => {
                state.terminal = Some(error);
                state.synthesized = synthesized;
                true
            }
            Some(_) if state.synthesized && !synthesized => {
                tracing::debug!(error = %error, "replacing synthesized premature close");
                state.terminal = Some(error);
                state.synthesized = false;
                true
            }
            Some(terminal) => {
                tracing::debug!(error = %error, terminal = %terminal, "discarding secondary error");
                state.discarded.push(error);
                false
            }
        }
    }

    fn fail(&self, error: ComposeError, synthesized: bool) {
        let reason = {
            let mut state = lock(&self.state);
            Self::record(&mut state, error, synthesized);
            if state.teardown_started {
                return;
            }
            state.teardown_started = true;
            state.terminal.clone()
        };
        tracing::debug!(reason = ?reason, "pipeline failed, tearing down");
        self.teardown(reason);
    }

    /// Errors reported by a forwarder after teardown began are consequences of
    /// the teardown itself.
    fn forward_failed(&self, index: usize, error: ComposeError) {
        if lock(&self.state).teardown_started {
            tracing::trace!(index, error = %error, "forwarder stopped by teardown");
            return;
        }
        self.fail(error, false);
    }

    fn abort(&self, reason: Option<ComposeError>) {
        let reason = {
            let mut state = lock(&self.state);
            if let Some(error) = reason {
                Self::record(&mut state, error, false);
            }
            if state.teardown_started {
                return;
            }
            state.teardown_started = true;
            state.terminal.clone()
        };
        tracing::debug!(reason = ?reason, "pipeline aborted");
        self.teardown(reason);
    }

    fn complete(&self, index: usize) {
        tracing::trace!(index, "stage completed");
        if index + 1 != self.stages.len() {
            return;
        }
        {
            let mut state = lock(&self.state);
            if state.teardown_started {
                return;
            }
            state.teardown_started = true;
        }
        tracing::debug!("tail completed, releasing remaining stages");
        self.teardown(None);
    }

    fn teardown(&self, reason: Option<ComposeError>) {
        for forwarder in lock(&self.forwarders).drain(..) {
            forwarder.abort();
        }
        for stage in &self.stages {
            if let Err(error) = stage.capability.destroy(reason.clone()) {
                tracing::warn!(index = stage.index, error = %error, "stage failed to tear down");
                self.fail(error, false);
            }
        }
    }

    fn closed(&self, index: usize, snapshot: &StageStatus) {
        let premature = {
            let mut state = lock(&self.state);
            if state.closed[index] {
                return;
            }
            state.closed[index] = true;
            let sides = self.stages[index].capability.sides();
            !state.teardown_started && snapshot.error.is_none() && !snapshot.is_complete(sides)
        };
        if premature {
            tracing::debug!(index, "stage closed before completing");
            self.fail(ComposeError::PrematureClose, true);
        }

        let outcome = {
            let mut state = lock(&self.state);
            if state.settled || !state.closed.iter().all(|closed| *closed) {
                return;
            }
            state.settled = true;
            state.terminal.clone()
        };
        for forwarder in lock(&self.forwarders).drain(..) {
            forwarder.abort();
        }
        tracing::debug!(error = ?outcome, "pipeline settled");
        self.settlement.send_replace(Settlement::Settled(outcome));
    }

    fn first_error(&self) -> Option<ComposeError> {
        if let Some(terminal) = lock(&self.state).terminal.clone() {
            return Some(terminal);
        }
        self.stages
            .iter()
            .find_map(|stage| stage.capability.status().borrow().error.clone())
    }
}

async fn forward<T: Send + 'static>(shared: Arc<LinkShared<T>>, left: usize) {
    let source = shared.stages[left].capability.clone();
    let target = shared.stages[left + 1].capability.clone();
    loop {
        match source.pull_read().await {
            Ok(Some(chunk)) => {
                if let Err(error) = target.submit_write(chunk).await {
                    shared.forward_failed(left + 1, error);
                    return;
                }
            }
            Ok(None) => {
                tracing::trace!(from = left, "end of data, finalizing next stage");
                if let Err(error) = target.request_finalize().await {
                    shared.forward_failed(left + 1, error);
                }
                return;
            }
            Err(error) => {
                shared.forward_failed(left, error);
                return;
            }
        }
    }
}

async fn watch_stage<T: Send + 'static>(shared: Arc<LinkShared<T>>, index: usize) {
    let capability = shared.stages[index].capability.clone();
    let sides = capability.sides();
    let mut status = capability.status();
    let mut seen_error = false;
    let mut seen_complete = false;
    loop {
        let snapshot = status.borrow_and_update().clone();
        if !seen_error {
            if let Some(error) = &snapshot.error {
                seen_error = true;
                tracing::debug!(index, error = %error, "stage errored");
                shared.fail(error.clone(), false);
            }
        }
        if !seen_complete && snapshot.is_complete(sides) {
            seen_complete = true;
            shared.complete(index);
        }
        if snapshot.closed {
            shared.closed(index, &snapshot);
            return;
        }
        if status.changed().await.is_err() {
            // The stage is gone without reporting; treat it as closed.
            let last = status.borrow().clone();
            shared.closed(index, &last);
            return;
        }
    }
}

/// A linked chain.
pub struct LinkedPipeline<T> {
    pub head: Stage<T>,
    pub tail: Stage<T>,
    pub settled: watch::Receiver<Settlement>,
    shared: Arc<LinkShared<T>>,
}

impl<T> Clone for LinkedPipeline<T> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            tail: self.tail.clone(),
            settled: self.settled.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> LinkedPipeline<T> {
    /// External teardown entry point.
    pub fn abort(&self, reason: Option<ComposeError>) {
        self.shared.abort(reason);
    }

    /// The terminal error, or the first error visible on a stage that the
    /// linker has not processed yet.
    pub fn first_error(&self) -> Option<ComposeError> {
        self.shared.first_error()
    }

    pub fn is_settled(&self) -> bool {
        self.shared.settlement.borrow().is_settled()
    }

    pub fn is_tearing_down(&self) -> bool {
        lock(&self.shared.state).teardown_started
    }

    /// Errors dropped by the first-cause-wins rule.
    pub fn discarded_errors(&self) -> Vec<ComposeError> {
        lock(&self.shared.state).discarded.clone()
    }

    pub fn stages(&self) -> &[Stage<T>] {
        &self.shared.stages
    }

    /// Wait for the settlement and return its terminal error.
    pub async fn wait_settled(&self) -> Option<ComposeError> {
        let mut settled = self.shared.settlement.subscribe();
        match settled.wait_for(Settlement::is_settled).await {
            Ok(settlement) => settlement.error(),
            Err(_) => self.first_error(),
        }
    }
}

pub struct PipelineLinker;

impl PipelineLinker {
    /// Check that every stage can talk to its neighbours.
    ///
    /// Readable is checked before writable for the same index.
    pub fn validate<T>(stages: &[Stage<T>]) -> Result<()> {
        if stages.is_empty() {
            return Err(ComposeError::MissingStages);
        }
        for stage in stages {
            if !stage.role.is_tail() && !stage.readable_side {
                return Err(ComposeError::StageDirectionMismatch {
                    index: stage.index,
                    expected: Direction::Readable,
                });
            }
            if !stage.role.is_head() && !stage.writable_side {
                return Err(ComposeError::StageDirectionMismatch {
                    index: stage.index,
                    expected: Direction::Writable,
                });
            }
        }
        Ok(())
    }

    /// Validate and wire `stages`. Nothing is spawned when validation fails.
    pub fn link<T: Send + 'static>(
        stages: Vec<Stage<T>>,
        runtime: &Handle,
    ) -> Result<LinkedPipeline<T>> {
        Self::validate(&stages)?;
        let len = stages.len();
        let head = stages[0].clone();
        let tail = stages[len - 1].clone();
        let (settlement, settled) = watch::channel(Settlement::Pending);
        let shared = Arc::new(LinkShared {
            stages,
            state: Mutex::new(LinkState {
                closed: vec![false; len],
                ..LinkState::default()
            }),
            settlement,
            forwarders: Mutex::new(Vec::with_capacity(len - 1)),
        });

        for left in 0..len - 1 {
            let handle = runtime.spawn(
                forward(shared.clone(), left)
                    .instrument(tracing::trace_span!("forward", from = left, to = left + 1)),
            );
            lock(&shared.forwarders).push(handle);
        }
        for index in 0..len {
            runtime.spawn(
                watch_stage(shared.clone(), index)
                    .instrument(tracing::trace_span!("watch", stage = index)),
            );
        }
        tracing::debug!(stages = len, "pipeline linked");

        Ok(LinkedPipeline {
            head,
            tail,
            settled,
            shared,
        })
    }
}
