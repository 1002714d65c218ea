//! Exactly-once teardown of a composed unit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::Instrument;

use crate::bridge::state::CompositionState;
use crate::config::saturating_millis;
use crate::error::ComposeError;
use crate::pipeline::LinkedPipeline;
use crate::utils::lock;

/// Decides the final disposition of a composition.
///
/// The first [`finalize`](Self::finalize) call wins; it records the terminal
/// error, releases parked continuations, tears the pipeline down and, once
/// every stage has closed, invokes the finalize callback exactly once.
pub struct TeardownCoordinator<T> {
    pipeline: LinkedPipeline<T>,
    state: Arc<Mutex<CompositionState>>,
    runtime: Handle,
    timeout: Option<Duration>,
}

impl<T: Send + 'static> TeardownCoordinator<T> {
    pub fn new(
        pipeline: LinkedPipeline<T>,
        state: Arc<Mutex<CompositionState>>,
        runtime: Handle,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            pipeline,
            state,
            runtime,
            timeout,
        }
    }

    /// Start teardown. Returns true when this call started it.
    pub fn finalize(&self, reason: Option<ComposeError>) -> bool {
        let (recorded, pending_accept, pending_read) = {
            let mut state = lock(&self.state);
            if state.is_finalizing {
                if let Some(reason) = &reason {
                    tracing::debug!(reason = %reason, "teardown already started, reason discarded");
                }
                return false;
            }
            state.is_finalizing = true;
            let recorded = self.pipeline.first_error().or(reason.clone());
            state.terminal_error = recorded.clone();
            (
                recorded,
                state.pending_accept.take(),
                state.pending_read.take(),
            )
        };
        tracing::debug!(reason = ?recorded, "composition teardown started");

        for continuation in [pending_accept, pending_read].into_iter().flatten() {
            let _ = continuation.send(recorded.clone());
        }
        self.pipeline.abort(recorded.clone());

        let pipeline = self.pipeline.clone();
        let state = self.state.clone();
        let timeout = self.timeout;
        self.runtime.spawn(
            async move {
                let surfaced = match timeout {
                    Some(limit) => {
                        match tokio::time::timeout(limit, pipeline.wait_settled()).await {
                            Ok(surfaced) => surfaced,
                            Err(_) => {
                                tracing::warn!(
                                    timeout_ms = saturating_millis(limit),
                                    "stages did not close before the teardown timeout"
                                );
                                pipeline.first_error()
                            }
                        }
                    }
                    None => pipeline.wait_settled().await,
                };
                let outcome = recorded.or(surfaced);
                let callback = {
                    let mut state = lock(&state);
                    if state.terminal_error.is_none() {
                        state.terminal_error = outcome.clone();
                    }
                    state.finalize_callback.take()
                };
                if let Some(callback) = callback {
                    callback(outcome);
                }
            }
            .in_current_span(),
        );
        true
    }

    pub fn is_finalizing(&self) -> bool {
        lock(&self.state).is_finalizing
    }
}
