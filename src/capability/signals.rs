use tokio::sync::{broadcast, watch};

use super::{StageEvent, StageStatus};
use crate::error::ComposeError;

const EVENT_CAPACITY: usize = 64;

/// Status and event channels of a single stage.
///
/// Transitions are once-only: each `mark_*`/`fail`/`close` call returns `true`
/// only for the call that actually changed the status, and only that call
/// publishes the matching [`StageEvent`].
#[derive(Debug)]
pub struct StageSignals {
    status: watch::Sender<StageStatus>,
    events: broadcast::Sender<StageEvent>,
}

impl StageSignals {
    pub fn new() -> Self {
        let (status, _) = watch::channel(StageStatus::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { status, events }
    }

    pub fn snapshot(&self) -> StageStatus {
        self.status.borrow().clone()
    }

    pub fn status(&self) -> watch::Receiver<StageStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    pub fn error(&self) -> Option<ComposeError> {
        self.status.borrow().error.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.status.borrow().closed
    }

    /// Publish an event without touching the status.
    pub fn emit(&self, event: StageEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    pub fn mark_finished(&self) -> bool {
        let changed = self.status.send_if_modified(|s| {
            if s.finished || s.closed {
                return false;
            }
            s.finished = true;
            true
        });
        if changed {
            self.emit(StageEvent::Finished);
        }
        changed
    }

    pub fn mark_ended(&self) -> bool {
        let changed = self.status.send_if_modified(|s| {
            if s.ended || s.closed {
                return false;
            }
            s.ended = true;
            true
        });
        if changed {
            self.emit(StageEvent::Ended);
        }
        changed
    }

    /// Record the stage error. Only the first error is kept.
    pub fn fail(&self, error: ComposeError) -> bool {
        let mut recorded = None;
        let changed = self.status.send_if_modified(|s| {
            if s.error.is_some() || s.closed {
                return false;
            }
            s.error = Some(error.clone());
            recorded = Some(error);
            true
        });
        if let Some(error) = recorded {
            self.emit(StageEvent::Errored(error));
        }
        changed
    }

    pub fn close(&self) -> bool {
        let mut closed_with = None;
        let changed = self.status.send_if_modified(|s| {
            if s.closed {
                return false;
            }
            s.closed = true;
            closed_with = Some(s.error.clone());
            true
        });
        if let Some(error) = closed_with {
            self.emit(StageEvent::Closed(error));
        }
        changed
    }
}

impl Default for StageSignals {
    fn default() -> Self {
        Self::new()
    }
}
