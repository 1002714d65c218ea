//! Mutable bookkeeping of a composed duplex.

use tokio::sync::oneshot;

use crate::error::ComposeError;

/// Continuation parked by a pending `write` or `read`. Resolved with the
/// teardown reason when the composition is finalized underneath it.
pub type Continuation = oneshot::Sender<Option<ComposeError>>;

/// Invoked exactly once with the final outcome of the composition.
pub type FinalizeCallback = Box<dyn FnOnce(Option<ComposeError>) + Send>;

pub struct CompositionState {
    pub head_writable: bool,
    pub tail_readable: bool,
    pub write_ended: bool,
    pub read_ended: bool,
    pub pending_accept: Option<Continuation>,
    pub pending_read: Option<Continuation>,
    pub finalize_callback: Option<FinalizeCallback>,
    pub terminal_error: Option<ComposeError>,
    /// Goes from false to true exactly once.
    pub is_finalizing: bool,
}

impl CompositionState {
    pub fn new(head_writable: bool, tail_readable: bool, on_finalize: FinalizeCallback) -> Self {
        Self {
            head_writable,
            tail_readable,
            write_ended: false,
            read_ended: false,
            pending_accept: None,
            pending_read: None,
            finalize_callback: Some(on_finalize),
            terminal_error: None,
            is_finalizing: false,
        }
    }

    /// Error reported to callers once teardown has started.
    pub fn teardown_error(&self) -> ComposeError {
        self.terminal_error.clone().unwrap_or(ComposeError::Destroyed)
    }
}
