//! Cancellation utilities
//!
//! Provides first-class abort signals for composed streams.

use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::{ComposeError, Result};

/// A handle that can be used to request cancellation.
///
/// Passed to a composition through [`ComposeOptions::signal`]; cancelling it
/// destroys the composed unit with [`ComposeError::Aborted`].
///
/// [`ComposeOptions::signal`]: crate::config::ComposeOptions::signal
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Create a new cancel handle.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Request cancellation. Every composition observing this handle is torn
    /// down as soon as its abort task runs.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A future that resolves when cancellation is requested.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// A child handle cancelled together with this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }
}

/// Make a chunk stream cancellable and return its cancel handle.
///
/// Cancelling ends the stream with a single `Aborted` error item.
pub fn make_cancellable_stream<S, T>(
    stream: S,
) -> (futures::stream::BoxStream<'static, Result<T>>, CancelHandle)
where
    S: Stream<Item = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handle = CancelHandle::new();
    let token = handle.token.clone();
    let s = async_stream::stream! {
        use futures::StreamExt;
        let mut inner = Box::pin(stream);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    yield Err(ComposeError::Aborted("stream cancelled".to_string()));
                    break;
                }
                item = inner.next() => {
                    let Some(item) = item else { break };
                    yield item;
                }
            }
        }
    };
    (Box::pin(s), handle)
}
