//! Single-slot pull/push handshake
//!
//! A rendezvous between one giver and one taker that holds at most one value.
//! The giver's `put` resolves only once the taker has received the value, which
//! is what keeps generator-backed stages from buffering more than one chunk.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

use crate::error::{ComposeError, Result};
use crate::utils::lock;

/// A value moving through the handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery<T> {
    Chunk(T),
    End,
}

/// Observable phase of a [`Handshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// No value and no parked taker.
    Idle,
    /// A taker is parked waiting for a value.
    AwaitingInput,
    /// A value is parked waiting for a taker.
    AwaitingConsumer,
    /// Closed; no further values are exchanged.
    Done,
}

enum HandshakeState<T> {
    Idle,
    AwaitingInput(oneshot::Sender<Delivery<T>>),
    AwaitingConsumer {
        delivery: Delivery<T>,
        ack: oneshot::Sender<()>,
        ticket: u64,
    },
    Done,
}

pub struct Handshake<T> {
    state: std::sync::Mutex<HandshakeState<T>>,
    tickets: AtomicU64,
}

/// Withdraws a parked value when its `put` is dropped before a taker arrived.
struct ParkedPut<'a, T> {
    handshake: &'a Handshake<T>,
    ticket: u64,
}

impl<T> Drop for ParkedPut<'_, T> {
    fn drop(&mut self) {
        let mut state = lock(&self.handshake.state);
        let withdrawn = matches!(
            &*state,
            HandshakeState::AwaitingConsumer { ticket, .. } if *ticket == self.ticket
        );
        if withdrawn {
            *state = HandshakeState::Idle;
        }
    }
}

impl<T> Handshake<T> {
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(HandshakeState::Idle),
            tickets: AtomicU64::new(0),
        }
    }

    fn park(
        &self,
        state: &mut HandshakeState<T>,
        delivery: Delivery<T>,
    ) -> (u64, oneshot::Receiver<()>) {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (ack, acked) = oneshot::channel();
        *state = HandshakeState::AwaitingConsumer {
            delivery,
            ack,
            ticket,
        };
        (ticket, acked)
    }

    pub fn phase(&self) -> HandshakePhase {
        match &*lock(&self.state) {
            HandshakeState::Idle => HandshakePhase::Idle,
            HandshakeState::AwaitingInput(_) => HandshakePhase::AwaitingInput,
            HandshakeState::AwaitingConsumer { .. } => HandshakePhase::AwaitingConsumer,
            HandshakeState::Done => HandshakePhase::Done,
        }
    }

    /// Hand a value to the taker, resolving once it has been received.
    ///
    /// Fails with `Destroyed` when the handshake is closed before the value is
    /// taken, and with `Internal` if another `put` is already parked. Dropping
    /// the returned future before the value is taken withdraws the value.
    pub async fn put(&self, delivery: Delivery<T>) -> Result<()> {
        let (ticket, ack) = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, HandshakeState::Idle) {
                HandshakeState::Idle => self.park(&mut state, delivery),
                HandshakeState::AwaitingInput(taker) => match taker.send(delivery) {
                    Ok(()) => return Ok(()),
                    // The parked taker went away; park the value for the next one.
                    Err(delivery) => self.park(&mut state, delivery),
                },
                occupied @ HandshakeState::AwaitingConsumer { .. } => {
                    *state = occupied;
                    return Err(ComposeError::Internal(
                        "handshake slot is already occupied".to_string(),
                    ));
                }
                HandshakeState::Done => {
                    *state = HandshakeState::Done;
                    return Err(ComposeError::Destroyed);
                }
            }
        };
        let _parked = ParkedPut {
            handshake: self,
            ticket,
        };
        ack.await.map_err(ComposeError::from)
    }

    /// Receive the next value. `None` once the handshake is closed.
    pub async fn take(&self) -> Option<Delivery<T>> {
        let incoming = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, HandshakeState::Idle) {
                HandshakeState::Idle => {
                    let (taker, incoming) = oneshot::channel();
                    *state = HandshakeState::AwaitingInput(taker);
                    incoming
                }
                HandshakeState::AwaitingConsumer { delivery, ack, .. } => {
                    let _ = ack.send(());
                    return Some(delivery);
                }
                HandshakeState::AwaitingInput(_) => {
                    // A second taker replaces the first; the first observes close.
                    let (taker, incoming) = oneshot::channel();
                    *state = HandshakeState::AwaitingInput(taker);
                    incoming
                }
                HandshakeState::Done => {
                    *state = HandshakeState::Done;
                    return None;
                }
            }
        };
        incoming.await.ok()
    }

    /// Close the handshake, waking any parked giver or taker.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), HandshakeState::Done);
        drop(previous);
    }
}

impl<T> Default for Handshake<T> {
    fn default() -> Self {
        Self::new()
    }
}
