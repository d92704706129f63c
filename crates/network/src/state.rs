//! Connection lifecycle state.
//!
//! ```text
//! INIT ─┬─> WAITING_HELLO ──(Hello)──> ACTIVE ──(Bye)──────────> CLOSED
//!       └───────────(incoming)───────>   │ └──(close)─> CLOSE | CLOSING ─> CLOSED
//!                                        any ──(protocol violation)──> ERROR
//! ```
//!
//! Ordering matters: the read loop compares against `Active` to decide whether a quest is
//! early (fatal) or late (dropped).

use tokio::sync::watch;

/// The lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConState {
    /// Created, read loop not started.
    Init,
    /// Outgoing connection waiting for the peer's Hello.
    WaitingHello,
    /// Handshake complete, quests flow both ways.
    Active,
    /// Forced close requested locally.
    Close,
    /// Graceful close in progress: Bye sent, waiting for the peer's Bye.
    Closing,
    /// Closed after a Bye exchange or a forced close.
    Closed,
    /// Closed after a protocol violation.
    Error,
}

impl ConState {
    /// Whether the connection still accepts new calls.
    pub fn is_live(&self) -> bool {
        *self < Self::Close
    }
}

/// Holder for the connection state.
///
/// Every transition goes through [`Self::compare_and_set`] or [`Self::transition`], both of
/// which run under the watch channel's lock, so readers never observe a torn update and
/// waiters are woken on every change.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ConState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConState::Init);
        Self { tx }
    }

    /// Current state.
    pub(crate) fn load(&self) -> ConState {
        *self.tx.borrow()
    }

    /// Move from `from` to `to`. Returns false, leaving the state untouched, if the current
    /// state is not `from`.
    pub(crate) fn compare_and_set(&self, from: ConState, to: ConState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Apply `f` to the current state atomically. `f` returns the next state, or `None` to
    /// leave it unchanged. Returns the state observed before the call.
    pub(crate) fn transition<F>(&self, f: F) -> ConState
    where
        F: FnOnce(ConState) -> Option<ConState>,
    {
        let mut previous = ConState::Init;
        self.tx.send_if_modified(|state| {
            previous = *state;
            match f(*state) {
                Some(next) if next != *state => {
                    *state = next;
                    true
                }
                _ => false,
            }
        });
        previous
    }

    /// Wait until the state is no longer before `Active`, returning the state reached.
    pub(crate) async fn wait_past_handshake(&self) -> ConState {
        self.wait_until(|state| state >= ConState::Active).await
    }

    /// Wait until the connection is closed, returning `Closed` or `Error`.
    pub(crate) async fn wait_closed(&self) -> ConState {
        self.wait_until(|state| state >= ConState::Closed).await
    }

    async fn wait_until<F>(&self, mut ready: F) -> ConState
    where
        F: FnMut(ConState) -> bool,
    {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            // the sender lives as long as self, so `changed` only fails on drop
            if ready(state) || rx.changed().await.is_err() {
                return state;
            }
        }
    }
}
