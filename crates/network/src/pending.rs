//! Outstanding outgoing calls, keyed by transaction id.

use crate::{
    error::{XicError, XicResult},
    message::Answer,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use xic_types::Exception;

/// What a caller receives: the encoded result of a normal answer, or an error.
pub type AnswerResult = XicResult<Vec<u8>>;

/// Counter and table share one lock: an id is assigned and stored in the same critical
/// section, and resolve/cancel remove under the same lock, so each call completes once.
#[derive(Debug, Default)]
struct PendingInner {
    /// Last assigned transaction id.
    last_txid: i64,
    /// Waiting callers.
    calls: HashMap<i64, oneshot::Sender<AnswerResult>>,
    /// Set by `fail_all`; no registrations are accepted afterwards.
    closed: bool,
}

impl PendingInner {
    /// Next id after `last_txid`, skipping zero, negative values, and ids still pending.
    fn next_txid(&mut self) -> i64 {
        loop {
            self.last_txid = self.last_txid.checked_add(1).filter(|id| *id > 0).unwrap_or(1);
            if !self.calls.contains_key(&self.last_txid) {
                return self.last_txid;
            }
        }
    }
}

/// The pending-call table of one connection.
#[derive(Debug, Default)]
pub struct PendingCalls {
    inner: Mutex<PendingInner>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn with_last_txid(last_txid: i64) -> Self {
        Self { inner: Mutex::new(PendingInner { last_txid, ..Default::default() }) }
    }

    /// Assign the next transaction id and store a waiter for it.
    ///
    /// Fails with [`XicError::ConnectionClosed`] once [`Self::fail_all`] has run.
    pub fn register(self: &Arc<Self>) -> XicResult<PendingCall> {
        let (tx, rx) = oneshot::channel();
        let txid = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(XicError::ConnectionClosed);
            }
            let txid = inner.next_txid();
            inner.calls.insert(txid, tx);
            txid
        };

        Ok(PendingCall { txid, rx, table: self.clone(), completed: false })
    }

    /// Deliver an answer to its waiting caller.
    ///
    /// Returns false if no call is waiting for the answer's transaction id. The answer is
    /// then discarded: the caller gave up or the id is stale.
    pub fn resolve(&self, answer: Answer) -> bool {
        let Some(reply) = self.inner.lock().calls.remove(&answer.txid) else {
            warn!(target: "xic::pending", txid = answer.txid, "discarding answer with unknown txid");
            return false;
        };

        let result = if answer.is_exceptional() {
            match Exception::decode_failure(&answer.args) {
                Ok(ex) => Err(XicError::Exception(ex)),
                Err(e) => Err(XicError::Codec(e)),
            }
        } else {
            Ok(answer.args)
        };

        if reply.send(result).is_err() {
            debug!(target: "xic::pending", txid = answer.txid, "caller dropped before answer");
        }
        true
    }

    /// Remove a waiter without completing it.
    ///
    /// Returns false if the call was already resolved or failed.
    pub fn cancel(&self, txid: i64) -> bool {
        self.inner.lock().calls.remove(&txid).is_some()
    }

    /// Fail every waiting call and refuse new registrations.
    ///
    /// Returns the number of calls failed.
    pub fn fail_all<F>(&self, error: F) -> usize
    where
        F: Fn() -> XicError,
    {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.calls.drain().collect()
        };

        let count = drained.len();
        for (txid, reply) in drained {
            if reply.send(Err(error())).is_err() {
                debug!(target: "xic::pending", txid, "caller dropped before close");
            }
        }
        count
    }

    /// Number of calls waiting for an answer.
    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// True when no calls are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One registered call.
///
/// Dropping it before completion (for example when a timeout elapses) removes the waiter
/// from the table, so a late answer is discarded instead of delivered to a dead slot.
#[derive(Debug)]
pub struct PendingCall {
    txid: i64,
    rx: oneshot::Receiver<AnswerResult>,
    table: Arc<PendingCalls>,
    completed: bool,
}

impl PendingCall {
    /// The transaction id assigned to this call.
    pub fn txid(&self) -> i64 {
        self.txid
    }

    /// Wait for the answer.
    pub async fn wait(mut self) -> AnswerResult {
        let result = (&mut self.rx).await.unwrap_or(Err(XicError::ConnectionClosed));
        self.completed = true;
        result
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.completed && self.table.cancel(self.txid) {
            debug!(target: "xic::pending", txid = self.txid, "call cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::STATUS_EXCEPTIONAL;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use xic_types::{encode, Arguments};

    #[tokio::test]
    async fn test_resolve_normal_answer() {
        let table = Arc::new(PendingCalls::new());
        let call = table.register().unwrap();
        assert_eq!(call.txid(), 1);

        assert!(table.resolve(Answer::normal(1, b"pong".to_vec())));
        assert_eq!(call.wait().await.unwrap(), b"pong".to_vec());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_exceptional_answer() {
        let table = Arc::new(PendingCalls::new());
        let call = table.register().unwrap();

        let failure = Arguments::new()
            .with("exname", "NotFound")
            .with("code", 404i64)
            .with("tag", "")
            .with("message", "no such object");
        let answer = Answer::exceptional(call.txid(), &failure).unwrap();
        assert_eq!(answer.status, STATUS_EXCEPTIONAL);
        table.resolve(answer);

        let err = call.wait().await.unwrap_err();
        let ex = err.exception().unwrap();
        assert_eq!(ex.exname(), "NotFound");
        assert_eq!(ex.code(), 404);
        assert_eq!(ex.message(), "no such object");
    }

    #[tokio::test]
    async fn test_unknown_answer_leaves_others_untouched() {
        let table = Arc::new(PendingCalls::new());
        let first = table.register().unwrap();
        let second = table.register().unwrap();

        assert!(!table.resolve(Answer::normal(99, vec![])));
        assert_eq!(table.len(), 2);

        table.resolve(Answer::normal(second.txid(), vec![2]));
        table.resolve(Answer::normal(first.txid(), vec![1]));
        assert_eq!(first.wait().await.unwrap(), vec![1]);
        assert_eq!(second.wait().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_fail_all_releases_every_caller() {
        let table = Arc::new(PendingCalls::new());
        let calls: Vec<_> = (0..5).map(|_| table.register().unwrap()).collect();

        assert_eq!(table.fail_all(|| XicError::ConnectionClosed), 5);
        for call in calls {
            assert_matches!(call.wait().await, Err(XicError::ConnectionClosed));
        }
        assert!(table.is_empty());
        assert_matches!(table.register(), Err(XicError::ConnectionClosed));
    }

    #[test]
    fn test_dropped_call_unregisters() {
        let table = Arc::new(PendingCalls::new());
        let call = table.register().unwrap();
        let txid = call.txid();
        drop(call);

        assert!(table.is_empty());
        // a late answer is discarded, not delivered
        assert!(!table.resolve(Answer::normal(txid, vec![])));
    }

    #[tokio::test]
    async fn test_malformed_failure_payload() {
        let table = Arc::new(PendingCalls::new());
        let call = table.register().unwrap();
        table.resolve(Answer { txid: call.txid(), status: 3, args: vec![0xFF] });
        assert_matches!(call.wait().await, Err(XicError::Codec(_)));
    }

    #[test]
    fn test_wraparound_skips_zero_negative_and_live_ids() {
        let table = Arc::new(PendingCalls::with_last_txid(i64::MAX - 1));
        let max = table.register().unwrap();
        assert_eq!(max.txid(), i64::MAX);

        let one = table.register().unwrap();
        assert_eq!(one.txid(), 1);
        let two = table.register().unwrap();
        assert_eq!(two.txid(), 2);

        // wrap again while 1 and 2 are still pending
        table.inner.lock().last_txid = i64::MAX;
        let next = table.register().unwrap();
        assert_eq!(next.txid(), 3);
        drop((max, one, two, next));
    }

    proptest! {
        /// Ids handed out to concurrent callers are unique and positive, across wraparound.
        #[test]
        fn prop_txids_unique_and_positive(
            start in prop_oneof![Just(0i64), (i64::MAX - 64)..=i64::MAX],
            count in 1usize..128,
        ) {
            let table = Arc::new(PendingCalls::with_last_txid(start));
            let calls: Vec<_> = (0..count).map(|_| table.register().unwrap()).collect();

            let ids: HashSet<i64> = calls.iter().map(PendingCall::txid).collect();
            prop_assert_eq!(ids.len(), count);
            prop_assert!(ids.iter().all(|id| *id > 0));
            prop_assert_eq!(table.len(), count);
        }
    }

    #[test]
    fn test_failure_payload_encoding_matches_answer() {
        let failure = Arguments::new().with("message", "boom");
        let answer = Answer::exceptional(5, &failure).unwrap();
        assert_eq!(answer.args, encode(&failure).unwrap());
    }
}
