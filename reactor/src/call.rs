//! Outbound calls.

use crate::error::Error;
use crate::types::ConnectionId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub type OutboundCallPtr = Arc<OutboundCall>;

/// Completion callback. Receives `Ok(())` once the call's payload has been
/// fully handed to the wire, or the failure/abort status otherwise.
pub type CallCallback = Box<dyn FnOnce(Result<(), Error>) + Send>;

/// Terminal state of an outbound call. `Queued` means not yet completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Queued,
    Sent,
    Failed(Error),
    Aborted(Error),
}

/// An RPC request bound for a specific remote, queued from an application
/// thread. Completion fires exactly once.
pub struct OutboundCall {
    conn_id: ConnectionId,
    payload: Bytes,
    timeout: Option<Duration>,
    state: Mutex<CallState>,
    callback: Mutex<Option<CallCallback>>,
    deadline: Mutex<Option<Instant>>,
}

impl OutboundCall {
    pub fn new(conn_id: ConnectionId, payload: Bytes, timeout: Option<Duration>) -> OutboundCallPtr {
        Arc::new(OutboundCall {
            conn_id,
            payload,
            timeout,
            state: Mutex::new(CallState::Queued),
            callback: Mutex::new(None),
            deadline: Mutex::new(None),
        })
    }

    pub fn with_callback(
        conn_id: ConnectionId,
        payload: Bytes,
        timeout: Option<Duration>,
        callback: CallCallback,
    ) -> OutboundCallPtr {
        Arc::new(OutboundCall {
            conn_id,
            payload,
            timeout,
            state: Mutex::new(CallState::Queued),
            callback: Mutex::new(Some(callback)),
            deadline: Mutex::new(None),
        })
    }

    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Absolute deadline, stamped when the reactor assigns the call.
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    pub(crate) fn set_deadline(&self, deadline: Instant) {
        *self.deadline.lock() = Some(deadline);
    }

    pub fn state(&self) -> CallState {
        self.state.lock().clone()
    }

    pub fn finished(&self) -> bool {
        !matches!(*self.state.lock(), CallState::Queued)
    }

    /// Terminal failure before the call reached a connection.
    pub fn set_failed(&self, status: Error) {
        self.complete(CallState::Failed(status.clone()), Err(status));
    }

    /// The transfer finished (`Ok`) or was aborted with the given status.
    pub fn transferred(&self, result: Result<(), Error>) {
        match result {
            Ok(()) => self.complete(CallState::Sent, Ok(())),
            Err(status) => self.complete(CallState::Aborted(status.clone()), Err(status)),
        }
    }

    fn complete(&self, new_state: CallState, result: Result<(), Error>) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, CallState::Queued) {
                debug!(
                    conn_id = ?self.conn_id,
                    "ignoring duplicate completion: already {:?}", *state
                );
                return;
            }
            *state = new_state;
        }
        // The callback runs outside the state lock.
        if let Some(callback) = self.callback.lock().take() {
            callback(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserCredentials;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn call_with_counter(counter: Arc<AtomicUsize>) -> OutboundCallPtr {
        let conn_id = ConnectionId::new(
            "127.0.0.1:7100".parse().unwrap(),
            UserCredentials::default(),
        );
        OutboundCall::with_callback(
            conn_id,
            Bytes::from_static(b"payload"),
            Some(Duration::from_secs(1)),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_completion_fires_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let call = call_with_counter(counter.clone());

        call.transferred(Ok(()));
        call.transferred(Err(Error::aborted("late")));
        call.set_failed(Error::network("later still"));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(call.state(), CallState::Sent);
    }

    #[test]
    fn test_set_failed_records_status() {
        let counter = Arc::new(AtomicUsize::new(0));
        let call = call_with_counter(counter.clone());

        call.set_failed(Error::network("connect refused"));
        assert!(call.finished());
        match call.state() {
            CallState::Failed(e) => assert!(e.is_network()),
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deadline_stamped_once_assigned() {
        let counter = Arc::new(AtomicUsize::new(0));
        let call = call_with_counter(counter);
        assert!(call.deadline().is_none());
        let deadline = Instant::now() + Duration::from_secs(5);
        call.set_deadline(deadline);
        assert_eq!(call.deadline(), Some(deadline));
    }
}
