//! Request correlation table.
//!
//! Tracks in-flight requests keyed by a locally generated id so that
//! inbound responses (which echo the client reference) can be matched back
//! to the waiting caller, and so that [`crate::protocol::ProtocolClient`]'s
//! retry-across-reconnect logic can find every request sent before a given
//! failure time that has not yet received any response.
//!
//! Grounded on the pending-message map in the teacher's reliable-delivery
//! layer (now removed from this tree — its backoff policy did not fit the
//! fixed 10s retry-timer this crate uses instead); id format and
//! wait/complete semantics follow `RequestEvent.py` in the original
//! implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::codec::ubjson::InnerRequest;
use crate::error::QapiError;

const ID_PREFIX_LEN: usize = 6;
const ID_PREFIX_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn random_prefix() -> String {
    let mut rng = rand::rng();
    (0..ID_PREFIX_LEN)
        .map(|_| {
            let idx = rng.random_range(0..ID_PREFIX_ALPHABET.len());
            ID_PREFIX_ALPHABET[idx] as char
        })
        .collect()
}

/// Tri-state outcome of a request: unresolved, succeeded, or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Success,
    Failure,
}

struct Inner {
    outcome: Outcome,
    payload: Option<serde_json::Value>,
    exception: Option<QapiError>,
    /// Raw messages received for this request, in arrival order.
    messages: Vec<serde_json::Value>,
    send_time: Option<Instant>,
    complete_hook: Option<Box<dyn FnOnce() + Send>>,
}

/// A single in-flight (or completed) request.
///
/// Mirrors `RequestEvent.py`: a condvar-backed completion signal plus the
/// bookkeeping needed to retransmit the request unchanged (other than its
/// sequence number) if the transport drops it before any response arrives.
pub struct RequestEvent {
    pub id: String,
    pub is_crud: bool,
    /// Outbound inner message, retained so it can be re-encoded with a new
    /// sequence number on retry.
    pub inner_msg_out: InnerRequest,
    state: Mutex<Inner>,
    condvar: Condvar,
}

impl RequestEvent {
    fn new(id: String, inner_msg_out: InnerRequest, is_crud: bool) -> Self {
        Self {
            id,
            is_crud,
            inner_msg_out,
            state: Mutex::new(Inner {
                outcome: Outcome::Pending,
                payload: None,
                exception: None,
                messages: Vec::new(),
                send_time: None,
                complete_hook: None,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Marks the request as sent at the given time, for retry-window
    /// bookkeeping. Idempotent across retries (called again on resend).
    pub fn mark_sent(&self, at: Instant) {
        self.state.lock().expect("request state mutex poisoned").send_time = Some(at);
    }

    /// `true` if this request was sent before `before` and has not yet
    /// received any message from the container — the exact condition
    /// `RequestEvent._sent_without_response` checks, used to select
    /// requests for retry-across-reconnect.
    pub fn sent_without_response_before(&self, before: Instant) -> bool {
        let state = self.state.lock().expect("request state mutex poisoned");
        state.messages.is_empty() && state.send_time.is_some_and(|t| t < before)
    }

    /// Records an inbound message associated with this request (does not
    /// by itself mark the request complete — callers decide that based on
    /// the message's event code).
    pub fn record_message(&self, message: serde_json::Value) {
        self.state
            .lock()
            .expect("request state mutex poisoned")
            .messages
            .push(message);
    }

    /// Marks the request successfully complete with the given payload and
    /// wakes any waiters.
    pub fn complete_success(&self, payload: Option<serde_json::Value>) {
        self.finish(Outcome::Success, payload, None);
    }

    /// Marks the request failed with the given error and wakes any
    /// waiters.
    pub fn complete_failure(&self, error: QapiError) {
        self.finish(Outcome::Failure, None, Some(error));
    }

    fn finish(&self, outcome: Outcome, payload: Option<serde_json::Value>, error: Option<QapiError>) {
        let hook = {
            let mut state = self.state.lock().expect("request state mutex poisoned");
            if state.outcome != Outcome::Pending {
                return;
            }
            state.outcome = outcome;
            state.payload = payload;
            state.exception = error;
            state.complete_hook.take()
        };
        self.condvar.notify_all();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Registers a completion hook. Runs immediately (on the calling
    /// thread) if the request has already finished, otherwise runs on
    /// whichever thread later calls `finish`.
    pub fn run_on_completion<F: FnOnce() + Send + 'static>(&self, hook: F) {
        let mut state = self.state.lock().expect("request state mutex poisoned");
        if state.outcome == Outcome::Pending {
            state.complete_hook = Some(Box::new(hook));
        } else {
            drop(state);
            hook();
        }
    }

    /// Non-blocking check. Returns `Ok(true)` if finished successfully,
    /// `Ok(false)` if still pending, `Err` if finished with an error.
    pub fn is_set(&self) -> Result<bool, QapiError> {
        let state = self.state.lock().expect("request state mutex poisoned");
        match state.outcome {
            Outcome::Pending => Ok(false),
            Outcome::Success => Ok(true),
            Outcome::Failure => Err(state
                .exception
                .clone()
                .unwrap_or(QapiError::InternalError)),
        }
    }

    /// Blocks until the request finishes or `timeout` elapses.
    ///
    /// Returns `Ok(true)` once finished successfully, `Ok(false)` on
    /// timeout (the request remains pending — `SyncTimeout` is the
    /// caller's concern, not this method's), `Err` if finished with an
    /// error.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, QapiError> {
        let mut state = self.state.lock().expect("request state mutex poisoned");
        let deadline = timeout.map(|t| Instant::now() + t);
        while state.outcome == Outcome::Pending {
            match deadline {
                None => {
                    state = self.condvar.wait(state).expect("request state mutex poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    let (guard, timeout_result) = self
                        .condvar
                        .wait_timeout(state, deadline - now)
                        .expect("request state mutex poisoned");
                    state = guard;
                    if timeout_result.timed_out() && state.outcome == Outcome::Pending {
                        return Ok(false);
                    }
                }
            }
        }
        match state.outcome {
            Outcome::Success => Ok(true),
            Outcome::Failure => Err(state
                .exception
                .clone()
                .unwrap_or(QapiError::InternalError)),
            Outcome::Pending => unreachable!("loop only exits once outcome is set"),
        }
    }

    #[must_use]
    pub fn payload(&self) -> Option<serde_json::Value> {
        self.state.lock().expect("request state mutex poisoned").payload.clone()
    }
}

/// Concurrent table of in-flight [`RequestEvent`]s, keyed by request id.
pub struct RequestTable {
    requests: Mutex<HashMap<String, Arc<RequestEvent>>>,
    counter: AtomicU64,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
        }
    }

    /// Creates and registers a new request, generating a unique id of the
    /// form `"<6-char prefix><counter>"`. On the rare occasion the prefix
    /// collides with an in-flight request's prefix, a new prefix is drawn
    /// and the counter restarts from 1 for that prefix, exactly as the
    /// original implementation does.
    pub fn new_request(&self, inner_msg_out: InnerRequest, is_crud: bool) -> Arc<RequestEvent> {
        let mut requests = self.requests.lock().expect("request table mutex poisoned");
        loop {
            let prefix = random_prefix();
            if requests.keys().any(|k| k.starts_with(&prefix)) {
                continue;
            }
            let counter = self.counter.fetch_add(1, Ordering::Relaxed);
            let id = format!("{prefix}{counter}");
            let event = Arc::new(RequestEvent::new(id.clone(), inner_msg_out, is_crud));
            requests.insert(id, Arc::clone(&event));
            return event;
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<RequestEvent>> {
        self.requests.lock().expect("request table mutex poisoned").get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<RequestEvent>> {
        self.requests.lock().expect("request table mutex poisoned").remove(id)
    }

    /// Returns every tracked request sent before `before` that has not yet
    /// received any message — the candidate set for retry-across-reconnect
    /// (spec.md §4.D.4).
    #[must_use]
    pub fn pending_retry_candidates(&self, before: Instant) -> Vec<Arc<RequestEvent>> {
        self.requests
            .lock()
            .expect("request table mutex poisoned")
            .values()
            .filter(|req| req.sent_without_response_before(before))
            .cloned()
            .collect()
    }

    /// Fails every tracked request with `LinkShutdown` and drains the
    /// table, as required on full client shutdown (spec.md §7).
    pub fn fail_all_with_shutdown(&self) {
        let mut requests = self.requests.lock().expect("request table mutex poisoned");
        for req in requests.values() {
            req.complete_failure(QapiError::LinkShutdown);
        }
        requests.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.lock().expect("request table mutex poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ACTION_CREATE, RESOURCE_FEED};

    fn sample_request() -> InnerRequest {
        InnerRequest {
            r: RESOURCE_FEED,
            t: ACTION_CREATE,
            c: None,
            a: None,
            p: None,
            g: None,
        }
    }

    #[test]
    fn test_new_request_ids_are_unique() {
        let table = RequestTable::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..200 {
            let req = table.new_request(sample_request(), false);
            assert!(ids.insert(req.id.clone()), "duplicate request id generated");
        }
    }

    #[test]
    fn test_wait_returns_true_on_success() {
        let table = RequestTable::new();
        let req = table.new_request(sample_request(), false);
        req.complete_success(Some(serde_json::json!({"ok": true})));
        assert_eq!(req.wait(Some(Duration::from_millis(10))), Ok(true));
    }

    #[test]
    fn test_wait_returns_err_on_failure() {
        let table = RequestTable::new();
        let req = table.new_request(sample_request(), false);
        req.complete_failure(QapiError::NotAllowed);
        assert!(matches!(
            req.wait(Some(Duration::from_millis(10))),
            Err(QapiError::NotAllowed)
        ));
    }

    #[test]
    fn test_wait_times_out_while_pending() {
        let table = RequestTable::new();
        let req = table.new_request(sample_request(), false);
        assert_eq!(req.wait(Some(Duration::from_millis(20))), Ok(false));
        assert!(table.get(&req.id).is_some());
    }

    #[test]
    fn test_wait_unblocks_from_another_thread() {
        let table = Arc::new(RequestTable::new());
        let req = table.new_request(sample_request(), false);
        let req2 = Arc::clone(&req);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            req2.complete_success(None);
        });
        assert_eq!(req.wait(None), Ok(true));
        handle.join().unwrap();
    }

    #[test]
    fn test_retry_candidates_excludes_requests_with_responses() {
        let table = RequestTable::new();
        let req_no_response = table.new_request(sample_request(), false);
        let req_with_response = table.new_request(sample_request(), false);

        let t0 = Instant::now();
        req_no_response.mark_sent(t0);
        req_with_response.mark_sent(t0);
        req_with_response.record_message(serde_json::json!({"t": 1}));

        std::thread::sleep(Duration::from_millis(5));
        let cutoff = Instant::now();
        let candidates = table.pending_retry_candidates(cutoff);
        let ids: Vec<_> = candidates.iter().map(|r| r.id.clone()).collect();
        assert!(ids.contains(&req_no_response.id));
        assert!(!ids.contains(&req_with_response.id));
    }

    #[test]
    fn test_fail_all_with_shutdown_clears_table() {
        let table = RequestTable::new();
        let req = table.new_request(sample_request(), false);
        table.fail_all_with_shutdown();
        assert!(table.is_empty());
        assert!(matches!(
            req.wait(Some(Duration::from_millis(10))),
            Err(QapiError::LinkShutdown)
        ));
    }

    #[test]
    fn test_completion_hook_runs_immediately_if_already_done() {
        let table = RequestTable::new();
        let req = table.new_request(sample_request(), false);
        req.complete_success(None);

        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        req.run_on_completion(move || flag2.store(true, Ordering::SeqCst));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_completion_hook_runs_on_finish() {
        let table = RequestTable::new();
        let req = table.new_request(sample_request(), false);

        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        req.run_on_completion(move || flag2.store(true, Ordering::SeqCst));
        assert!(!flag.load(Ordering::SeqCst));
        req.complete_success(None);
        assert!(flag.load(Ordering::SeqCst));
    }
}
