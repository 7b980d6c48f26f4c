//! Protocol client: wire formation, sequencing, retry, and dispatch.
//!
//! Owns a [`crate::link::Link`], the [`crate::request_table::RequestTable`],
//! a [`throttle::ThrottleChain`], and the general/CRUD
//! [`callbacks::CallbackPools`]. Outbound requests are signed and framed by
//! [`crate::codec`], throttled, and handed to the link; inbound frames are
//! decoded, sequence- and HMAC-validated, and either matched back to a
//! pending [`crate::request_table::RequestEvent`] (solicited) or dispatched
//! to a callback pool (unsolicited: feed data, control requests,
//! subscriptions). Algorithm shape follows `Client.py`; thread-naming and
//! stop-event-polling follow the teacher's now-removed
//! `broker/connection.rs`.

pub mod callbacks;
pub mod throttle;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::codec::ubjson::{InnerRequest, InnerResponse};
use crate::codec::{self};
use crate::config::Config;
use crate::constants::{
    self, EVENT_COMPLETE, EVENT_CONTROLREQ, EVENT_CREATED, EVENT_DELETED, EVENT_DUPLICATED,
    EVENT_FAILED, EVENT_FEEDDATA, EVENT_PROGRESS, EVENT_RECENTDATA, EVENT_REASSIGNED,
    EVENT_RENAMED, EVENT_SUBSCRIBED, RESOURCE_PING, SEQ_MODULUS, SEQ_WARN_WINDOW,
};
use crate::error::QapiError;
use crate::link::{BrokerTransport, Link, LinkEvent, LinkState};
use crate::request_table::{RequestEvent, RequestTable};
use throttle::ThrottleChain;

/// Unsolicited event delivered to user callbacks (not tied to a pending
/// request).
#[derive(Debug, Clone)]
pub enum UnsolicitedEvent {
    FeedData { lid: Option<String>, payload: serde_json::Value },
    ControlRequest { lid: Option<String>, payload: serde_json::Value },
    Subscribed { payload: serde_json::Value },
    RecentData { payload: serde_json::Value },
    Created { payload: serde_json::Value },
    Deleted { payload: serde_json::Value },
    Renamed { payload: serde_json::Value },
    Reassigned { payload: serde_json::Value },
}

/// A user-supplied feed-data or control-request handler, boxed so it can be
/// stored keyed by point/entity and invoked from a callback pool thread.
pub type PointCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Pending subscription/control bindings and the installed per-point/
/// per-entity callbacks they resolve into once the container confirms
/// creation (spec.md §4.D.6/§4.D.7). `pending_subs`/`pending_controls` are
/// keyed by the creation request id and removed on both success and
/// failure; `feed` and `control` hold the callbacks actually fired for
/// inbound FEEDDATA/CONTROLREQ once installed.
#[derive(Default)]
struct CallbackRegistry {
    pending_subs: Mutex<HashMap<String, (String, PointCallback)>>,
    pending_controls: Mutex<HashMap<String, (String, String, PointCallback)>>,
    feed: Mutex<HashMap<String, PointCallback>>,
    control: Mutex<HashMap<String, HashMap<String, PointCallback>>>,
}

impl CallbackRegistry {
    fn clear_pending(&self, req_id: &str) {
        self.pending_subs.lock().expect("pending_subs mutex poisoned").remove(req_id);
        self.pending_controls.lock().expect("pending_controls mutex poisoned").remove(req_id);
    }
}

struct SeqState {
    last_seen: Option<u64>,
}

impl SeqState {
    fn validate_and_advance(&mut self, seq: u64) {
        if let Some(last) = self.last_seen {
            let diff = seq.wrapping_sub(last) % SEQ_MODULUS;
            if diff == 0 {
                // Equality: ambiguous upstream; warn and continue (spec.md §9).
                log::warn!("received repeated sequence number {seq}");
            } else if diff > SEQ_WARN_WINDOW {
                log::warn!("sequence number jumped by {diff} (last {last}, now {seq})");
            }
        }
        self.last_seen = Some(seq);
    }
}

struct RetryTimer {
    mutex: Mutex<Option<Instant>>,
    condvar: Condvar,
    stop: AtomicBool,
}

/// Everything the protocol client's background threads need, shared via
/// `Arc` rather than threaded through closures one field at a time.
struct Shared<T: BrokerTransport + 'static> {
    config: Config,
    requests: RequestTable,
    seq_counter: AtomicU64,
    seq_state: Mutex<SeqState>,
    callbacks: callbacks::CallbackPools,
    point_callbacks: CallbackRegistry,
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    unsolicited_tx: mpsc::Sender<UnsolicitedEvent>,
    retry_timer: RetryTimer,
    last_failure_at: Mutex<Option<Instant>>,
    stop: AtomicBool,
    throttle: Mutex<ThrottleChain>,
    throttle_stop: Arc<AtomicBool>,
    _transport: std::marker::PhantomData<T>,
}

/// Top-level client mediating requests/responses and events with the
/// container.
pub struct ProtocolClient<T: BrokerTransport + 'static> {
    shared: Arc<Shared<T>>,
    link: Option<Link<T>>,
    inbound_handle: Option<JoinHandle<()>>,
    retry_handle: Option<JoinHandle<()>>,
    pub unsolicited: mpsc::Receiver<UnsolicitedEvent>,
}

impl<T: BrokerTransport + 'static> ProtocolClient<T> {
    #[must_use]
    pub fn new(config: Config, transport: T) -> Self {
        let (unsolicited_tx, unsolicited_rx) = mpsc::channel();
        let throttle_stop = Arc::new(AtomicBool::new(false));
        let throttle = ThrottleChain::new(config.throttle_stages(), Arc::clone(&throttle_stop));
        let shared = Arc::new(Shared {
            seq_counter: AtomicU64::new(0),
            seq_state: Mutex::new(SeqState { last_seen: None }),
            callbacks: callbacks::CallbackPools::start(),
            point_callbacks: CallbackRegistry::default(),
            outbound: Mutex::new(None),
            unsolicited_tx,
            retry_timer: RetryTimer {
                mutex: Mutex::new(None),
                condvar: Condvar::new(),
                stop: AtomicBool::new(false),
            },
            last_failure_at: Mutex::new(None),
            stop: AtomicBool::new(false),
            throttle: Mutex::new(throttle),
            throttle_stop,
            requests: RequestTable::new(),
            config,
            _transport: std::marker::PhantomData,
        });

        let link = Link::new(transport, shared.config.conn_retry_delay());

        Self {
            shared,
            link: Some(link),
            inbound_handle: None,
            retry_handle: None,
            unsolicited: unsolicited_rx,
        }
    }

    /// Starts the link, the inbound-dispatch thread, and the
    /// retry-across-reconnect timer thread, then performs the PING
    /// handshake (spec.md §4.D.9).
    pub fn start(&mut self) -> Result<(), QapiError> {
        let (events_tx, events_rx) = mpsc::channel();
        let outbound = self
            .link
            .as_mut()
            .expect("link not yet started")
            .start(events_tx);
        *self.shared.outbound.lock().expect("outbound mutex poisoned") = Some(outbound);

        self.inbound_handle = Some(self.spawn_inbound_thread(events_rx));
        self.retry_handle = Some(self.spawn_retry_timer_thread());

        self.handshake()
    }

    fn handshake(&self) -> Result<(), QapiError> {
        let req = InnerRequest {
            r: RESOURCE_PING,
            t: constants::ACTION_LIST,
            c: None,
            a: None,
            p: None,
            g: None,
        };
        let event = self.send_request(req, false)?;
        match event.wait(Some(self.shared.config.socket_timeout())) {
            Ok(true) => Ok(()),
            Ok(false) => Err(QapiError::SyncTimeout),
            Err(e) => {
                if self.shared.config.startup_ignore_exc {
                    log::warn!("startup handshake failed, ignoring per config: {e}");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Builds, signs, and sends a request, registering it in the request
    /// table. Returns the tracked [`RequestEvent`] immediately; callers
    /// `wait()` on it for the result.
    pub fn send_request(
        &self,
        inner: InnerRequest,
        is_crud: bool,
    ) -> Result<Arc<RequestEvent>, QapiError> {
        if self.shared.stop.load(Ordering::Relaxed) {
            return Err(QapiError::LinkShutdown);
        }
        let event = self.shared.requests.new_request(inner.clone(), is_crud);
        self.encode_and_send(&event)?;
        Ok(event)
    }

    /// Sends a feed-subscription creation request, remembering `callback` as
    /// pending until the container's CREATED/DUPLICATED response names the
    /// resulting point id, at which point it is installed as that point's
    /// feed-data handler (spec.md §4.D.6).
    pub fn subscribe_feed(
        &self,
        inner: InnerRequest,
        point_id: &str,
        callback: PointCallback,
    ) -> Result<Arc<RequestEvent>, QapiError> {
        let event = self.send_request(inner, true)?;
        self.shared
            .point_callbacks
            .pending_subs
            .lock()
            .expect("pending_subs mutex poisoned")
            .insert(event.id.clone(), (point_id.to_string(), callback));
        Ok(event)
    }

    /// Sends a control-subscription creation request, remembering `callback`
    /// as pending until the container confirms it, at which point it is
    /// installed under `control-callbacks[entity_lid][lid]`.
    pub fn subscribe_control(
        &self,
        inner: InnerRequest,
        entity_lid: &str,
        lid: &str,
        callback: PointCallback,
    ) -> Result<Arc<RequestEvent>, QapiError> {
        let event = self.send_request(inner, true)?;
        self.shared
            .point_callbacks
            .pending_controls
            .lock()
            .expect("pending_controls mutex poisoned")
            .insert(event.id.clone(), (entity_lid.to_string(), lid.to_string(), callback));
        Ok(event)
    }

    fn encode_and_send(&self, event: &Arc<RequestEvent>) -> Result<(), QapiError> {
        let mut req = event.inner_msg_out.clone();
        // the client reference lets us correlate the response back to this
        // request id without needing a separate lookup table.
        req.c = Some(event.id.clone());
        let inner_bytes = crate::codec::ubjson::encode_request(&req)
            .map_err(|e| QapiError::Malformed(e.to_string()))?;

        let seq = self.shared.seq_counter.fetch_add(1, Ordering::Relaxed) % SEQ_MODULUS;
        let token = self
            .shared
            .config
            .token_bytes()
            .map_err(|e| QapiError::ValidationError(e.to_string()))?;
        let frame = codec::encode(&token, seq, &inner_bytes, self.shared.config.max_encoded_length)
            .map_err(|e| QapiError::Malformed(e.to_string()))?;

        self.shared.throttle.lock().expect("throttle mutex poisoned").throttle();

        event.mark_sent(Instant::now());
        let outbound = self.shared.outbound.lock().expect("outbound mutex poisoned");
        match outbound.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|e| QapiError::LinkError(e.to_string())),
            None => Err(QapiError::LinkShutdown),
        }
    }

    fn spawn_inbound_thread(&self, events_rx: mpsc::Receiver<LinkEvent>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("protocol-inbound".to_owned())
            .spawn(move || loop {
                if shared.stop.load(Ordering::Relaxed) {
                    break;
                }
                match events_rx.recv_timeout(constants::STOP_POLL_INTERVAL) {
                    Ok(LinkEvent::Frame(frame)) => {
                        if let Err(e) = dispatch_frame(&shared, &frame) {
                            log::debug!("dropping undecodable frame: {e}");
                        }
                    }
                    Ok(LinkEvent::StateChanged(LinkState::Disconnected)) => {
                        *shared.last_failure_at.lock().expect("last_failure_at mutex poisoned") =
                            Some(Instant::now());
                    }
                    Ok(LinkEvent::StateChanged(LinkState::Ready)) => {
                        schedule_retry_timer(&shared);
                    }
                    Ok(LinkEvent::StateChanged(LinkState::Connecting)) => {}
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("failed to spawn protocol-inbound thread")
    }

    fn spawn_retry_timer_thread(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("protocol-retry-timer".to_owned())
            .spawn(move || loop {
                let mut guard = shared.retry_timer.mutex.lock().expect("retry timer mutex poisoned");
                loop {
                    if shared.retry_timer.stop.load(Ordering::Relaxed) {
                        return;
                    }
                    match *guard {
                        None => {
                            let (g, _) = shared
                                .retry_timer
                                .condvar
                                .wait_timeout(guard, constants::STOP_POLL_INTERVAL)
                                .expect("retry timer mutex poisoned");
                            guard = g;
                        }
                        Some(fire_at) => {
                            let now = Instant::now();
                            if now >= fire_at {
                                let failure_time = fire_at - constants::RETRY_TIMER_DELAY;
                                *guard = None;
                                drop(guard);
                                run_retry(&shared, failure_time);
                                break;
                            }
                            let (g, _) = shared
                                .retry_timer
                                .condvar
                                .wait_timeout(guard, fire_at - now)
                                .expect("retry timer mutex poisoned");
                            guard = g;
                        }
                    }
                }
            })
            .expect("failed to spawn protocol-retry-timer thread")
    }

    /// Configured socket timeout, used by callers (e.g. the resource
    /// model's remote wrappers) to bound how long they wait on a request.
    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        self.shared.config.socket_timeout()
    }

    /// Fails all pending requests with `LinkShutdown`, stops callback
    /// pools and the link. Always completes promptly (spec.md §5/§7).
    pub fn shutdown(mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.retry_timer.stop.store(true, Ordering::Relaxed);
        self.shared.retry_timer.condvar.notify_all();
        self.shared.throttle_stop.store(true, Ordering::Relaxed);
        self.shared.requests.fail_all_with_shutdown();

        if let Some(h) = self.inbound_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.retry_handle.take() {
            let _ = h.join();
        }
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
    }
}

fn schedule_retry_timer<T: BrokerTransport + 'static>(shared: &Arc<Shared<T>>) {
    let failure_time = shared
        .last_failure_at
        .lock()
        .expect("last_failure_at mutex poisoned");
    if failure_time.is_none() {
        return;
    }
    let mut timer = shared.retry_timer.mutex.lock().expect("retry timer mutex poisoned");
    *timer = Some(Instant::now() + constants::RETRY_TIMER_DELAY);
    shared.retry_timer.condvar.notify_all();
}

fn run_retry<T: BrokerTransport + 'static>(shared: &Arc<Shared<T>>, failure_time: Instant) {
    // Abort early if a newer failure happened after this one was scheduled
    // (spec.md §4.D.4): a fresher `last_failure_at` means a new retry timer
    // has already been (or will be) scheduled to supersede this run.
    let current_failure = *shared
        .last_failure_at
        .lock()
        .expect("last_failure_at mutex poisoned");
    if current_failure.is_some_and(|t| t > failure_time) {
        return;
    }

    let candidates = shared.requests.pending_retry_candidates(failure_time);
    if candidates.is_empty() {
        return;
    }
    log::warn!("retrying {} request(s) after reconnect", candidates.len());
    for event in candidates {
        let mut req = event.inner_msg_out.clone();
        req.c = Some(event.id.clone());
        let Ok(inner_bytes) = crate::codec::ubjson::encode_request(&req) else {
            continue;
        };
        let seq = shared.seq_counter.fetch_add(1, Ordering::Relaxed) % SEQ_MODULUS;
        let Ok(token) = shared.config.token_bytes() else {
            continue;
        };
        let Ok(frame) = codec::encode(&token, seq, &inner_bytes, shared.config.max_encoded_length)
        else {
            continue;
        };
        shared.throttle.lock().expect("throttle mutex poisoned").throttle();
        event.mark_sent(Instant::now());
        let outbound = shared.outbound.lock().expect("outbound mutex poisoned");
        if let Some(tx) = outbound.as_ref() {
            let _ = tx.send(frame);
        }
    }
}

/// Handles a `FAILED`/`LOW_SEQNUM` response (spec.md §4.D.6/scenario S2):
/// resets the sequence counter to the container-supplied value and
/// re-publishes the request's original inner message, which consumes
/// exactly that value as its sequence number.
fn low_seqnum_resync<T: BrokerTransport + 'static>(
    shared: &Arc<Shared<T>>,
    event: &Arc<RequestEvent>,
    new_seq: u64,
) {
    shared.seq_counter.store(new_seq % SEQ_MODULUS, Ordering::Relaxed);

    let mut req = event.inner_msg_out.clone();
    req.c = Some(event.id.clone());
    let Ok(inner_bytes) = crate::codec::ubjson::encode_request(&req) else {
        log::error!("failed to re-encode request {} during low-seqnum resync", event.id);
        return;
    };
    let seq = shared.seq_counter.fetch_add(1, Ordering::Relaxed) % SEQ_MODULUS;
    let Ok(token) = shared.config.token_bytes() else {
        return;
    };
    let Ok(frame) = codec::encode(&token, seq, &inner_bytes, shared.config.max_encoded_length) else {
        return;
    };
    shared.throttle.lock().expect("throttle mutex poisoned").throttle();
    event.mark_sent(Instant::now());
    let outbound = shared.outbound.lock().expect("outbound mutex poisoned");
    if let Some(tx) = outbound.as_ref() {
        let _ = tx.send(frame);
    }
}

fn dispatch_frame<T: BrokerTransport + 'static>(
    shared: &Arc<Shared<T>>,
    frame: &[u8],
) -> Result<(), QapiError> {
    let token = shared
        .config
        .token_bytes()
        .map_err(|e| QapiError::ValidationError(e.to_string()))?;
    let max_size = constants::DEFAULT_MAX_DECOMPRESSED_SIZE;
    let decoded = codec::decode(&token, frame, max_size).map_err(|e| match e {
        codec::CodecError::Oversize { limit } => QapiError::Oversize { limit },
        other => QapiError::Malformed(other.to_string()),
    })?;

    shared
        .seq_state
        .lock()
        .expect("seq state mutex poisoned")
        .validate_and_advance(decoded.seq);

    let response = crate::codec::ubjson::decode_response(&decoded.inner)
        .map_err(|e| QapiError::Malformed(e.to_string()))?;

    if let Some(req_id) = response.c.clone() {
        if let Some(event) = shared.requests.get(&req_id) {
            handle_solicited(shared, &event, &response, &req_id);
            return Ok(());
        }
    }
    handle_unsolicited(shared, response);
    Ok(())
}

fn handle_solicited<T: BrokerTransport + 'static>(
    shared: &Arc<Shared<T>>,
    event: &Arc<RequestEvent>,
    response: &InnerResponse,
    req_id: &str,
) {
    let req_id = req_id.to_string();
    event.record_message(serde_json::to_value(response).unwrap_or_default());
    match response.t {
        EVENT_COMPLETE | EVENT_CREATED | EVENT_DUPLICATED | EVENT_DELETED => {
            if matches!(response.t, EVENT_CREATED | EVENT_DUPLICATED) {
                install_pending_callback(shared, &req_id, response.p.as_ref());
            }
            // Terminal: the request is done with the table (spec.md §3
            // lifecycle, §4.D.6) regardless of which of these four types
            // closed it out.
            shared.requests.remove(&req_id);
            if matches!(response.t, EVENT_CREATED | EVENT_DELETED) {
                // DUPLICATED is folded into completion rather than also
                // fired as its own unsolicited event (spec.md §4.D.6).
                handle_unsolicited(shared, response.clone());
            }
            let event = Arc::clone(event);
            let payload = response.p.clone();
            let pool = if event.is_crud {
                &shared.callbacks.crud
            } else {
                &shared.callbacks.general
            };
            pool.submit(callbacks::guarded("request-complete", move || {
                event.complete_success(payload);
            }));
        }
        EVENT_RENAMED | EVENT_REASSIGNED => {
            // Solicited RENAMED/REASSIGNED additionally fire the matching
            // unsolicited callback (spec.md §4.D.6), but are not in the
            // terminal set: the request stays pending for its COMPLETE.
            handle_unsolicited(shared, response.clone());
        }
        EVENT_RECENTDATA => {
            dispatch_recent_data(shared, response.p.as_ref());
        }
        EVENT_FAILED => {
            let code = response
                .p
                .as_ref()
                .and_then(|p| p.get("code"))
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(constants::FAILURE_INTERNAL);
            let message = response
                .p
                .as_ref()
                .and_then(|p| p.get("message"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if code == constants::FAILURE_LOW_SEQNUM {
                let Some(new_seq) = message.as_deref().and_then(|m| m.parse::<u64>().ok()) else {
                    log::warn!("request {req_id} rejected for low seqnum but message was not a valid integer");
                    return;
                };
                log::warn!("request {req_id} rejected for low seqnum; resyncing to {new_seq} and resending");
                low_seqnum_resync(shared, event, new_seq);
                return;
            }
            shared.point_callbacks.clear_pending(&req_id);
            shared.requests.remove(&req_id);
            let detail = message;
            let error = QapiError::from_failure_code(code, detail);
            let event = Arc::clone(event);
            let pool = if event.is_crud {
                &shared.callbacks.crud
            } else {
                &shared.callbacks.general
            };
            pool.submit(callbacks::guarded("request-failed", move || {
                event.complete_failure(error);
            }));
        }
        EVENT_PROGRESS => {
            // progress updates do not complete the request; nothing to
            // dispatch beyond having recorded the message above.
        }
        _ => {
            log::debug!("unexpected solicited event type {} for request {req_id}", response.t);
        }
    }
}

/// Extracts raw bytes out of a decoded inner-message value: a JSON array of
/// byte values (how the rmp-serde-backed codec represents a MessagePack
/// `Bin` payload once decoded into a generic `serde_json::Value`) or,
/// failing that, a string's UTF-8 bytes.
fn bytes_from_json(value: &serde_json::Value) -> Option<Vec<u8>> {
    match value {
        serde_json::Value::Array(items) => {
            items.iter().map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok())).collect()
        }
        serde_json::Value::String(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Decodes each recent-data sample (`data`+`mime`+`time`) from a
/// `RECENTDATA` response's `samples` array using the same auto-decode rule
/// as inbound feed data (spec.md §4.E), and fires the recent-data callback
/// for each one (spec.md §4.D.6).
fn dispatch_recent_data<T: BrokerTransport + 'static>(
    shared: &Arc<Shared<T>>,
    payload: Option<&serde_json::Value>,
) {
    let Some(samples) = payload.and_then(|p| p.get("samples")).and_then(serde_json::Value::as_array) else {
        return;
    };
    for sample in samples {
        let mime = sample.get("mime").and_then(|v| v.as_str()).unwrap_or("application/octet-stream");
        let data_bytes = sample.get("data").and_then(bytes_from_json).unwrap_or_default();
        let (data, mime) = match crate::resource::remote::auto_decode(mime, &data_bytes) {
            crate::resource::remote::DecodedShare::Mapping(value) => (value, None),
            crate::resource::remote::DecodedShare::Text(text) => (serde_json::Value::String(text), None),
            crate::resource::remote::DecodedShare::Raw { data, mime } => {
                (serde_json::Value::Array(data.into_iter().map(serde_json::Value::from).collect()), Some(mime))
            }
        };
        let mut decoded_sample = serde_json::Map::new();
        decoded_sample.insert("data".to_string(), data);
        decoded_sample.insert("mime".to_string(), mime.map_or(serde_json::Value::Null, serde_json::Value::String));
        if let Some(time) = sample.get("time").cloned() {
            decoded_sample.insert("time".to_string(), time);
        }
        let event = UnsolicitedEvent::RecentData { payload: serde_json::Value::Object(decoded_sample) };
        let _ = shared.unsolicited_tx.send(event);
    }
}

/// Resolves a pending subscription/control binding against a CREATED or
/// DUPLICATED response's payload (spec.md §4.D.6): a subscription payload
/// installs its callback under `feed[point_id]` (warning if the point
/// turned out to be a control rather than a feed), a control payload
/// installs its callback under `control[entity_lid][lid]`.
fn install_pending_callback<T: BrokerTransport + 'static>(
    shared: &Arc<Shared<T>>,
    req_id: &str,
    payload: Option<&serde_json::Value>,
) {
    let Some(payload) = payload else { return };
    let resource = payload.get("r").and_then(serde_json::Value::as_i64);
    match resource {
        Some(constants::RESOURCE_SUBSCRIPTION) => {
            let pending = shared
                .point_callbacks
                .pending_subs
                .lock()
                .expect("pending_subs mutex poisoned")
                .remove(req_id);
            let Some((point_id, callback)) = pending else { return };
            let point_type = payload.get("pointType").and_then(serde_json::Value::as_i64);
            if point_type == Some(constants::RESOURCE_FEED) {
                shared.point_callbacks.feed.lock().expect("feed callbacks mutex poisoned").insert(point_id, callback);
            } else {
                log::warn!("subscription intended for a feed is actually a control: {point_id}");
            }
        }
        Some(constants::RESOURCE_CONTROL) => {
            let pending = shared
                .point_callbacks
                .pending_controls
                .lock()
                .expect("pending_controls mutex poisoned")
                .remove(req_id);
            let Some((entity_lid, lid, callback)) = pending else { return };
            shared
                .point_callbacks
                .control
                .lock()
                .expect("control callbacks mutex poisoned")
                .entry(entity_lid)
                .or_default()
                .insert(lid, callback);
        }
        _ => {}
    }
}

/// Submits a point-specific feed-data/control-request callback to the
/// general pool, if one is installed for this point/control. The general
/// catch-all (`UnsolicitedEvent`) is always sent regardless.
fn fire_point_callback<T: BrokerTransport + 'static>(
    shared: &Arc<Shared<T>>,
    callback: Option<PointCallback>,
    payload: serde_json::Value,
) {
    let Some(callback) = callback else { return };
    shared.callbacks.general.submit(Box::new(move || {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(payload)));
        if outcome.is_err() {
            log::warn!("point-specific callback panicked; continuing");
        }
    }));
}

fn handle_unsolicited<T: BrokerTransport + 'static>(shared: &Arc<Shared<T>>, response: InnerResponse) {
    let lid = response
        .p
        .as_ref()
        .and_then(|p| p.get("lid"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let event = match response.t {
        EVENT_FEEDDATA => {
            let payload = response.p.clone().unwrap_or_default();
            if let Some(pid) = payload.get("pid").and_then(|v| v.as_str()) {
                fire_point_callback(shared, shared.point_callbacks.feed.lock().expect("feed callbacks mutex poisoned").get(pid).cloned(), payload.clone());
            }
            UnsolicitedEvent::FeedData { lid, payload }
        }
        EVENT_CONTROLREQ => {
            let payload = response.p.clone().unwrap_or_default();
            let keyed = payload
                .get("entityLid")
                .and_then(|v| v.as_str())
                .zip(payload.get("lid").and_then(|v| v.as_str()))
                .and_then(|(entity_lid, lid)| {
                    shared
                        .point_callbacks
                        .control
                        .lock()
                        .expect("control callbacks mutex poisoned")
                        .get(entity_lid)
                        .and_then(|by_pid| by_pid.get(lid))
                        .cloned()
                });
            fire_point_callback(shared, keyed, payload.clone());
            UnsolicitedEvent::ControlRequest { lid, payload }
        }
        EVENT_SUBSCRIBED => UnsolicitedEvent::Subscribed {
            payload: response.p.unwrap_or_default(),
        },
        EVENT_RECENTDATA => UnsolicitedEvent::RecentData {
            payload: response.p.unwrap_or_default(),
        },
        EVENT_CREATED => UnsolicitedEvent::Created {
            payload: response.p.unwrap_or_default(),
        },
        EVENT_DELETED => UnsolicitedEvent::Deleted {
            payload: response.p.unwrap_or_default(),
        },
        EVENT_RENAMED => UnsolicitedEvent::Renamed {
            payload: response.p.unwrap_or_default(),
        },
        EVENT_REASSIGNED => UnsolicitedEvent::Reassigned {
            payload: response.p.unwrap_or_default(),
        },
        other => {
            log::debug!("unrecognised unsolicited event type {other}");
            return;
        }
    };
    let _ = shared.unsolicited_tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockTransport;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.token = "00".repeat(32);
        config.socket_timeout_secs = 2;
        config
    }

    #[test]
    fn test_seq_state_warns_but_accepts_large_jump() {
        let mut state = SeqState { last_seen: Some(5) };
        state.validate_and_advance(5 + SEQ_WARN_WINDOW + 1);
        assert_eq!(state.last_seen, Some(5 + SEQ_WARN_WINDOW + 1));
    }

    #[test]
    fn test_seq_wrap_around_modulus() {
        let mut state = SeqState {
            last_seen: Some(SEQ_MODULUS - 1),
        };
        state.validate_and_advance(0);
        assert_eq!(state.last_seen, Some(0));
    }

    #[test]
    fn test_low_seqnum_resync_resets_counter_and_resends_at_new_seq() {
        let (transport, _out_rx, _in_tx) = MockTransport::loopback_pair();
        let client = ProtocolClient::new(test_config(), transport);
        let (tx, rx) = mpsc::channel();
        *client.shared.outbound.lock().expect("outbound mutex poisoned") = Some(tx);
        client.shared.seq_counter.store(5, Ordering::Relaxed);

        let req = InnerRequest { r: RESOURCE_PING, t: constants::ACTION_LIST, c: None, a: None, p: None, g: None };
        let event = client.shared.requests.new_request(req, false);

        let response = InnerResponse {
            c: Some(event.id.clone()),
            t: EVENT_FAILED,
            p: Some(serde_json::json!({ "code": constants::FAILURE_LOW_SEQNUM, "message": "42" })),
        };
        handle_solicited(&client.shared, &event, &response, &event.id);

        assert_eq!(client.shared.seq_counter.load(Ordering::Relaxed), 43);
        let frame = rx.recv_timeout(Duration::from_secs(1)).expect("resync did not resend the request");
        let token = client.shared.config.token_bytes().unwrap();
        let decoded = codec::decode(&token, &frame, constants::DEFAULT_MAX_DECOMPRESSED_SIZE).unwrap();
        assert_eq!(decoded.seq, 42);
    }

    #[test]
    fn test_subscription_created_installs_feed_callback_by_point_id() {
        let (transport, _out_rx, _in_tx) = MockTransport::loopback_pair();
        let client = ProtocolClient::new(test_config(), transport);
        let (tx, _rx) = mpsc::channel();
        *client.shared.outbound.lock().expect("outbound mutex poisoned") = Some(tx);

        let req = InnerRequest { r: constants::RESOURCE_SUBSCRIPTION, t: constants::ACTION_CREATE, c: None, a: None, p: None, g: None };
        let received: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
        let received_cb = Arc::clone(&received);
        let callback: PointCallback = Arc::new(move |payload| {
            *received_cb.lock().expect("received mutex poisoned") = Some(payload);
        });
        let event = client.subscribe_feed(req, "point-1", callback).unwrap();

        let response = InnerResponse {
            c: Some(event.id.clone()),
            t: EVENT_CREATED,
            p: Some(serde_json::json!({
                "r": constants::RESOURCE_SUBSCRIPTION,
                "pointType": constants::RESOURCE_FEED,
                "pointId": "point-1",
            })),
        };
        handle_solicited(&client.shared, &event, &response, &event.id);

        assert!(client.shared.point_callbacks.pending_subs.lock().unwrap().is_empty());
        assert!(client.shared.point_callbacks.feed.lock().unwrap().contains_key("point-1"));

        let feed_response = InnerResponse {
            c: None,
            t: EVENT_FEEDDATA,
            p: Some(serde_json::json!({ "pid": "point-1", "data": "abc", "mime": "idx/2" })),
        };
        handle_unsolicited(&client.shared, feed_response);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(
            received.lock().unwrap().as_ref().and_then(|v| v.get("pid")).and_then(|v| v.as_str()),
            Some("point-1")
        );
    }

    #[test]
    fn test_send_request_without_link_started_still_enqueues_then_fails_on_shutdown() {
        let (transport, _out_rx, _in_tx) = MockTransport::loopback_pair();
        let client = ProtocolClient::new(test_config(), transport);
        let req = InnerRequest {
            r: RESOURCE_PING,
            t: constants::ACTION_LIST,
            c: None,
            a: None,
            p: None,
            g: None,
        };
        // outbound sender not yet installed (start() not called) -> LinkShutdown
        let result = client.send_request(req, false);
        assert!(matches!(result, Err(QapiError::LinkShutdown)));
    }

    #[test]
    fn test_completed_request_is_removed_from_table() {
        let (transport, _out_rx, _in_tx) = MockTransport::loopback_pair();
        let client = ProtocolClient::new(test_config(), transport);
        let req = InnerRequest { r: RESOURCE_PING, t: constants::ACTION_LIST, c: None, a: None, p: None, g: None };
        let event = client.shared.requests.new_request(req, false);

        let response = InnerResponse { c: Some(event.id.clone()), t: EVENT_COMPLETE, p: None };
        handle_solicited(&client.shared, &event, &response, &event.id);

        assert!(client.shared.requests.get(&event.id).is_none());
    }

    #[test]
    fn test_failed_request_is_removed_from_table_and_routed_by_crud_flag() {
        let (transport, _out_rx, _in_tx) = MockTransport::loopback_pair();
        let client = ProtocolClient::new(test_config(), transport);
        let req = InnerRequest { r: RESOURCE_PING, t: constants::ACTION_LIST, c: None, a: None, p: None, g: None };
        let event = client.shared.requests.new_request(req, true);

        let response = InnerResponse {
            c: Some(event.id.clone()),
            t: EVENT_FAILED,
            p: Some(serde_json::json!({ "code": constants::FAILURE_INTERNAL })),
        };
        handle_solicited(&client.shared, &event, &response, &event.id);

        assert!(client.shared.requests.get(&event.id).is_none());
        assert!(matches!(event.wait(Some(Duration::from_secs(1))), Err(QapiError::InternalError)));
    }

    #[test]
    fn test_solicited_created_fires_matching_unsolicited_callback() {
        let (transport, _out_rx, _in_tx) = MockTransport::loopback_pair();
        let client = ProtocolClient::new(test_config(), transport);
        let req = InnerRequest { r: constants::RESOURCE_ENTITY, t: constants::ACTION_CREATE, c: None, a: None, p: None, g: None };
        let event = client.shared.requests.new_request(req, false);

        let response = InnerResponse {
            c: Some(event.id.clone()),
            t: EVENT_CREATED,
            p: Some(serde_json::json!({ "r": constants::RESOURCE_ENTITY, "lid": "thing-1" })),
        };
        handle_solicited(&client.shared, &event, &response, &event.id);

        let unsolicited = client.unsolicited.recv_timeout(Duration::from_secs(1)).expect("CREATED did not fire an unsolicited event");
        assert!(matches!(unsolicited, UnsolicitedEvent::Created { .. }));
    }

    #[test]
    fn test_solicited_renamed_fires_unsolicited_without_completing_request() {
        let (transport, _out_rx, _in_tx) = MockTransport::loopback_pair();
        let client = ProtocolClient::new(test_config(), transport);
        let req = InnerRequest { r: constants::RESOURCE_ENTITY, t: constants::ACTION_UPDATE, c: None, a: None, p: None, g: None };
        let event = client.shared.requests.new_request(req, false);

        let response = InnerResponse {
            c: Some(event.id.clone()),
            t: EVENT_RENAMED,
            p: Some(serde_json::json!({ "lid": "thing-1", "newLid": "thing-2" })),
        };
        handle_solicited(&client.shared, &event, &response, &event.id);

        let unsolicited = client.unsolicited.recv_timeout(Duration::from_secs(1)).expect("RENAMED did not fire an unsolicited event");
        assert!(matches!(unsolicited, UnsolicitedEvent::Renamed { .. }));
        // RENAMED is not in the terminal set: the request is still tracked.
        assert!(client.shared.requests.get(&event.id).is_some());
    }

    #[test]
    fn test_recentdata_decodes_each_sample_and_does_not_complete_request() {
        let (transport, _out_rx, _in_tx) = MockTransport::loopback_pair();
        let client = ProtocolClient::new(test_config(), transport);
        let req = InnerRequest { r: constants::RESOURCE_FEED, t: constants::ACTION_LIST, c: None, a: None, p: None, g: None };
        let event = client.shared.requests.new_request(req, false);

        let text_bytes: Vec<serde_json::Value> =
            b"hi".iter().map(|b| serde_json::Value::from(*b)).collect();
        let response = InnerResponse {
            c: Some(event.id.clone()),
            t: EVENT_RECENTDATA,
            p: Some(serde_json::json!({
                "samples": [
                    { "data": text_bytes, "mime": "idx/2", "time": "2024-01-01T00:00:00.000Z" },
                ],
            })),
        };
        handle_solicited(&client.shared, &event, &response, &event.id);

        let unsolicited = client.unsolicited.recv_timeout(Duration::from_secs(1)).expect("RECENTDATA did not fire a callback");
        let UnsolicitedEvent::RecentData { payload } = unsolicited else {
            panic!("expected a RecentData event");
        };
        assert_eq!(payload.get("data").and_then(|v| v.as_str()), Some("hi"));
        assert_eq!(payload.get("mime"), Some(&serde_json::Value::Null));
        // RECENTDATA is not in the terminal set: the request is still tracked.
        assert!(client.shared.requests.get(&event.id).is_some());
    }
}
