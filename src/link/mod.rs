//! Transport layer: a reconnecting dual-channel connection to the broker.
//!
//! `Link` owns one send thread and one receive thread, both polling a stop
//! signal at least once per second so shutdown is always prompt (spec.md
//! §5). Reconnection re-wires a shared, mutex-guarded handle rather than
//! tearing down and recreating the threads, mirroring the now-removed
//! `broker/mod.rs`'s `SharedWriter` pattern; the receive thread's
//! named-thread, blocking-read, incremental-decode, route-to-channel shape
//! is grounded on the now-removed `broker/connection.rs::start_output_forwarder`.
//!
//! Implementing the broker itself (the AMQP 0-9-1 wire protocol) is out of
//! scope (spec.md §1 Non-goals); `Link` is built against the
//! [`BrokerTransport`] trait so a real AMQP client crate can be dropped in
//! without touching this module's thread/state-machine logic. See
//! DESIGN.md's Open Question resolution for why no such crate ships here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::codec::FrameStreamDecoder;
use crate::constants::STOP_POLL_INTERVAL;
use crate::error::QapiError;

/// Observable connection state, polled by `Link::state` and surfaced to
/// the protocol client for logging and retry-across-reconnect decisions.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready,
}

/// Boundary between `Link` and an actual broker client. A real
/// implementation opens a TLS-wrapped AMQP 0-9-1 channel per spec.md §6.2;
/// this crate ships only an in-process [`MockTransport`] for tests.
pub trait BrokerTransport: Send {
    /// Blocks until connected or returns an error. Called by the
    /// reconnect loop; may be called repeatedly after a prior failure.
    fn connect(&mut self) -> Result<(), QapiError>;

    /// Publishes one already-framed wrapper to the data exchange.
    fn publish(&mut self, frame: &[u8]) -> Result<(), QapiError>;

    /// Reads whatever bytes are currently available, blocking for up to
    /// `timeout`. Returns an empty vec on a read timeout (not an error) so
    /// the receive loop can re-check its stop signal.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<u8>, QapiError>;

    /// Sends a broker-level heartbeat/keep-alive frame.
    fn heartbeat(&mut self) -> Result<(), QapiError>;

    fn close(&mut self);
}

/// In-process transport standing in for a real broker connection. Two
/// `MockTransport`s constructed from the same `mpsc` channel pair model a
/// loopback connection, used by Link/Protocol tests (spec.md §8 S1).
pub struct MockTransport {
    outbound: Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    connected: bool,
    fail_next_connect: bool,
}

impl MockTransport {
    /// Builds a connected loopback pair: bytes published on one side are
    /// observable (already framed) by a test harness reading `tap`, while
    /// `tap` can push bytes back in to simulate inbound broker traffic.
    #[must_use]
    pub fn loopback_pair() -> (Self, mpsc::Receiver<Vec<u8>>, Sender<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::channel();
        let (in_tx, in_rx) = mpsc::channel();
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
                connected: false,
                fail_next_connect: false,
            },
            out_rx,
            in_tx,
        )
    }

    pub fn set_fail_next_connect(&mut self, fail: bool) {
        self.fail_next_connect = fail;
    }
}

impl BrokerTransport for MockTransport {
    fn connect(&mut self) -> Result<(), QapiError> {
        if self.fail_next_connect {
            self.fail_next_connect = false;
            return Err(QapiError::LinkError("simulated connect failure".into()));
        }
        self.connected = true;
        Ok(())
    }

    fn publish(&mut self, frame: &[u8]) -> Result<(), QapiError> {
        if !self.connected {
            return Err(QapiError::LinkError("not connected".into()));
        }
        self.outbound
            .send(frame.to_vec())
            .map_err(|e| QapiError::LinkError(e.to_string()))
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<u8>, QapiError> {
        match self.inbound.recv_timeout(timeout) {
            Ok(bytes) => Ok(bytes),
            Err(RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => {
                Err(QapiError::LinkError("broker connection closed".into()))
            }
        }
    }

    fn heartbeat(&mut self) -> Result<(), QapiError> {
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

/// Event emitted by the receive thread: either a raw decoded frame
/// (forwarded up to the protocol client for HMAC/seq validation) or a
/// state transition.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Frame(Vec<u8>),
    StateChanged(LinkState),
}

impl PartialEq for LinkEvent {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Frame(a), Self::Frame(b)) => a == b,
            (Self::StateChanged(a), Self::StateChanged(b)) => a == b,
            _ => false,
        }
    }
}

struct Shared<T: BrokerTransport> {
    transport: Mutex<Option<T>>,
    state: Mutex<LinkState>,
}

/// Dual-channel, auto-reconnecting connection to the broker.
pub struct Link<T: BrokerTransport + 'static> {
    shared: Arc<Shared<T>>,
    stop: Arc<AtomicBool>,
    conn_retry_delay: Duration,
    send_handle: Option<JoinHandle<()>>,
    recv_handle: Option<JoinHandle<()>>,
    outbound_tx: Option<Sender<Vec<u8>>>,
}

impl<T: BrokerTransport + 'static> Link<T> {
    #[must_use]
    pub fn new(transport: T, conn_retry_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport: Mutex::new(Some(transport)),
                state: Mutex::new(LinkState::Disconnected),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            conn_retry_delay,
            send_handle: None,
            recv_handle: None,
            outbound_tx: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.shared.state.lock().expect("link state mutex poisoned").clone()
    }

    fn set_state(&self, state: LinkState, events: &Sender<LinkEvent>) {
        *self.shared.state.lock().expect("link state mutex poisoned") = state.clone();
        let _ = events.send(LinkEvent::StateChanged(state));
    }

    /// Starts the send and receive threads. `events` receives decoded
    /// frames and state transitions; `outbound` feeds frames to the send
    /// thread (already wrapper-encoded by the protocol client).
    pub fn start(&mut self, events: Sender<LinkEvent>) -> Sender<Vec<u8>> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        self.outbound_tx = Some(tx.clone());

        self.set_state(LinkState::Connecting, &events);
        {
            let shared = Arc::clone(&self.shared);
            let mut guard = shared.transport.lock().expect("link transport mutex poisoned");
            if let Some(transport) = guard.as_mut() {
                match transport.connect() {
                    Ok(()) => self.set_state(LinkState::Ready, &events),
                    Err(_) => self.set_state(LinkState::Disconnected, &events),
                }
            }
        }

        self.send_handle = Some(self.spawn_send_thread(rx, events.clone()));
        self.recv_handle = Some(self.spawn_recv_thread(events));
        tx
    }

    fn spawn_send_thread(&self, rx: mpsc::Receiver<Vec<u8>>, events: Sender<LinkEvent>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        let retry_delay = self.conn_retry_delay;
        std::thread::Builder::new()
            .name("link-send".to_owned())
            .spawn(move || {
                loop {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    match rx.recv_timeout(STOP_POLL_INTERVAL) {
                        Ok(frame) => {
                            loop {
                                let published = {
                                    let mut guard =
                                        shared.transport.lock().expect("link transport mutex poisoned");
                                    guard.as_mut().map(|t| t.publish(&frame))
                                };
                                match published {
                                    Some(Ok(())) => break,
                                    Some(Err(e)) => {
                                        log::warn!("link send failed, will retry connect: {e}");
                                        *shared.state.lock().expect("link state mutex poisoned") =
                                            LinkState::Disconnected;
                                        let _ = events.send(LinkEvent::StateChanged(LinkState::Disconnected));
                                        if stop.load(Ordering::Relaxed) {
                                            break;
                                        }
                                        std::thread::sleep(retry_delay);
                                        let reconnected = {
                                            let mut guard = shared
                                                .transport
                                                .lock()
                                                .expect("link transport mutex poisoned");
                                            guard.as_mut().map(|t| t.connect())
                                        };
                                        if matches!(reconnected, Some(Ok(()))) {
                                            *shared.state.lock().expect("link state mutex poisoned") =
                                                LinkState::Ready;
                                            let _ =
                                                events.send(LinkEvent::StateChanged(LinkState::Ready));
                                        }
                                    }
                                    None => break,
                                }
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("link-send thread exiting");
            })
            .expect("failed to spawn link-send thread")
    }

    fn spawn_recv_thread(&self, events: Sender<LinkEvent>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        std::thread::Builder::new()
            .name("link-recv".to_owned())
            .spawn(move || {
                let mut decoder = FrameStreamDecoder::new();
                loop {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let read = {
                        let mut guard = shared.transport.lock().expect("link transport mutex poisoned");
                        guard.as_mut().map(|t| t.recv_timeout(STOP_POLL_INTERVAL))
                    };
                    match read {
                        Some(Ok(bytes)) if bytes.is_empty() => continue,
                        Some(Ok(bytes)) => {
                            for frame in decoder.feed(&bytes) {
                                if events.send(LinkEvent::Frame(frame)).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("link receive failed: {e}");
                            *shared.state.lock().expect("link state mutex poisoned") = LinkState::Disconnected;
                            let _ = events.send(LinkEvent::StateChanged(LinkState::Disconnected));
                        }
                        None => break,
                    }
                }
                log::debug!("link-recv thread exiting");
            })
            .expect("failed to spawn link-recv thread")
    }

    /// Signals both threads to stop and joins them. Always completes
    /// within roughly `STOP_POLL_INTERVAL` of being called.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.outbound_tx.take();
        if let Some(h) = self.send_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.recv_handle.take() {
            let _ = h.join();
        }
        if let Some(t) = self.shared.transport.lock().expect("link transport mutex poisoned").as_mut() {
            t.close();
        }
    }
}
