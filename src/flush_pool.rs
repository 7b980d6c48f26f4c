//! Flush pool: applies queued thing/point diffs to the container,
//! guaranteeing no two diffs for the same thing are ever in flight at
//! once.
//!
//! Grounded on `original_source/src/Ioticiser/Stash/ThreadPool.py`'s
//! `LidSerialisedQueue`/`ThreadPool`: a bounded set of worker threads pull
//! from one shared queue, but once a worker claims a given lid's message
//! it keeps draining that lid's own side-queue before returning to the
//! shared one — so messages for the same thing are strictly ordered
//! without serializing unrelated things behind each other. Workers retry
//! forever (1s backoff) on a transport-level `LinkError`, and abort the
//! whole pool on `AccessDenied` or any other unexpected failure, exactly
//! as the original's bare `except LinkException`/`except IOTAccessDenied`/
//! `except Exception` triad does (spec.md §4.G).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::codec::ubjson::InnerRequest;
use crate::constants::{
    self, ACTION_CREATE, ACTION_UPDATE, RESOURCE_ENTITY, RESOURCE_ENTITY_META, RESOURCE_ENTITY_TAG_META,
    RESOURCE_VALUE_META,
};
use crate::error::QapiError;
use crate::link::BrokerTransport;
use crate::protocol::ProtocolClient;
use crate::resource::{PointDiff, ThingDiff};

/// One unit of flush work: the diff for a single thing, tagged with the
/// stash's own monotonic index for that diff (so the completion callback
/// can tell the stash which pending diff entry to retire).
#[derive(Debug, Clone)]
pub struct Message {
    pub lid: String,
    pub diff_index: u64,
    pub diff: ThingDiff,
}

struct QueueState {
    queue: VecDeque<Message>,
    lid_mapping: HashMap<String, VecDeque<Message>>,
}

#[derive(Default)]
struct LidSerialisedQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

impl Default for QueueState {
    fn default() -> Self {
        Self { queue: VecDeque::new(), lid_mapping: HashMap::new() }
    }
}

impl LidSerialisedQueue {
    fn put(&self, msg: Message) {
        let mut state = self.state.lock().expect("flush queue mutex poisoned");
        state.queue.push_back(msg);
        self.condvar.notify_all();
    }

    /// Pulls the next message this worker may process. If `own_lid` is
    /// set, its side-deque is drained first (and cleared from the mapping
    /// once exhausted, releasing ownership). Otherwise blocks (up to
    /// `timeout`) for a main-queue message whose lid nobody else owns yet,
    /// claiming it; messages for an already-claimed lid are shunted into
    /// that lid's side-deque instead of being returned to the caller.
    fn get(&self, own_lid: &mut Option<String>, timeout: Duration) -> Option<Message> {
        let mut state = self.state.lock().expect("flush queue mutex poisoned");
        if let Some(lid) = own_lid.clone() {
            if let Some(dq) = state.lid_mapping.get_mut(&lid) {
                if let Some(msg) = dq.pop_front() {
                    return Some(msg);
                }
                state.lid_mapping.remove(&lid);
            }
            *own_lid = None;
        }

        let deadline = Instant::now() + timeout;
        loop {
            while let Some(msg) = state.queue.pop_front() {
                if let Some(dq) = state.lid_mapping.get_mut(&msg.lid) {
                    dq.push_back(msg);
                    continue;
                }
                state.lid_mapping.insert(msg.lid.clone(), VecDeque::new());
                *own_lid = Some(msg.lid.clone());
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .condvar
                .wait_timeout(state, deadline - now)
                .expect("flush queue mutex poisoned");
            state = guard;
            if result.timed_out() && state.queue.is_empty() {
                return None;
            }
        }
    }

    fn is_empty(&self) -> bool {
        let state = self.state.lock().expect("flush queue mutex poisoned");
        state.queue.is_empty() && state.lid_mapping.is_empty()
    }
}

/// Invoked once a diff has been fully applied: lets the stash merge it
/// into its on-disk snapshot and retire the pending diff entry.
pub type CompletionCallback = Arc<dyn Fn(&str, u64, &ThingDiff) + Send + Sync>;
/// Invoked at most once, the moment the pool aborts (access denied, or any
/// unexpected error) — lets the owner shut the rest of the client down.
pub type FatalCallback = Arc<dyn Fn() + Send + Sync>;

/// A fixed pool of worker threads draining a [`LidSerialisedQueue`] of
/// [`ThingDiff`]s, translating each into the sequence of protocol requests
/// needed to bring the container's copy of that thing up to date.
pub struct FlushPool<T: BrokerTransport + 'static> {
    queue: Arc<LidSerialisedQueue>,
    stop: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    _transport: std::marker::PhantomData<T>,
}

impl<T: BrokerTransport + 'static> FlushPool<T> {
    #[must_use]
    pub fn start(
        client: Arc<ProtocolClient<T>>,
        num_workers: usize,
        on_complete: CompletionCallback,
        on_fatal: FatalCallback,
    ) -> Self {
        let queue = Arc::new(LidSerialisedQueue::default());
        let stop = Arc::new(AtomicBool::new(false));
        let aborted = Arc::new(AtomicBool::new(false));

        let handles = (0..num_workers.max(1))
            .map(|i| {
                let queue = Arc::clone(&queue);
                let stop = Arc::clone(&stop);
                let aborted = Arc::clone(&aborted);
                let client = Arc::clone(&client);
                let on_complete = Arc::clone(&on_complete);
                let on_fatal = Arc::clone(&on_fatal);
                std::thread::Builder::new()
                    .name(format!("flush-worker-{i}"))
                    .spawn(move || run_worker(&queue, &stop, &aborted, &client, &on_complete, &on_fatal))
                    .expect("failed to spawn flush-pool worker")
            })
            .collect();

        Self { queue, stop, aborted, handles, _transport: std::marker::PhantomData }
    }

    pub fn submit(&self, lid: String, diff_index: u64, diff: ThingDiff) {
        self.queue.put(Message { lid, diff_index, diff });
    }

    /// `true` once every submitted diff has been applied (or the pool has
    /// aborted).
    #[must_use]
    pub fn queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn run_worker<T: BrokerTransport + 'static>(
    queue: &Arc<LidSerialisedQueue>,
    stop: &Arc<AtomicBool>,
    aborted: &Arc<AtomicBool>,
    client: &Arc<ProtocolClient<T>>,
    on_complete: &CompletionCallback,
    on_fatal: &FatalCallback,
) {
    let mut own_lid: Option<String> = None;
    loop {
        if stop.load(Ordering::Relaxed) || aborted.load(Ordering::Relaxed) {
            return;
        }
        let Some(msg) = queue.get(&mut own_lid, constants::STOP_POLL_INTERVAL) else {
            continue;
        };
        loop {
            if aborted.load(Ordering::Relaxed) {
                return;
            }
            match apply_diff(client, &msg.diff) {
                Ok(()) => {
                    on_complete(&msg.lid, msg.diff_index, &msg.diff);
                    break;
                }
                Err(QapiError::LinkError(_) | QapiError::LinkShutdown) => {
                    log::warn!("flush of '{}' hit a link error; retrying in 1s", msg.lid);
                    std::thread::sleep(Duration::from_secs(1));
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(QapiError::AccessDenied) => {
                    log::error!("flush of '{}' denied access; aborting the flush pool", msg.lid);
                    aborted.store(true, Ordering::Relaxed);
                    on_fatal();
                    return;
                }
                Err(e) => {
                    log::error!("flush of '{}' failed unexpectedly ({e}); aborting the flush pool", msg.lid);
                    aborted.store(true, Ordering::Relaxed);
                    on_fatal();
                    return;
                }
            }
        }
    }
}

fn send_and_wait<T: BrokerTransport + 'static>(client: &ProtocolClient<T>, req: InnerRequest) -> Result<(), QapiError> {
    let event = client.send_request(req, true)?;
    let timeout = client.socket_timeout();
    match event.wait(Some(timeout)) {
        Ok(true) => Ok(()),
        Ok(false) => Err(QapiError::SyncTimeout),
        Err(e) => Err(e),
    }
}

/// Translates one [`ThingDiff`] into the sequence of protocol requests
/// `Stash.__submit_diffs`/`ThreadPool.__handle_thing_changes` issue:
/// ensure the entity exists, `public=false` first if applicable, entity
/// tag/label/description/location metadata, then each point (created if
/// needed, its own metadata, its values, its share), and finally
/// `public=true` if applicable.
fn apply_diff<T: BrokerTransport + 'static>(client: &ProtocolClient<T>, diff: &ThingDiff) -> Result<(), QapiError> {
    send_and_wait(
        client,
        InnerRequest {
            r: RESOURCE_ENTITY,
            t: ACTION_CREATE,
            c: None,
            a: None,
            p: Some(json!({ "lid": diff.lid })),
            g: None,
        },
    )?;

    if diff.public == Some(false) {
        apply_public(client, &diff.lid, false)?;
    }

    if diff.tags.is_some() {
        send_and_wait(
            client,
            InnerRequest {
                r: RESOURCE_ENTITY_TAG_META,
                t: ACTION_UPDATE,
                c: None,
                a: None,
                p: Some(json!({ "lid": diff.lid, "tags": diff.tags })),
                g: None,
            },
        )?;
    }

    if diff.labels.is_some() || diff.descriptions.is_some() || diff.location.is_some() {
        let mut payload = json!({ "lid": diff.lid });
        if let Some(labels) = &diff.labels {
            payload["labels"] = json!(labels);
        }
        if let Some(descriptions) = &diff.descriptions {
            payload["descriptions"] = json!(descriptions);
        }
        if let Some((lat, lon)) = diff.location {
            payload["lat"] = json!(lat);
            payload["long"] = json!(lon);
        }
        send_and_wait(
            client,
            InnerRequest { r: RESOURCE_ENTITY_META, t: ACTION_UPDATE, c: None, a: None, p: Some(payload), g: None },
        )?;
    }

    for point in diff.points.values() {
        apply_point_diff(client, &diff.lid, point)?;
    }

    if diff.public == Some(true) {
        apply_public(client, &diff.lid, true)?;
    }

    Ok(())
}

fn apply_public<T: BrokerTransport + 'static>(client: &ProtocolClient<T>, lid: &str, public: bool) -> Result<(), QapiError> {
    send_and_wait(
        client,
        InnerRequest {
            r: RESOURCE_ENTITY_META,
            t: ACTION_UPDATE,
            c: None,
            a: None,
            p: Some(json!({ "lid": lid, "public": public })),
            g: None,
        },
    )
}

fn apply_point_diff<T: BrokerTransport + 'static>(client: &ProtocolClient<T>, lid: &str, point: &PointDiff) -> Result<(), QapiError> {
    send_and_wait(
        client,
        InnerRequest {
            r: point.kind.resource_code(),
            t: ACTION_CREATE,
            c: None,
            a: None,
            p: Some(json!({ "lid": lid, "pid": point.pid })),
            g: None,
        },
    )?;

    if point.tags.is_some() {
        send_and_wait(
            client,
            InnerRequest {
                r: point.kind.tag_meta_resource_code(),
                t: ACTION_UPDATE,
                c: None,
                a: None,
                p: Some(json!({ "lid": lid, "pid": point.pid, "tags": point.tags })),
                g: None,
            },
        )?;
    }

    if point.recent_config.is_some() || point.labels.is_some() || point.descriptions.is_some() {
        let mut payload = json!({ "lid": lid, "pid": point.pid });
        if let Some(labels) = &point.labels {
            payload["labels"] = json!(labels);
        }
        if let Some(descriptions) = &point.descriptions {
            payload["descriptions"] = json!(descriptions);
        }
        if let Some(recent) = point.recent_config {
            payload["recentConfig"] = json!(recent);
        }
        send_and_wait(
            client,
            InnerRequest {
                r: point.kind.meta_resource_code(),
                t: ACTION_UPDATE,
                c: None,
                a: None,
                p: Some(payload),
                g: None,
            },
        )?;
    }

    let mut value_share = serde_json::Map::new();
    for (label, value_diff) in &point.values {
        if value_diff.vtype.is_some() {
            send_and_wait(
                client,
                InnerRequest {
                    r: RESOURCE_VALUE_META,
                    t: ACTION_UPDATE,
                    c: None,
                    a: None,
                    p: Some(json!({
                        "lid": lid,
                        "pid": point.pid,
                        "label": label,
                        "vtype": value_diff.vtype,
                        "lang": value_diff.lang,
                        "description": value_diff.description,
                        "unit": value_diff.unit,
                    })),
                    g: None,
                },
            )?;
        }
        if let Some(share) = &value_diff.share_data {
            value_share.insert(label.clone(), json!({ "data": share.data, "mime": share.mime }));
        }
    }

    if !value_share.is_empty() {
        send_and_wait(
            client,
            InnerRequest {
                r: point.kind.resource_code(),
                t: ACTION_UPDATE,
                c: None,
                a: None,
                p: Some(json!({ "lid": lid, "pid": point.pid, "values": value_share })),
                g: None,
            },
        )?;
    }

    if let Some(share) = &point.share_data {
        let mut payload = json!({ "lid": lid, "pid": point.pid, "data": share.data, "mime": share.mime });
        if let Some(time) = point.share_time {
            payload["time"] = json!(time.to_rfc3339());
        }
        send_and_wait(
            client,
            InnerRequest { r: point.kind.resource_code(), t: ACTION_UPDATE, c: None, a: None, p: Some(payload), g: None },
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(lid: &str, idx: u64) -> Message {
        Message {
            lid: lid.to_string(),
            diff_index: idx,
            diff: ThingDiff {
                lid: lid.to_string(),
                public: None,
                tags: None,
                location: None,
                labels: None,
                descriptions: None,
                points: HashMap::new(),
            },
        }
    }

    #[test]
    fn test_different_lids_do_not_block_each_other() {
        let queue = LidSerialisedQueue::default();
        queue.put(msg("a", 1));
        queue.put(msg("b", 1));
        let mut lid_a: Option<String> = None;
        let mut lid_b: Option<String> = None;
        let got_a = queue.get(&mut lid_a, Duration::from_millis(50)).unwrap();
        let got_b = queue.get(&mut lid_b, Duration::from_millis(50)).unwrap();
        assert_ne!(got_a.lid, got_b.lid);
        assert_eq!(lid_a, Some(got_a.lid));
        assert_eq!(lid_b, Some(got_b.lid));
    }

    #[test]
    fn test_same_lid_serialised_behind_one_worker() {
        let queue = LidSerialisedQueue::default();
        queue.put(msg("a", 1));
        queue.put(msg("a", 2));
        let mut owner: Option<String> = None;
        let first = queue.get(&mut owner, Duration::from_millis(50)).unwrap();
        assert_eq!(first.diff_index, 1);

        // a second worker trying to claim concurrently gets nothing for
        // "a" - it's already owned - but does not block forever since
        // get() only waits up to the timeout.
        let mut other_owner: Option<String> = None;
        assert!(queue.get(&mut other_owner, Duration::from_millis(20)).is_none());

        let second = queue.get(&mut owner, Duration::from_millis(50)).unwrap();
        assert_eq!(second.diff_index, 2);
    }

    #[test]
    fn test_queue_empty_after_full_drain() {
        let queue = LidSerialisedQueue::default();
        queue.put(msg("a", 1));
        let mut owner: Option<String> = None;
        assert!(!queue.is_empty());
        let _ = queue.get(&mut owner, Duration::from_millis(50)).unwrap();
        // lid "a" is still "owned" (present in lid_mapping with an empty
        // side-deque) until the owner releases it on its next get() call.
        assert!(!queue.is_empty());
        assert!(queue.get(&mut owner, Duration::from_millis(20)).is_none());
        assert!(queue.is_empty());
    }
}
