//! Persistent thing/point snapshot store with a background flush engine.
//!
//! Grounded on `original_source/src/Ioticiser/Stash/Stash.py`: a
//! gzip-wrapped binary file holding `things` (the container-acknowledged
//! snapshot), `diff` (pending, not-yet-applied diffs, replayed on
//! restart), and `diff_counter` (a monotonic id source for `diff`
//! entries), saved periodically and only when its content actually
//! changed. `Thing`s are handed out from [`Stash::create_thing`] and
//! mutated in place; [`Stash::finalise`] computes the minimal diff since
//! the last flush, queues it on the [`crate::flush_pool::FlushPool`], and
//! later merges the applied diff back into the snapshot.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::constants::STASH_SAVE_INTERVAL;
use crate::flush_pool::{FatalCallback, FlushPool};
use crate::link::BrokerTransport;
use crate::protocol::ProtocolClient;
use crate::resource::{Thing, ThingDiff, ThingSnapshot};

/// A property value stored in the stash's side-car properties file:
/// arbitrary small bits of state an integration wants persisted alongside
/// the thing/point snapshot (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StashFile {
    #[serde(default)]
    things: HashMap<String, ThingSnapshot>,
    #[serde(default)]
    diff: HashMap<u64, ThingDiff>,
    #[serde(default)]
    diff_counter: u64,
}

/// Persistent store of thing/point snapshots, backed by a gzip-wrapped
/// binary file, with a background [`FlushPool`] applying diffs to the
/// container.
pub struct Stash<T: BrokerTransport + 'static> {
    path: PathBuf,
    props_path: PathBuf,
    file: Mutex<StashFile>,
    properties: Mutex<HashMap<String, PropertyValue>>,
    active_things: Mutex<HashMap<String, Arc<Thing>>>,
    flush_pool: Mutex<Option<FlushPool<T>>>,
    saver_stop: Arc<AtomicBool>,
    saver_handle: Mutex<Option<JoinHandle<()>>>,
    last_saved_hash: Mutex<Option<Vec<u8>>>,
}

impl<T: BrokerTransport + 'static> Stash<T> {
    /// Opens (creating if absent, migrating if legacy-JSON) the stash at
    /// `path`, starts its flush pool against `client`, and resubmits any
    /// diff entries left over from an unclean shutdown.
    pub fn open(
        path: &Path,
        props_path: &Path,
        client: Arc<ProtocolClient<T>>,
        num_workers: usize,
        on_fatal: FatalCallback,
    ) -> Result<Arc<Self>> {
        let file = load_or_migrate(path)?;
        let properties = load_properties(props_path)?;

        let stash = Arc::new(Self {
            path: path.to_path_buf(),
            props_path: props_path.to_path_buf(),
            file: Mutex::new(file),
            properties: Mutex::new(properties),
            active_things: Mutex::new(HashMap::new()),
            flush_pool: Mutex::new(None),
            saver_stop: Arc::new(AtomicBool::new(false)),
            saver_handle: Mutex::new(None),
            last_saved_hash: Mutex::new(None),
        });

        let weak = Arc::downgrade(&stash);
        let on_complete: crate::flush_pool::CompletionCallback = Arc::new(move |lid, idx, diff| {
            if let Some(stash) = weak.upgrade() {
                stash.complete_diff(lid, idx, diff);
            }
        });
        let pool = FlushPool::start(client, num_workers, on_complete, on_fatal);

        let pending: Vec<(u64, ThingDiff)> = {
            let file = stash.file.lock().expect("stash file mutex poisoned");
            let mut entries: Vec<_> = file.diff.iter().map(|(idx, diff)| (*idx, diff.clone())).collect();
            entries.sort_by_key(|(idx, _)| *idx);
            entries
        };
        for (idx, diff) in pending {
            pool.submit(diff.lid.clone(), idx, diff);
        }

        *stash.flush_pool.lock().expect("flush pool mutex poisoned") = Some(pool);
        Ok(stash)
    }

    /// Spawns the periodic (content-hash-gated) save thread.
    pub fn start_saver(self: &Arc<Self>) {
        let stash = Arc::clone(self);
        let stop = Arc::clone(&self.saver_stop);
        let handle = std::thread::Builder::new()
            .name("stash-saver".to_string())
            .spawn(move || {
                let mut last_tick = std::time::Instant::now();
                loop {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    if last_tick.elapsed() >= STASH_SAVE_INTERVAL {
                        if let Err(e) = stash.save() {
                            log::warn!("periodic stash save failed: {e}");
                        }
                        last_tick = std::time::Instant::now();
                    }
                    std::thread::sleep(crate::constants::STOP_POLL_INTERVAL);
                }
            })
            .expect("failed to spawn stash-saver thread");
        *self.saver_handle.lock().expect("saver handle mutex poisoned") = Some(handle);
    }

    /// Stops the saver thread, performs one final save, and shuts down the
    /// flush pool.
    pub fn stop(&self) {
        self.saver_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.saver_handle.lock().expect("saver handle mutex poisoned").take() {
            let _ = handle.join();
        }
        if let Err(e) = self.save() {
            log::warn!("final stash save failed: {e}");
        }
        if let Some(pool) = self.flush_pool.lock().expect("flush pool mutex poisoned").take() {
            pool.stop();
        }
    }

    /// Returns the thing with local id `lid`, creating it from the stash
    /// snapshot (or brand new, if never seen) on first request. Repeated
    /// calls for the same lid return the same shared handle.
    pub fn create_thing(&self, lid: &str) -> Result<Arc<Thing>, crate::codec::validate::ValidationError> {
        let mut active = self.active_things.lock().expect("active things mutex poisoned");
        if let Some(thing) = active.get(lid) {
            return Ok(Arc::clone(thing));
        }
        let thing = {
            let file = self.file.lock().expect("stash file mutex poisoned");
            match file.things.get(lid) {
                Some(snapshot) => Arc::new(Thing::from_snapshot(lid, snapshot)),
                None => Arc::new(Thing::new(lid)?),
            }
        };
        active.insert(lid.to_string(), Arc::clone(&thing));
        Ok(thing)
    }

    /// Computes the pending diff for `thing` (if any), records it for
    /// replay-on-restart, and queues it on the flush pool. Returns the
    /// diff index assigned, or `None` if nothing had changed.
    pub fn finalise(&self, thing: &Thing) -> Option<u64> {
        let diff = thing.take_diff()?;
        let idx = {
            let mut file = self.file.lock().expect("stash file mutex poisoned");
            file.diff_counter += 1;
            let idx = file.diff_counter;
            file.diff.insert(idx, diff.clone());
            idx
        };
        if let Some(pool) = self.flush_pool.lock().expect("flush pool mutex poisoned").as_ref() {
            pool.submit(diff.lid.clone(), idx, diff);
        }
        Some(idx)
    }

    fn complete_diff(&self, lid: &str, idx: u64, diff: &ThingDiff) {
        let mut file = self.file.lock().expect("stash file mutex poisoned");
        file.things.entry(lid.to_string()).or_default().merge_diff(diff);
        file.diff.remove(&idx);
    }

    #[must_use]
    pub fn get_property(&self, key: &str) -> Option<PropertyValue> {
        self.properties.lock().expect("properties mutex poisoned").get(key).cloned()
    }

    pub fn set_property(&self, key: &str, value: PropertyValue) {
        self.properties.lock().expect("properties mutex poisoned").insert(key.to_string(), value);
        if let Err(e) = self.save_properties() {
            log::warn!("failed to persist stash properties: {e}");
        }
    }

    /// `true` once every queued diff has been applied (or the pool has
    /// aborted) — used by callers deciding whether it is safe to shut
    /// down without losing unflushed work.
    #[must_use]
    pub fn queue_empty(&self) -> bool {
        match self.flush_pool.lock().expect("flush pool mutex poisoned").as_ref() {
            Some(pool) => pool.queue_empty(),
            None => true,
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.flush_pool
            .lock()
            .expect("flush pool mutex poisoned")
            .as_ref()
            .is_some_and(FlushPool::is_aborted)
    }

    /// Serializes and gzips the stash file, skipping the write entirely if
    /// its content hash is unchanged since the last successful save.
    fn save(&self) -> Result<()> {
        let bytes = {
            let file = self.file.lock().expect("stash file mutex poisoned");
            rmp_serde::to_vec_named(&*file).context("serializing stash")?
        };
        let hash = Sha256::digest(&bytes).to_vec();
        {
            let mut last = self.last_saved_hash.lock().expect("last saved hash mutex poisoned");
            if last.as_ref() == Some(&hash) {
                return Ok(());
            }
            *last = Some(hash);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        {
            let file = fs::File::create(&tmp_path)
                .with_context(|| format!("creating {}", tmp_path.display()))?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&bytes)?;
            encoder.finish()?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), self.path.display()))?;
        Ok(())
    }

    fn save_properties(&self) -> Result<()> {
        let properties = self.properties.lock().expect("properties mutex poisoned").clone();
        if let Some(parent) = self.props_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.props_path, serde_json::to_string_pretty(&properties)?)
            .with_context(|| format!("writing {}", self.props_path.display()))
    }
}

fn load_or_migrate(path: &Path) -> Result<StashFile> {
    if path.extension().is_some_and(|e| e == "json") && path.exists() {
        return migrate_legacy_json(path);
    }
    if !path.exists() {
        return Ok(StashFile::default());
    }
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut decoder = GzDecoder::new(file);
    let mut bytes = Vec::new();
    decoder
        .read_to_end(&mut bytes)
        .with_context(|| format!("decompressing {}", path.display()))?;
    rmp_serde::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// Migrates a legacy plain-JSON stash file: any top-level key other than
/// `things`/`diff`/`diff_counter` is folded into the things map (the
/// legacy format kept thing entries at the document root), stray `LAT`/
/// `LONG` top-level keys (a retired global-location field) are dropped,
/// and the original file is preserved alongside with a `.old` suffix.
fn migrate_legacy_json(path: &Path) -> Result<StashFile> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut raw: serde_json::Map<String, Value> =
        serde_json::from_str(&content).with_context(|| format!("parsing legacy {}", path.display()))?;

    raw.remove("LAT");
    raw.remove("LONG");
    let mut things_value = raw.remove("things").or_else(|| raw.remove("THINGS")).unwrap_or(Value::Object(Default::default()));
    let diff_value = raw.remove("diff").unwrap_or(Value::Object(Default::default()));
    let diff_counter = raw.remove("diff_counter").and_then(|v| v.as_u64()).unwrap_or(0);

    if let Value::Object(things_map) = &mut things_value {
        for (key, value) in raw {
            things_map.entry(key).or_insert(value);
        }
    }

    let things: HashMap<String, ThingSnapshot> = serde_json::from_value(things_value).unwrap_or_default();
    let diff: HashMap<u64, ThingDiff> = serde_json::from_value(diff_value).unwrap_or_default();

    let old_path = path.with_extension("json.old");
    fs::rename(path, &old_path).with_context(|| format!("archiving legacy stash to {}", old_path.display()))?;

    Ok(StashFile { things, diff, diff_counter })
}

fn load_properties(path: &Path) -> Result<HashMap<String, PropertyValue>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::link::MockTransport;
    use crate::resource::PointKind;

    fn test_client() -> Arc<ProtocolClient<MockTransport>> {
        let (transport, _out_rx, _in_tx) = MockTransport::loopback_pair();
        let mut config = Config::default();
        config.token = "00".repeat(32);
        Arc::new(ProtocolClient::new(config, transport))
    }

    fn temp_paths() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let stash_path = dir.path().join("stash.bin");
        let props_path = dir.path().join("props.json");
        (dir, stash_path, props_path)
    }

    #[test]
    fn test_open_creates_empty_stash_when_absent() {
        let (_dir, stash_path, props_path) = temp_paths();
        let stash = Stash::open(&stash_path, &props_path, test_client(), 1, Arc::new(|| {})).unwrap();
        assert!(stash.queue_empty());
        assert!(stash.get_property("k").is_none());
    }

    #[test]
    fn test_create_thing_returns_same_handle() {
        let (_dir, stash_path, props_path) = temp_paths();
        let stash = Stash::open(&stash_path, &props_path, test_client(), 1, Arc::new(|| {})).unwrap();
        let a = stash.create_thing("t1").unwrap();
        let b = stash.create_thing("t1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_finalise_records_diff_and_queues_it() {
        let (_dir, stash_path, props_path) = temp_paths();
        let stash = Stash::open(&stash_path, &props_path, test_client(), 1, Arc::new(|| {})).unwrap();
        let thing = stash.create_thing("t1").unwrap();
        thing.set_label("Thing One", None).unwrap();
        let idx = stash.finalise(&thing);
        assert!(idx.is_some());
    }

    #[test]
    fn test_properties_persist_across_reopen() {
        let (_dir, stash_path, props_path) = temp_paths();
        {
            let stash = Stash::open(&stash_path, &props_path, test_client(), 1, Arc::new(|| {})).unwrap();
            stash.set_property("installed_version", PropertyValue::Int(3));
        }
        let stash = Stash::open(&stash_path, &props_path, test_client(), 1, Arc::new(|| {})).unwrap();
        assert_eq!(stash.get_property("installed_version"), Some(PropertyValue::Int(3)));
    }

    #[test]
    fn test_snapshot_merge_persists_labels_across_reload() {
        let mut snapshot = ThingSnapshot::default();
        let mut labels = HashMap::new();
        labels.insert(String::new(), "Kitchen Sensor".to_string());
        let diff = ThingDiff {
            lid: "t1".into(),
            public: Some(true),
            tags: None,
            location: None,
            labels: Some(labels),
            descriptions: None,
            points: HashMap::new(),
        };
        snapshot.merge_diff(&diff);
        assert!(snapshot.public);
        assert_eq!(snapshot.labels.get(""), Some(&"Kitchen Sensor".to_string()));
    }

    #[test]
    fn test_migrate_legacy_json_folds_stray_keys_into_things() {
        let dir = tempfile::tempdir().unwrap();
        let legacy_path = dir.path().join("old.json");
        fs::write(
            &legacy_path,
            serde_json::json!({
                "LAT": 51.5,
                "LONG": -0.1,
                "t1": { "public": true, "labels": {}, "descriptions": {}, "tags": [], "points": {} }
            })
            .to_string(),
        )
        .unwrap();
        let file = migrate_legacy_json(&legacy_path).unwrap();
        assert!(file.things.contains_key("t1"));
        assert!(legacy_path.with_extension("json.old").exists());
        assert!(!legacy_path.exists());
    }

    #[test]
    fn test_point_kind_resource_codes_distinct() {
        assert_ne!(PointKind::Feed.resource_code(), PointKind::Control.resource_code());
    }
}
