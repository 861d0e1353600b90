//! Versioned snapshot and diff storage on top of a [`BlobStore`].
//!
//! # Key layout
//!
//! ```text
//! snapshots/<doc_id>/<timestamp>/content.txt
//! snapshots/<doc_id>/<timestamp>/raw.html          (optional)
//! snapshots/<doc_id>/<timestamp>/metadata.json
//! diffs/<doc_id>/<from_ts>_<to_ts>/diff.txt
//! diffs/<doc_id>/<from_ts>_<to_ts>/metadata.json
//! ```
//!
//! `metadata.json` is always written last and acts as the commit marker:
//! a snapshot or diff directory without it is ignored.
//!
//! # Index
//!
//! Each document gets a [`DocIndex`] the first time it is touched. The
//! index is loaded from the blob store and then kept current by this
//! store's own writes. It holds the ascending snapshot list, a
//! timestamp → position map and the diff metadata, so `current`, `last`,
//! `prev` and exact-timestamp lookups never rescan keys.
//!
//! Another process (a cron `tosmon fetch` next to `tosmon serve`) may write
//! to the same blob store. The index is reloaded from the blob store when a
//! writer guard is taken, when a lookup misses, and by
//! [`SnapshotStore::list_documents`] when the committed snapshot count on
//! storage differs from the index. A hit on `current` between those points
//! can lag behind another process's writes.
//!
//! Relative pointers are never stored. They are read off the end of the
//! ordered list on every call.
//!
//! # Writers
//!
//! All snapshot writes for one document go through its [`WriterGuard`]
//! (a per-document `tokio::sync::Mutex`). Diff writes and index reloads
//! take the same lock. Different documents never contend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::blob::BlobStore;
use crate::error::{MonitorError, Result};
use crate::models::{
    is_valid_doc_id, DiffMeta, DiffRecord, DocumentSummary, Selector, Snapshot, SnapshotMeta,
    Timestamp,
};

const SNAPSHOTS: &str = "snapshots";
const DIFFS: &str = "diffs";
const CONTENT_FILE: &str = "content.txt";
const RAW_FILE: &str = "raw.html";
const DIFF_FILE: &str = "diff.txt";
const METADATA_FILE: &str = "metadata.json";

pub fn snapshot_key(doc_id: &str, ts: Timestamp, file: &str) -> String {
    format!("{}/{}/{}/{}", SNAPSHOTS, doc_id, ts, file)
}

pub fn diff_key(doc_id: &str, from: Timestamp, to: Timestamp, file: &str) -> String {
    format!("{}/{}/{}_{}/{}", DIFFS, doc_id, from, to, file)
}

/// Snapshot metadata for one document, newest first.
///
/// Holds a shared reference to the index list as it was when the history
/// was taken; later writes do not change it. Iterate as many times as
/// needed.
#[derive(Debug, Clone)]
pub struct History {
    doc_id: String,
    entries: Arc<Vec<SnapshotMeta>>,
}

impl History {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn iter(&self) -> std::iter::Rev<std::slice::Iter<'_, SnapshotMeta>> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry `rank` places from the newest (0 = current).
    pub fn nth_newest(&self, rank: usize) -> Option<&SnapshotMeta> {
        self.entries.len().checked_sub(rank + 1).map(|i| &self.entries[i])
    }

    pub fn current(&self) -> Option<&SnapshotMeta> {
        self.nth_newest(0)
    }

    pub fn summary(&self) -> DocumentSummary {
        let current = self.nth_newest(0);
        let last = self.nth_newest(1);
        let changed = match (current, last) {
            (Some(c), Some(l)) => c.hashes.fingerprint_hash != l.hashes.fingerprint_hash,
            _ => false,
        };
        DocumentSummary {
            doc_id: self.doc_id.clone(),
            current: current.map(|m| m.timestamp),
            last: last.map(|m| m.timestamp),
            prev: self.nth_newest(2).map(|m| m.timestamp),
            changed,
            total: self.entries.len(),
        }
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a SnapshotMeta;
    type IntoIter = std::iter::Rev<std::slice::Iter<'a, SnapshotMeta>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Default)]
struct IndexState {
    /// Ascending by timestamp.
    snapshots: Arc<Vec<SnapshotMeta>>,
    positions: HashMap<Timestamp, usize>,
    diffs: BTreeMap<(Timestamp, Timestamp), DiffMeta>,
}

impl IndexState {
    fn resolve(&self, selector: Selector) -> Option<&SnapshotMeta> {
        match selector {
            Selector::Current | Selector::Last | Selector::Prev => {
                let rank = selector.rank()?;
                let len = self.snapshots.len();
                len.checked_sub(rank + 1).map(|i| &self.snapshots[i])
            }
            Selector::At(ts) => self.positions.get(&ts).map(|&i| &self.snapshots[i]),
            Selector::Day(day) => self.snapshots.iter().rev().find(|m| m.timestamp.date() == day),
        }
    }

    fn insert_snapshot(&mut self, meta: SnapshotMeta) {
        let position = self.snapshots.len();
        self.positions.insert(meta.timestamp, position);
        Arc::make_mut(&mut self.snapshots).push(meta);
    }
}

struct DocIndex {
    doc_id: String,
    writer: Arc<AsyncMutex<()>>,
    state: OnceCell<RwLock<IndexState>>,
}

impl DocIndex {
    fn new(doc_id: &str) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            writer: Arc::new(AsyncMutex::new(())),
            state: OnceCell::new(),
        }
    }

    async fn state(&self, blobs: &dyn BlobStore) -> Result<&RwLock<IndexState>> {
        self.state
            .get_or_try_init(|| async { load_index(blobs, &self.doc_id).await.map(RwLock::new) })
            .await
    }

    /// Replace the index with what is committed in the blob store. Callers
    /// hold `writer`.
    async fn reload(&self, blobs: &dyn BlobStore) -> Result<()> {
        if !self.state.initialized() {
            self.state(blobs).await?;
            return Ok(());
        }
        let fresh = load_index(blobs, &self.doc_id).await?;
        if let Some(state) = self.state.get() {
            *write(state)? = fresh;
        }
        Ok(())
    }

    async fn refresh(&self, blobs: &dyn BlobStore) -> Result<()> {
        let _lock = self.writer.lock().await;
        self.reload(blobs).await
    }
}

pub struct SnapshotStore {
    blobs: Arc<dyn BlobStore>,
    docs: Mutex<HashMap<String, Arc<DocIndex>>>,
}

impl SnapshotStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            docs: Mutex::new(HashMap::new()),
        }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    fn index(&self, doc_id: &str) -> Result<Arc<DocIndex>> {
        if !is_valid_doc_id(doc_id) {
            return Err(MonitorError::InvalidInput(format!(
                "invalid document id '{}'",
                doc_id
            )));
        }
        let mut docs = self
            .docs
            .lock()
            .map_err(|_| MonitorError::Storage("document index lock poisoned".to_string()))?;
        Ok(docs
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(DocIndex::new(doc_id)))
            .clone())
    }

    /// Ordered snapshot metadata, newest first.
    pub async fn get_history(&self, doc_id: &str) -> Result<History> {
        let index = self.index(doc_id)?;
        let state = index.state(self.blobs.as_ref()).await?;
        let entries = read(state)?.snapshots.clone();
        Ok(History {
            doc_id: doc_id.to_string(),
            entries,
        })
    }

    /// Metadata of the snapshot addressed by `selector`.
    pub async fn resolve(&self, doc_id: &str, selector: Selector) -> Result<SnapshotMeta> {
        let index = self.index(doc_id)?;
        let blobs = self.blobs.as_ref();
        let hit = read(index.state(blobs).await?)?.resolve(selector).cloned();
        if let Some(meta) = hit {
            return Ok(meta);
        }

        index.refresh(blobs).await?;
        let state = read(index.state(blobs).await?)?;
        state
            .resolve(selector)
            .cloned()
            .ok_or_else(|| not_found(doc_id, selector, state.snapshots.len()))
    }

    pub async fn get_snapshot(&self, doc_id: &str, selector: Selector) -> Result<Snapshot> {
        let meta = self.resolve(doc_id, selector).await?;
        let key = snapshot_key(doc_id, meta.timestamp, CONTENT_FILE);
        let bytes = self.blobs.get(&key).await?.ok_or_else(|| {
            MonitorError::Storage(format!("{} is committed but its content is missing", key))
        })?;
        let content = String::from_utf8(bytes)
            .map_err(|e| MonitorError::storage(format!("{} is not UTF-8", key), e))?;
        Ok(Snapshot { meta, content })
    }

    /// Raw page stored next to a snapshot, when one was kept.
    pub async fn get_raw(&self, doc_id: &str, selector: Selector) -> Result<Option<Vec<u8>>> {
        let meta = self.resolve(doc_id, selector).await?;
        match meta.raw_reference {
            Some(key) => self.blobs.get(&key).await,
            None => Ok(None),
        }
    }

    /// Acquire the writer guard for `doc_id`. Held across the decide and
    /// write steps of a fetch cycle.
    pub async fn writer(&self, doc_id: &str) -> Result<WriterGuard<'_>> {
        let index = self.index(doc_id)?;
        let lock = index.writer.clone().lock_owned().await;
        index.reload(self.blobs.as_ref()).await?;
        Ok(WriterGuard {
            store: self,
            index,
            _lock: lock,
        })
    }

    /// Append `snapshot` to the history of `doc_id`.
    pub async fn put_snapshot(&self, doc_id: &str, snapshot: Snapshot) -> Result<SnapshotMeta> {
        let guard = self.writer(doc_id).await?;
        guard.put(snapshot, None).await
    }

    /// Every document with at least one committed snapshot.
    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let keys = self.blobs.list(&format!("{}/", SNAPSHOTS)).await?;
        let mut committed: BTreeMap<&str, usize> = BTreeMap::new();
        for key in &keys {
            let mut parts = key.split('/');
            if let (Some(SNAPSHOTS), Some(doc), Some(_), Some(METADATA_FILE), None) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) {
                if is_valid_doc_id(doc) {
                    *committed.entry(doc).or_default() += 1;
                }
            }
        }

        let mut summaries = Vec::with_capacity(committed.len());
        for (doc_id, count) in committed {
            let mut history = self.get_history(doc_id).await?;
            if history.len() != count {
                self.index(doc_id)?.refresh(self.blobs.as_ref()).await?;
                history = self.get_history(doc_id).await?;
            }
            summaries.push(history.summary());
        }
        Ok(summaries)
    }

    // ============ Diff namespace ============

    pub async fn get_diff(
        &self,
        doc_id: &str,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Option<DiffRecord>> {
        let index = self.index(doc_id)?;
        let blobs = self.blobs.as_ref();
        let mut meta = read(index.state(blobs).await?)?.diffs.get(&(from, to)).cloned();
        if meta.is_none() {
            index.refresh(blobs).await?;
            meta = read(index.state(blobs).await?)?.diffs.get(&(from, to)).cloned();
        }
        match meta {
            Some(meta) => self.load_diff_text(meta).await.map(Some),
            None => Ok(None),
        }
    }

    /// The most recently generated diff for `doc_id`.
    pub async fn latest_diff(&self, doc_id: &str) -> Result<DiffRecord> {
        let mut meta = self.list_diffs(doc_id).await?.into_iter().next();
        if meta.is_none() {
            self.index(doc_id)?.refresh(self.blobs.as_ref()).await?;
            meta = self.list_diffs(doc_id).await?.into_iter().next();
        }
        match meta {
            Some(meta) => self.load_diff_text(meta).await,
            None => Err(MonitorError::NotFound(format!(
                "no diffs stored for document '{}'",
                doc_id
            ))),
        }
    }

    /// Metadata of every stored diff, newest `generated_at` first.
    pub async fn list_diffs(&self, doc_id: &str) -> Result<Vec<DiffMeta>> {
        let index = self.index(doc_id)?;
        let state = index.state(self.blobs.as_ref()).await?;
        let mut metas: Vec<DiffMeta> = read(state)?.diffs.values().cloned().collect();
        metas.sort_by(|a, b| {
            b.generated_at
                .cmp(&a.generated_at)
                .then(b.to_timestamp.cmp(&a.to_timestamp))
        });
        Ok(metas)
    }

    /// Store a diff record. An existing record for the same pair is
    /// replaced as a whole.
    pub async fn put_diff(&self, record: &DiffRecord) -> Result<()> {
        let meta = &record.meta;
        if meta.from_timestamp >= meta.to_timestamp {
            return Err(MonitorError::InvalidInput(format!(
                "diff must compare an older snapshot with a newer one (got {} -> {})",
                meta.from_timestamp, meta.to_timestamp
            )));
        }
        let index = self.index(&meta.doc_id)?;
        let _lock = index.writer.lock().await;
        let state = index.state(self.blobs.as_ref()).await?;

        let (from, to) = (meta.from_timestamp, meta.to_timestamp);
        self.blobs
            .put(
                &diff_key(&meta.doc_id, from, to, DIFF_FILE),
                record.summary_text.as_bytes(),
            )
            .await?;
        self.blobs
            .put(
                &diff_key(&meta.doc_id, from, to, METADATA_FILE),
                &serde_json::to_vec_pretty(meta)?,
            )
            .await?;

        write(state)?.diffs.insert((from, to), meta.clone());
        debug!(doc_id = %meta.doc_id, from = %from, to = %to, "stored diff");
        Ok(())
    }

    async fn load_diff_text(&self, meta: DiffMeta) -> Result<DiffRecord> {
        let key = diff_key(&meta.doc_id, meta.from_timestamp, meta.to_timestamp, DIFF_FILE);
        let bytes = self.blobs.get(&key).await?.ok_or_else(|| {
            MonitorError::Storage(format!("{} is committed but its text is missing", key))
        })?;
        let summary_text = String::from_utf8(bytes)
            .map_err(|e| MonitorError::storage(format!("{} is not UTF-8", key), e))?;
        Ok(DiffRecord { meta, summary_text })
    }
}

/// Exclusive write access to one document's history.
pub struct WriterGuard<'a> {
    store: &'a SnapshotStore,
    index: Arc<DocIndex>,
    _lock: OwnedMutexGuard<()>,
}

impl WriterGuard<'_> {
    pub fn doc_id(&self) -> &str {
        &self.index.doc_id
    }

    fn state(&self) -> Result<&RwLock<IndexState>> {
        // Loaded by `SnapshotStore::writer` before the guard is handed out.
        self.index
            .state
            .get()
            .ok_or_else(|| MonitorError::Storage("document index not loaded".to_string()))
    }

    /// The newest committed snapshot.
    pub fn current(&self) -> Result<Option<SnapshotMeta>> {
        Ok(read(self.state()?)?.snapshots.last().cloned())
    }

    /// A fresh timestamp strictly after the current snapshot's.
    pub fn next_timestamp(&self) -> Result<Timestamp> {
        let now = Timestamp::now();
        Ok(match self.current()? {
            Some(current) if now <= current.timestamp => current.timestamp.next_after(),
            _ => now,
        })
    }

    /// Write `snapshot` (and optionally the raw page) and advance the
    /// index. Rejects timestamps that are not strictly after `current`.
    pub async fn put(&self, mut snapshot: Snapshot, raw: Option<&str>) -> Result<SnapshotMeta> {
        let doc_id = self.index.doc_id.as_str();
        if snapshot.meta.doc_id != doc_id {
            return Err(MonitorError::InvalidInput(format!(
                "snapshot for '{}' written under '{}'",
                snapshot.meta.doc_id, doc_id
            )));
        }
        let ts = snapshot.meta.timestamp;
        let state = self.state()?;

        {
            let state = read(state)?;
            if state.positions.contains_key(&ts) {
                error!(
                    doc_id,
                    timestamp = %ts,
                    "snapshot timestamp collision, refusing to overwrite"
                );
                return Err(MonitorError::Conflict(format!(
                    "snapshot already exists for '{}' at {}",
                    doc_id, ts
                )));
            }
            if let Some(current) = state.snapshots.last() {
                if ts <= current.timestamp {
                    error!(
                        doc_id,
                        timestamp = %ts,
                        current = %current.timestamp,
                        "out-of-order snapshot write"
                    );
                    return Err(MonitorError::Conflict(format!(
                        "snapshot for '{}' at {} is not after current {}",
                        doc_id, ts, current.timestamp
                    )));
                }
            }
        }

        let blobs = self.store.blobs.as_ref();
        blobs
            .put(
                &snapshot_key(doc_id, ts, CONTENT_FILE),
                snapshot.content.as_bytes(),
            )
            .await?;
        if let Some(raw) = raw {
            let key = snapshot_key(doc_id, ts, RAW_FILE);
            blobs.put(&key, raw.as_bytes()).await?;
            snapshot.meta.raw_reference = Some(key);
        }
        blobs
            .put(
                &snapshot_key(doc_id, ts, METADATA_FILE),
                &serde_json::to_vec_pretty(&snapshot.meta)?,
            )
            .await?;

        write(state)?.insert_snapshot(snapshot.meta.clone());
        debug!(doc_id, timestamp = %ts, "stored snapshot");
        Ok(snapshot.meta)
    }
}

async fn load_index(blobs: &dyn BlobStore, doc_id: &str) -> Result<IndexState> {
    let mut state = IndexState::default();

    let prefix = format!("{}/{}/", SNAPSHOTS, doc_id);
    let mut snapshots = Vec::new();
    for key in blobs.list(&prefix).await? {
        let Some(ts) = committed_segment(&key, &prefix) else {
            continue;
        };
        let Ok(ts) = ts.parse::<Timestamp>() else {
            warn!(key = %key, "ignoring snapshot with unparseable timestamp");
            continue;
        };
        let Some(bytes) = blobs.get(&key).await? else {
            continue;
        };
        let meta: SnapshotMeta = serde_json::from_slice(&bytes)
            .map_err(|e| MonitorError::storage(format!("malformed {}", key), e))?;
        if meta.doc_id != doc_id || meta.timestamp != ts {
            warn!(key = %key, "ignoring snapshot whose metadata does not match its key");
            continue;
        }
        snapshots.push(meta);
    }
    snapshots.sort_by_key(|m| m.timestamp);
    snapshots.dedup_by_key(|m| m.timestamp);
    for meta in snapshots {
        state.insert_snapshot(meta);
    }

    let prefix = format!("{}/{}/", DIFFS, doc_id);
    for key in blobs.list(&prefix).await? {
        if committed_segment(&key, &prefix).is_none() {
            continue;
        }
        let Some(bytes) = blobs.get(&key).await? else {
            continue;
        };
        let meta: DiffMeta = serde_json::from_slice(&bytes)
            .map_err(|e| MonitorError::storage(format!("malformed {}", key), e))?;
        state
            .diffs
            .insert((meta.from_timestamp, meta.to_timestamp), meta);
    }

    debug!(
        doc_id,
        snapshots = state.snapshots.len(),
        diffs = state.diffs.len(),
        "loaded document index"
    );
    Ok(state)
}

/// `<prefix><segment>/metadata.json` → `segment`.
fn committed_segment<'k>(key: &'k str, prefix: &str) -> Option<&'k str> {
    let rest = key.strip_prefix(prefix)?;
    let (segment, file) = rest.split_once('/')?;
    (file == METADATA_FILE).then_some(segment)
}

fn not_found(doc_id: &str, selector: Selector, total: usize) -> MonitorError {
    match selector {
        Selector::Current | Selector::Last | Selector::Prev => MonitorError::NotFound(format!(
            "document '{}' has no '{}' snapshot ({} stored)",
            doc_id, selector, total
        )),
        Selector::At(ts) => {
            MonitorError::NotFound(format!("document '{}' has no snapshot at {}", doc_id, ts))
        }
        Selector::Day(_) => MonitorError::NotFound(format!(
            "document '{}' has no snapshot on {}",
            doc_id, selector
        )),
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| MonitorError::Storage("document index lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| MonitorError::Storage("document index lock poisoned".to_string()))
}
