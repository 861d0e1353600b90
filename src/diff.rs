//! Diff orchestration: pick a snapshot pair, build the prompt, call the
//! summarizer and store the result.
//!
//! Defaults compare `prev` with `last`, leaving the newest snapshot out
//! until a later one supersedes it. A stored record for the resolved pair
//! is returned as-is unless regeneration is forced, so repeated requests
//! never pay for a second summarizer call.
//!
//! Prompt templates are looked up in the blob store, first
//! `prompts/<doc_id>.txt`, then `prompts/default_comparison.txt`, and
//! finally [`BUILTIN_TEMPLATE`]. The chosen source is recorded in
//! `prompt_used`.
//!
//! A summarizer failure or timeout stores nothing.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{MonitorError, Result};
use crate::models::{DiffMeta, DiffRecord, DiffSelector, Selector, SnapshotMeta};
use crate::snapshot_store::SnapshotStore;
use crate::summarize::{render_prompt, PromptContext, Summarizer, BUILTIN_TEMPLATE};

pub const DEFAULT_PROMPT_KEY: &str = "prompts/default_comparison.txt";
pub const BUILTIN_PROMPT: &str = "builtin";

/// Each snapshot's content is cut to this many characters in the prompt.
pub const MAX_PROMPT_CONTENT_CHARS: usize = 15_000;

pub fn prompt_key(doc_id: &str) -> String {
    format!("prompts/{}.txt", doc_id)
}

#[derive(Debug, Clone, Default)]
pub struct DiffRequest {
    /// Defaults to `prev`.
    pub from: Option<Selector>,
    /// Defaults to `last`.
    pub to: Option<Selector>,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub enum DiffOutcome {
    Cached(DiffRecord),
    Generated(DiffRecord),
}

impl DiffOutcome {
    pub fn record(&self) -> &DiffRecord {
        match self {
            DiffOutcome::Cached(r) | DiffOutcome::Generated(r) => r,
        }
    }

    pub fn into_record(self) -> DiffRecord {
        match self {
            DiffOutcome::Cached(r) | DiffOutcome::Generated(r) => r,
        }
    }

    pub fn was_cached(&self) -> bool {
        matches!(self, DiffOutcome::Cached(_))
    }
}

pub struct DiffOrchestrator {
    store: Arc<SnapshotStore>,
    summarizer: Arc<dyn Summarizer>,
    deadline: Duration,
}

impl DiffOrchestrator {
    pub fn new(
        store: Arc<SnapshotStore>,
        summarizer: Arc<dyn Summarizer>,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            summarizer,
            deadline,
        }
    }

    pub fn summarizer(&self) -> &Arc<dyn Summarizer> {
        &self.summarizer
    }

    /// Round trip to the summarizer backend under the summarization
    /// deadline.
    pub async fn check_summarizer(&self) -> Result<()> {
        match tokio::time::timeout(self.deadline, self.summarizer.check()).await {
            Ok(result) => result,
            Err(_) => Err(MonitorError::Summarization(format!(
                "summarizer check did not answer within {:?}",
                self.deadline
            ))),
        }
    }

    /// Compare two snapshots of `doc_id`.
    ///
    /// Fails with `NotFound` when either selector has no snapshot, which
    /// is the normal state of a document with fewer than three snapshots
    /// under the default selectors.
    pub async fn generate_diff(
        &self,
        doc_id: &str,
        document_name: Option<&str>,
        request: &DiffRequest,
    ) -> Result<DiffOutcome> {
        let from = self
            .store
            .resolve(doc_id, request.from.unwrap_or(Selector::Prev))
            .await?;
        let to = self
            .store
            .resolve(doc_id, request.to.unwrap_or(Selector::Last))
            .await?;
        if from.timestamp >= to.timestamp {
            return Err(MonitorError::InvalidInput(format!(
                "'from' ({}) must be older than 'to' ({})",
                from.timestamp, to.timestamp
            )));
        }

        if !request.force {
            if let Some(cached) = self.store.get_diff(doc_id, from.timestamp, to.timestamp).await? {
                info!(doc_id, from = %from.timestamp, to = %to.timestamp, "returning cached diff");
                return Ok(DiffOutcome::Cached(cached));
            }
        }

        let previous = self
            .store
            .get_snapshot(doc_id, Selector::At(from.timestamp))
            .await?;
        let current = self
            .store
            .get_snapshot(doc_id, Selector::At(to.timestamp))
            .await?;

        let (template, prompt_used) = self.load_prompt(doc_id).await?;
        let name = document_name
            .or(from.document_name.as_deref())
            .unwrap_or(doc_id);
        let from_key = from.timestamp.to_string();
        let to_key = to.timestamp.to_string();
        let previous_text = truncate_chars(&previous.content, MAX_PROMPT_CONTENT_CHARS);
        let current_text = truncate_chars(&current.content, MAX_PROMPT_CONTENT_CHARS);
        let metadata = prompt_metadata(&from, &to);
        let prompt = render_prompt(
            &template,
            &PromptContext {
                document_name: name,
                document_id: doc_id,
                previous_timestamp: &from_key,
                current_timestamp: &to_key,
                previous_content: &previous_text,
                current_content: &current_text,
                metadata: &metadata,
            },
        );

        let reply = tokio::time::timeout(self.deadline, self.summarizer.summarize(&prompt)).await;
        let summary_text = match reply {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => {
                return Err(MonitorError::Summarization(
                    "summarizer returned an empty summary".to_string(),
                ))
            }
            Ok(Err(e)) => {
                warn!(doc_id, error = %e, "summarization failed");
                return Err(e);
            }
            Err(_) => {
                warn!(doc_id, deadline = ?self.deadline, "summarization timed out");
                return Err(MonitorError::Summarization(format!(
                    "summarizer did not answer within {:?}",
                    self.deadline
                )));
            }
        };

        let record = DiffRecord {
            meta: DiffMeta {
                doc_id: doc_id.to_string(),
                document_name: Some(name.to_string()),
                from_timestamp: from.timestamp,
                to_timestamp: to.timestamp,
                generated_at: Utc::now(),
                prompt_used,
                model: self.summarizer.model_name().to_string(),
                substantive: from.hashes.fingerprint_hash != to.hashes.fingerprint_hash,
            },
            summary_text,
        };
        self.store.put_diff(&record).await?;
        info!(
            doc_id,
            from = %from.timestamp,
            to = %to.timestamp,
            prompt = %record.meta.prompt_used,
            "generated diff"
        );
        Ok(DiffOutcome::Generated(record))
    }

    /// A stored diff: the latest one, or the one for an exact pair.
    pub async fn get_diff(&self, doc_id: &str, selector: DiffSelector) -> Result<DiffRecord> {
        match selector {
            DiffSelector::Latest => self.store.latest_diff(doc_id).await,
            DiffSelector::Pair(from, to) => {
                self.store.get_diff(doc_id, from, to).await?.ok_or_else(|| {
                    MonitorError::NotFound(format!(
                        "no diff stored for '{}' between {} and {}",
                        doc_id, from, to
                    ))
                })
            }
        }
    }

    async fn load_prompt(&self, doc_id: &str) -> Result<(String, String)> {
        let blobs = self.store.blobs();
        for key in [prompt_key(doc_id), DEFAULT_PROMPT_KEY.to_string()] {
            let Some(bytes) = blobs.get(&key).await? else {
                continue;
            };
            let template = String::from_utf8(bytes)
                .map_err(|e| MonitorError::storage(format!("{} is not UTF-8", key), e))?;
            if template.trim().is_empty() {
                warn!(key = %key, "ignoring empty prompt template");
                continue;
            }
            return Ok((template, key));
        }
        warn!(doc_id, "no prompt template stored, using built-in fallback");
        Ok((BUILTIN_TEMPLATE.to_string(), BUILTIN_PROMPT.to_string()))
    }
}

fn truncate_chars(text: &str, max: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max) {
        Some((idx, _)) => Cow::Owned(format!("{}...[truncated]", &text[..idx])),
        None => Cow::Borrowed(text),
    }
}

/// `key: value` lines describing the pair, for the `{metadata}` placeholder.
fn prompt_metadata(from: &SnapshotMeta, to: &SnapshotMeta) -> String {
    let mut lines = Vec::new();
    if let Some(url) = to.url.as_deref().or(from.url.as_deref()) {
        lines.push(format!("url: {}", url));
    }
    if let Some(title) = to.title.as_deref() {
        lines.push(format!("title: {}", title));
    }
    lines.push(format!("previous_timestamp: {}", from.timestamp));
    lines.push(format!("current_timestamp: {}", to.timestamp));
    lines.push(format!("previous_length: {}", from.content_length));
    lines.push(format!("current_length: {}", to.content_length));
    if let Some(change) = to.change {
        lines.push(format!("change: {}", change.as_str()));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::blob::{BlobStore, MemoryBlobStore};
    use crate::models::{Snapshot, Timestamp};

    struct Recorder {
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl Summarizer for Recorder {
        async fn summarize(&self, prompt: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail {
                return Err(MonitorError::Summarization("quota exceeded".into()));
            }
            Ok(format!("summary #{}", n))
        }

        fn model_name(&self) -> &str {
            "recorder"
        }
    }

    struct Slow;

    #[async_trait]
    impl Summarizer for Slow {
        async fn summarize(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }

        fn model_name(&self) -> &str {
            "slow"
        }
    }

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    const T1: &str = "2024-05-01T00-00-00-000000Z";
    const T2: &str = "2024-05-02T00-00-00-000000Z";
    const T3: &str = "2024-05-03T00-00-00-000000Z";

    async fn seeded(texts: &[&str]) -> Arc<SnapshotStore> {
        let store = Arc::new(SnapshotStore::new(Arc::new(MemoryBlobStore::new())));
        for (at, text) in [T1, T2, T3].iter().zip(texts) {
            store
                .put_snapshot("tos", Snapshot::from_text("tos", ts(at), text))
                .await
                .unwrap();
        }
        store
    }

    fn orchestrator(store: &Arc<SnapshotStore>, s: Arc<dyn Summarizer>) -> DiffOrchestrator {
        DiffOrchestrator::new(store.clone(), s, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn defaults_compare_prev_and_last() {
        let store = seeded(&["alpha terms", "beta terms", "gamma terms"]).await;
        let rec = Recorder::new(false);
        let diff = orchestrator(&store, rec.clone())
            .generate_diff("tos", Some("Acme"), &DiffRequest::default())
            .await
            .unwrap();
        let record = diff.record();
        assert_eq!(record.meta.from_timestamp, ts(T1));
        assert_eq!(record.meta.to_timestamp, ts(T2));
        assert_eq!(record.meta.prompt_used, BUILTIN_PROMPT);
        assert_eq!(record.meta.model, "recorder");
        assert!(record.meta.substantive);

        let prompt = rec.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("alpha terms"));
        assert!(prompt.contains("beta terms"));
        assert!(!prompt.contains("gamma terms"));
        assert!(prompt.contains("\"Acme\""));
    }

    #[tokio::test]
    async fn cached_pair_skips_summarizer() {
        let store = seeded(&["a1", "b2", "c3"]).await;
        let rec = Recorder::new(false);
        let orch = orchestrator(&store, rec.clone());

        let first = orch.generate_diff("tos", None, &DiffRequest::default()).await.unwrap();
        let second = orch.generate_diff("tos", None, &DiffRequest::default()).await.unwrap();
        assert!(!first.was_cached());
        assert!(second.was_cached());
        assert_eq!(first.record(), second.record());
        assert_eq!(rec.calls.load(Ordering::SeqCst), 1);

        let forced = orch
            .generate_diff(
                "tos",
                None,
                &DiffRequest {
                    force: true,
                    ..DiffRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(forced.record().summary_text, "summary #2");
        assert_eq!(rec.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            orch.get_diff("tos", DiffSelector::Latest).await.unwrap().summary_text,
            "summary #2"
        );
        assert_eq!(store.list_diffs("tos").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn not_enough_history_is_not_found() {
        let store = seeded(&["only one"]).await;
        let rec = Recorder::new(false);
        let err = orchestrator(&store, rec.clone())
            .generate_diff("tos", None, &DiffRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::NotFound(_)));
        assert_eq!(rec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn explicit_selectors_and_ordering() {
        let store = seeded(&["a1", "b2", "c3"]).await;
        let orch = orchestrator(&store, Recorder::new(false));
        let diff = orch
            .generate_diff(
                "tos",
                None,
                &DiffRequest {
                    from: Some(Selector::At(ts(T1))),
                    to: Some(Selector::Current),
                    force: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(diff.record().meta.to_timestamp, ts(T3));

        let backwards = orch
            .generate_diff(
                "tos",
                None,
                &DiffRequest {
                    from: Some(Selector::Current),
                    to: Some(Selector::Prev),
                    force: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(backwards, MonitorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn failures_store_nothing() {
        let store = seeded(&["a1", "b2", "c3"]).await;
        let err = orchestrator(&store, Recorder::new(true))
            .generate_diff("tos", None, &DiffRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Summarization(_)));

        let orch = DiffOrchestrator::new(store.clone(), Arc::new(Slow), Duration::from_millis(50));
        let err = orch
            .generate_diff("tos", None, &DiffRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Summarization(_)));

        assert!(store.list_diffs("tos").await.unwrap().is_empty());
        assert!(store.blobs().list("diffs/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prompt_lookup_order() {
        let store = seeded(&["a1", "b2", "c3"]).await;
        let rec = Recorder::new(false);
        let orch = orchestrator(&store, rec.clone());

        store
            .blobs()
            .put(
                DEFAULT_PROMPT_KEY,
                b"DEFAULT {document_id}: {previous_content} | {current_content}",
            )
            .await
            .unwrap();
        let d = orch.generate_diff("tos", None, &DiffRequest::default()).await.unwrap();
        assert_eq!(d.record().meta.prompt_used, DEFAULT_PROMPT_KEY);
        assert_eq!(rec.prompts.lock().unwrap()[0], "DEFAULT tos: a1 | b2");

        store
            .blobs()
            .put(&prompt_key("tos"), b"CUSTOM {document_name}")
            .await
            .unwrap();
        let d = orch
            .generate_diff(
                "tos",
                None,
                &DiffRequest {
                    force: true,
                    ..DiffRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(d.record().meta.prompt_used, "prompts/tos.txt");
        assert_eq!(rec.prompts.lock().unwrap()[1], "CUSTOM tos");
    }

    #[tokio::test]
    async fn metadata_placeholder_describes_the_pair() {
        let store = seeded(&["a1", "bb22"]).await;
        let rec = Recorder::new(false);
        store
            .blobs()
            .put(DEFAULT_PROMPT_KEY, b"{document_id}\n{metadata}")
            .await
            .unwrap();
        orchestrator(&store, rec.clone())
            .generate_diff("tos", None, &DiffRequest::default())
            .await
            .unwrap();
        let prompt = rec.prompts.lock().unwrap()[0].clone();
        assert_eq!(
            prompt,
            format!(
                "tos\nprevious_timestamp: {}\ncurrent_timestamp: {}\n\
                 previous_length: 2\ncurrent_length: 4",
                T1, T2
            )
        );
    }

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé...[truncated]");
    }
}
