//! Cycle orchestration: fetch → normalize → hash → decide → persist, and
//! the batch diff cycle on top of the [`DiffOrchestrator`].
//!
//! A [`Monitor`] owns the collaborators (blob-backed snapshot store,
//! fetcher, normalizer, summarizer) and exposes every operation the CLI
//! and the HTTP server map onto.
//!
//! # Per-document isolation
//!
//! Documents of a cycle run concurrently, at most `fetch.concurrency` at a
//! time. Every error for one document is caught and reported in that
//! document's [`DocStatus`]; it never aborts the rest of the cycle.
//!
//! # Locking
//!
//! The fetch runs under `fetch.deadline_secs` and outside any lock. Only
//! the decide-and-write step holds the document's writer guard, and the
//! snapshot timestamp is minted inside it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSetBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blob::{open_blob_store, BlobStore};
use crate::config::Config;
use crate::detector::{self, ChangeState, Policy, Tier};
use crate::diff::{DiffOrchestrator, DiffOutcome, DiffRequest, DEFAULT_PROMPT_KEY};
use crate::error::{MonitorError, Result};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::models::{
    DiffMeta, DiffRecord, DiffSelector, DocumentConfig, DocumentList, DocumentSummary, Selector,
    Snapshot, SnapshotMeta, Timestamp,
};
use crate::normalize::{Normalizer, TextNormalizer};
use crate::snapshot_store::SnapshotStore;
use crate::summarize::{create_summarizer, Summarizer, BUILTIN_TEMPLATE};

pub const DOCUMENTS_KEY: &str = "config/documents.json";

// ============ Scope ============

/// Which configured documents a cycle touches.
///
/// Each pattern is either an exact document id or a glob (`*`, `?`, `[`,
/// `{`). An empty scope selects every configured document.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    patterns: Vec<String>,
}

impl Scope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_all(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The selected documents in configuration order.
    pub fn select<'a>(&self, list: &'a DocumentList) -> Result<Vec<&'a DocumentConfig>> {
        if self.patterns.is_empty() {
            return Ok(list.documents.iter().collect());
        }

        let mut builder = GlobSetBuilder::new();
        let mut ids = Vec::new();
        for pattern in &self.patterns {
            if pattern.contains(['*', '?', '[', '{']) {
                let glob = Glob::new(pattern).map_err(|e| {
                    MonitorError::InvalidInput(format!("invalid pattern '{}': {}", pattern, e))
                })?;
                builder.add(glob);
            } else if list.find(pattern).is_some() {
                ids.push(pattern.as_str());
            } else {
                return Err(MonitorError::InvalidInput(format!(
                    "unknown document id '{}'",
                    pattern
                )));
            }
        }
        let globs = builder
            .build()
            .map_err(|e| MonitorError::InvalidInput(format!("invalid patterns: {}", e)))?;

        Ok(list
            .documents
            .iter()
            .filter(|d| ids.contains(&d.id.as_str()) || globs.is_match(&d.id))
            .collect())
    }
}

// ============ Reports ============

/// Outcome for one document in a batch cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocStatus {
    /// A new snapshot was written.
    Stored {
        timestamp: Timestamp,
        change: ChangeState,
        #[serde(skip_serializing_if = "Option::is_none")]
        tier: Option<Tier>,
    },
    /// A diff was generated by the summarizer.
    Generated { from: Timestamp, to: Timestamp },
    /// The diff for the pair already existed.
    Cached { from: Timestamp, to: Timestamp },
    /// Nothing to do.
    Skipped {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        change: Option<ChangeState>,
    },
    Failed { code: String, message: String },
}

impl DocStatus {
    fn failed(err: &MonitorError) -> Self {
        DocStatus::Failed {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DocStatus::Failed { .. })
    }

    /// Whether this outcome wrote something new.
    pub fn is_write(&self) -> bool {
        matches!(self, DocStatus::Stored { .. } | DocStatus::Generated { .. })
    }
}

/// Per-document status map for a fetch or diff cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Snapshots stored (fetch cycle) or diffs generated (diff cycle).
    pub written: usize,
    pub elapsed_ms: u64,
    pub documents: BTreeMap<String, DocStatus>,
}

impl CycleReport {
    fn new(documents: BTreeMap<String, DocStatus>, started: Instant) -> Self {
        let failed = documents.values().filter(|s| s.is_failed()).count();
        Self {
            processed: documents.len(),
            succeeded: documents.len() - failed,
            failed,
            written: documents.values().filter(|s| s.is_write()).count(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            documents,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// One row of `list_documents`.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentOverview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Listed in `config/documents.json`.
    pub configured: bool,
    #[serde(flatten)]
    pub summary: DocumentSummary,
}

/// Everything known about one document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<DocumentConfig>,
    pub summary: DocumentSummary,
    /// Newest first.
    pub history: Vec<SnapshotMeta>,
    /// Newest `generated_at` first.
    pub diffs: Vec<DiffMeta>,
}

/// One row of [`Monitor::diff_overview`].
#[derive(Debug, Clone, Serialize)]
pub struct DiffOverview {
    pub doc_id: String,
    pub name: String,
    pub url: String,
    pub has_diff: bool,
    /// Newest stored diff by `generated_at`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<DiffMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Healthy,
    Disabled,
    Unhealthy,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Healthy => "healthy",
            CheckStatus::Disabled => "disabled",
            CheckStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Result of [`Monitor::health`]. Unhealthy when any check is.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: CheckStatus,
    pub version: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: BTreeMap<&'static str, HealthCheck>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status != CheckStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InitReport {
    pub written: Vec<String>,
    pub kept: Vec<String>,
}

// ============ Monitor ============

pub struct Monitor {
    config: Config,
    store: Arc<SnapshotStore>,
    fetcher: Arc<dyn Fetcher>,
    normalizer: Arc<dyn Normalizer>,
    diffs: DiffOrchestrator,
}

impl Monitor {
    pub fn new(
        config: Config,
        blobs: Arc<dyn BlobStore>,
        fetcher: Arc<dyn Fetcher>,
        normalizer: Arc<dyn Normalizer>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let store = Arc::new(SnapshotStore::new(blobs));
        let diffs = DiffOrchestrator::new(
            store.clone(),
            summarizer,
            Duration::from_secs(config.summarizer.deadline_secs),
        );
        Self {
            config,
            store,
            fetcher,
            normalizer,
            diffs,
        }
    }

    /// Wire up the production collaborators selected by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let blobs = open_blob_store(&config.storage)?;
        let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
        let summarizer = create_summarizer(&config.summarizer)?;
        Ok(Self::new(
            config.clone(),
            blobs,
            fetcher,
            Arc::new(TextNormalizer),
            summarizer,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    fn policy(&self) -> Policy {
        Policy {
            persist_on_cosmetic: self.config.detection.persist_on_cosmetic,
        }
    }

    /// Read and validate `config/documents.json`.
    pub async fn load_documents(&self) -> Result<DocumentList> {
        let bytes = self.store.blobs().get(DOCUMENTS_KEY).await?.ok_or_else(|| {
            MonitorError::Config(format!(
                "{} not found in storage (run `tosmon init --documents <file>`)",
                DOCUMENTS_KEY
            ))
        })?;
        DocumentList::from_json(&bytes)
    }

    async fn try_load_documents(&self) -> Result<Option<DocumentList>> {
        match self.store.blobs().get(DOCUMENTS_KEY).await? {
            Some(bytes) => DocumentList::from_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    // ============ Fetch cycle ============

    /// Fetch every document in `scope` and persist the ones that changed.
    pub async fn run_fetch_cycle(&self, scope: &Scope, force: bool) -> Result<CycleReport> {
        let started = Instant::now();
        let list = self.load_documents().await?;
        let docs = scope.select(&list)?;
        info!(documents = docs.len(), force, "starting fetch cycle");

        let tasks: Vec<_> = docs
            .into_iter()
            .map(|doc| async move {
                let status = match self.fetch_document(doc, force).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(doc_id = %doc.id, error = %e, "fetch failed");
                        DocStatus::failed(&e)
                    }
                };
                (doc.id.clone(), status)
            }
            .boxed())
            .collect();
        let documents: BTreeMap<String, DocStatus> = stream::iter(tasks)
            .buffer_unordered(self.config.fetch.concurrency)
            .collect()
            .await;

        let report = CycleReport::new(documents, started);
        info!(
            processed = report.processed,
            stored = report.written,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "fetch cycle finished"
        );
        Ok(report)
    }

    /// One document's fetch → normalize → hash → decide → persist pass.
    pub async fn fetch_document(&self, doc: &DocumentConfig, force: bool) -> Result<DocStatus> {
        let deadline = Duration::from_secs(self.config.fetch.deadline_secs);
        let fetch = self.fetcher.fetch(&doc.url, doc.selector.as_deref());
        let page = tokio::time::timeout(deadline, fetch)
            .await
            .map_err(|_| {
                MonitorError::Fetch(format!("{} did not complete within {:?}", doc.url, deadline))
            })??;

        let content = self.normalizer.normalize(&page.text);
        if content.trim().is_empty() {
            return Err(MonitorError::Fetch(format!(
                "{} produced no text after normalization",
                doc.url
            )));
        }
        // Provisional timestamp; the real one is minted under the writer guard.
        let mut snapshot = Snapshot::from_text(&doc.id, Timestamp::now(), &content);

        let guard = self.store.writer(&doc.id).await?;
        let current = guard.current()?;
        let decision = detector::evaluate(
            current.as_ref().map(|m| &m.hashes),
            &snapshot.meta.hashes,
            force,
            self.policy(),
        );
        debug!(
            doc_id = %doc.id,
            state = ?decision.state,
            tier = ?decision.tier,
            persist = decision.persist,
            "classified"
        );

        if !decision.persist {
            info!(doc_id = %doc.id, state = ?decision.state, "no snapshot stored");
            let reason = match decision.state {
                ChangeState::Unchanged => "content unchanged",
                _ => "formatting-only change",
            };
            return Ok(DocStatus::Skipped {
                reason: reason.to_string(),
                change: Some(decision.state),
            });
        }

        snapshot.meta.timestamp = guard.next_timestamp()?;
        snapshot.meta.document_name = Some(doc.name.clone());
        snapshot.meta.url = Some(doc.url.clone());
        snapshot.meta.title = page.title;
        snapshot.meta.change = Some(decision.state);
        snapshot.meta.tier = decision.tier;
        let raw = self.config.fetch.keep_raw.then_some(page.raw.as_str());

        let meta = guard.put(snapshot, raw).await?;
        info!(
            doc_id = %doc.id,
            timestamp = %meta.timestamp,
            state = ?decision.state,
            "stored snapshot"
        );
        Ok(DocStatus::Stored {
            timestamp: meta.timestamp,
            change: decision.state,
            tier: decision.tier,
        })
    }

    // ============ Diffs ============

    /// Request a diff for one document. The display name comes from the
    /// document configuration when it is available.
    pub async fn generate_diff(&self, doc_id: &str, request: &DiffRequest) -> Result<DiffOutcome> {
        let list = self.try_load_documents().await?;
        let name = list.as_ref().and_then(|l| l.find(doc_id)).map(|d| d.name.as_str());
        self.diffs.generate_diff(doc_id, name, request).await
    }

    /// Diff the `prev`/`last` pair of every document in `scope`.
    pub async fn run_diff_cycle(&self, scope: &Scope, force: bool) -> Result<CycleReport> {
        let started = Instant::now();
        let list = self.load_documents().await?;
        let docs = scope.select(&list)?;
        info!(documents = docs.len(), force, "starting diff cycle");

        let tasks: Vec<_> = docs
            .into_iter()
            .map(|doc| async move {
                let status = match self.diff_document(doc, force).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(doc_id = %doc.id, error = %e, "diff failed");
                        DocStatus::failed(&e)
                    }
                };
                (doc.id.clone(), status)
            }
            .boxed())
            .collect();
        let documents: BTreeMap<String, DocStatus> = stream::iter(tasks)
            .buffer_unordered(self.config.fetch.concurrency)
            .collect()
            .await;

        let report = CycleReport::new(documents, started);
        info!(
            processed = report.processed,
            generated = report.written,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "diff cycle finished"
        );
        Ok(report)
    }

    async fn diff_document(&self, doc: &DocumentConfig, force: bool) -> Result<DocStatus> {
        let history = self.store.get_history(&doc.id).await?;
        let (Some(last), Some(prev)) = (history.nth_newest(1), history.nth_newest(2)) else {
            return Ok(DocStatus::Skipped {
                reason: format!("not enough history ({} snapshots)", history.len()),
                change: None,
            });
        };
        if !force && last.hashes.fingerprint_hash == prev.hashes.fingerprint_hash {
            return Ok(DocStatus::Skipped {
                reason: "no substantive change between prev and last".to_string(),
                change: None,
            });
        }

        let request = DiffRequest {
            from: Some(Selector::At(prev.timestamp)),
            to: Some(Selector::At(last.timestamp)),
            force,
        };
        let outcome = self
            .diffs
            .generate_diff(&doc.id, Some(&doc.name), &request)
            .await?;
        let (from, to) = {
            let meta = &outcome.record().meta;
            (meta.from_timestamp, meta.to_timestamp)
        };
        Ok(if outcome.was_cached() {
            DocStatus::Cached { from, to }
        } else {
            DocStatus::Generated { from, to }
        })
    }

    /// A stored diff: the latest one, or the one between two selectors.
    pub async fn get_diff(
        &self,
        doc_id: &str,
        pair: Option<(Selector, Selector)>,
    ) -> Result<DiffRecord> {
        let selector = match pair {
            None => DiffSelector::Latest,
            Some((from, to)) => {
                let from = self.store.resolve(doc_id, from).await?;
                let to = self.store.resolve(doc_id, to).await?;
                DiffSelector::Pair(from.timestamp, to.timestamp)
            }
        };
        self.diffs.get_diff(doc_id, selector).await
    }

    pub async fn list_diffs(&self, doc_id: &str) -> Result<Vec<DiffMeta>> {
        self.store.list_diffs(doc_id).await
    }

    // ============ Queries ============

    pub async fn get_snapshot(&self, doc_id: &str, selector: Selector) -> Result<Snapshot> {
        self.store.get_snapshot(doc_id, selector).await
    }

    /// Every configured or stored document, configured ones first in
    /// configuration order.
    pub async fn list_documents(&self) -> Result<Vec<DocumentOverview>> {
        let list = self.try_load_documents().await?;
        let mut stored: BTreeMap<String, DocumentSummary> = self
            .store
            .list_documents()
            .await?
            .into_iter()
            .map(|s| (s.doc_id.clone(), s))
            .collect();

        let mut out = Vec::new();
        for doc in list.iter().flat_map(|l| &l.documents) {
            let summary = match stored.remove(&doc.id) {
                Some(summary) => summary,
                None => self.store.get_history(&doc.id).await?.summary(),
            };
            out.push(DocumentOverview {
                name: Some(doc.name.clone()),
                url: Some(doc.url.clone()),
                configured: true,
                summary,
            });
        }
        out.extend(stored.into_values().map(|summary| DocumentOverview {
            name: None,
            url: None,
            configured: false,
            summary,
        }));
        Ok(out)
    }

    pub async fn describe_document(&self, doc_id: &str) -> Result<DocumentDetail> {
        let config = self
            .try_load_documents()
            .await?
            .and_then(|l| l.find(doc_id).cloned());
        let history = self.store.get_history(doc_id).await?;
        if config.is_none() && history.is_empty() {
            return Err(MonitorError::NotFound(format!(
                "document '{}' is neither configured nor stored",
                doc_id
            )));
        }
        Ok(DocumentDetail {
            config,
            summary: history.summary(),
            history: history.iter().cloned().collect(),
            diffs: self.store.list_diffs(doc_id).await?,
        })
    }

    /// Every configured document with its newest diff, in configuration
    /// order. `changed_only` keeps the ones that have a diff.
    pub async fn diff_overview(&self, changed_only: bool) -> Result<Vec<DiffOverview>> {
        let list = self.load_documents().await?;
        let mut out = Vec::with_capacity(list.documents.len());
        for doc in &list.documents {
            let latest = self.store.list_diffs(&doc.id).await?.into_iter().next();
            if changed_only && latest.is_none() {
                continue;
            }
            out.push(DiffOverview {
                doc_id: doc.id.clone(),
                name: doc.name.clone(),
                url: doc.url.clone(),
                has_diff: latest.is_some(),
                latest,
            });
        }
        Ok(out)
    }

    // ============ Health ============

    /// Check that storage answers and that the summarizer backend is
    /// reachable.
    pub async fn health(&self) -> HealthReport {
        let mut checks = BTreeMap::new();

        let storage = match self.store.blobs().list("config/").await {
            Ok(_) => HealthCheck {
                status: CheckStatus::Healthy,
                message: None,
                model: None,
            },
            Err(e) => {
                warn!(error = %e, "storage health check failed");
                HealthCheck {
                    status: CheckStatus::Unhealthy,
                    message: Some(e.to_string()),
                    model: None,
                }
            }
        };
        checks.insert("storage", storage);

        let summarizer = self.diffs.summarizer();
        let model = Some(summarizer.model_name().to_string());
        let summarizer = if !summarizer.is_enabled() {
            HealthCheck {
                status: CheckStatus::Disabled,
                message: None,
                model: None,
            }
        } else {
            match self.diffs.check_summarizer().await {
                Ok(()) => HealthCheck {
                    status: CheckStatus::Healthy,
                    message: None,
                    model,
                },
                Err(e) => {
                    warn!(error = %e, "summarizer health check failed");
                    HealthCheck {
                        status: CheckStatus::Unhealthy,
                        message: Some(e.to_string()),
                        model,
                    }
                }
            }
        };
        checks.insert("summarizer", summarizer);

        let status = if checks.values().any(|c| c.status == CheckStatus::Unhealthy) {
            CheckStatus::Unhealthy
        } else {
            CheckStatus::Healthy
        };
        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            timestamp: chrono::Utc::now(),
            checks,
        }
    }

    // ============ Bootstrap ============

    /// Seed `config/documents.json` and the default prompt template.
    /// Existing keys are kept unless `overwrite` is set.
    pub async fn init(&self, documents: Option<&[u8]>, overwrite: bool) -> Result<InitReport> {
        let mut report = InitReport::default();
        let blobs = self.store.blobs();

        if let Some(bytes) = documents {
            let list = DocumentList::from_json(bytes)?;
            if overwrite || !blobs.exists(DOCUMENTS_KEY).await? {
                blobs
                    .put(DOCUMENTS_KEY, &serde_json::to_vec_pretty(&list)?)
                    .await?;
                info!(documents = list.documents.len(), "wrote {}", DOCUMENTS_KEY);
                report.written.push(DOCUMENTS_KEY.to_string());
            } else {
                report.kept.push(DOCUMENTS_KEY.to_string());
            }
        }

        if overwrite || !blobs.exists(DEFAULT_PROMPT_KEY).await? {
            blobs
                .put(DEFAULT_PROMPT_KEY, BUILTIN_TEMPLATE.as_bytes())
                .await?;
            report.written.push(DEFAULT_PROMPT_KEY.to_string());
        } else {
            report.kept.push(DEFAULT_PROMPT_KEY.to_string());
        }
        Ok(report)
    }
}
