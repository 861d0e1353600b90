//! End-to-end cycle tests over the in-memory and filesystem blob stores,
//! with a scripted fetcher and a counting summarizer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use tos_monitor::blob::{BlobStore, FsBlobStore, MemoryBlobStore};
use tos_monitor::config::Config;
use tos_monitor::detector::ChangeState;
use tos_monitor::diff::DiffRequest;
use tos_monitor::fetch::{FetchedPage, Fetcher};
use tos_monitor::models::Selector;
use tos_monitor::monitor::{CheckStatus, DocStatus, Monitor, Scope};
use tos_monitor::normalize::TextNormalizer;
use tos_monitor::summarize::{DisabledSummarizer, Summarizer};
use tos_monitor::{MonitorError, Result};

const DOCUMENTS: &str = r#"{"documents": [
    {"id": "acme-tos", "name": "Acme Terms of Service", "url": "https://acme.test/tos"},
    {"id": "acme-privacy", "name": "Acme Privacy Policy", "url": "https://acme.test/privacy"}
]}"#;

const TOS: &str = "https://acme.test/tos";
const PRIVACY: &str = "https://acme.test/privacy";

#[derive(Default)]
struct ScriptedFetcher {
    pages: Mutex<HashMap<String, String>>,
    hang: Mutex<Option<String>>,
}

impl ScriptedFetcher {
    fn set(&self, url: &str, text: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), text.to_string());
    }

    fn fail(&self, url: &str) {
        self.pages.lock().unwrap().remove(url);
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _selector: Option<&str>) -> Result<FetchedPage> {
        let hang = self.hang.lock().unwrap().clone();
        if hang.as_deref() == Some(url) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        let text = self
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| MonitorError::Fetch(format!("{} returned HTTP 503", url)))?;
        Ok(FetchedPage {
            url: url.to_string(),
            raw: format!("<html><body><main>{}</main></body></html>", text),
            text,
            title: Some("Acme".to_string()),
            content_type: Some("text/html".to_string()),
        })
    }
}

#[derive(Default)]
struct CountingSummarizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for CountingSummarizer {
    async fn summarize(&self, prompt: &str) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("Summary #{} of a {}-char prompt.", n, prompt.len()))
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

struct Harness {
    monitor: Monitor,
    fetcher: Arc<ScriptedFetcher>,
    summarizer: Arc<CountingSummarizer>,
}

async fn harness_with(config: Config, blobs: Arc<dyn BlobStore>) -> Harness {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let summarizer = Arc::new(CountingSummarizer::default());
    let monitor = Monitor::new(
        config,
        blobs,
        fetcher.clone(),
        Arc::new(TextNormalizer),
        summarizer.clone(),
    );
    monitor
        .init(Some(DOCUMENTS.as_bytes()), false)
        .await
        .unwrap();
    Harness {
        monitor,
        fetcher,
        summarizer,
    }
}

async fn harness() -> Harness {
    harness_with(Config::default(), Arc::new(MemoryBlobStore::new())).await
}

fn only(doc: &str) -> Scope {
    Scope::new([doc])
}

#[tokio::test]
async fn no_history_then_unchanged() {
    let h = harness().await;
    h.fetcher.set(TOS, "Terms of Service\n\nWe collect your email.");

    let report = h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
    let DocStatus::Stored {
        timestamp: t1,
        change,
        ..
    } = report.documents["acme-tos"].clone()
    else {
        panic!("expected stored, got {:?}", report.documents["acme-tos"]);
    };
    assert_eq!(change, ChangeState::NoHistory);

    let report = h.monitor.run_fetch_cycle(&only("acme-tos"), true).await.unwrap();
    assert!(matches!(
        report.documents["acme-tos"],
        DocStatus::Skipped {
            change: Some(ChangeState::Unchanged),
            ..
        }
    ));
    assert_eq!(report.written, 0);

    let current = h.monitor.get_snapshot("acme-tos", Selector::Current).await.unwrap();
    assert_eq!(current.meta.timestamp, t1);
    assert_eq!(current.content, "Terms of Service\n\nWe collect your email.");
    assert_eq!(current.meta.document_name.as_deref(), Some("Acme Terms of Service"));
    assert_eq!(current.meta.url.as_deref(), Some(TOS));
    assert_eq!(current.meta.title.as_deref(), Some("Acme"));
}

#[tokio::test]
async fn date_bump_is_stored_as_cosmetic() {
    let h = harness().await;
    h.fetcher.set(TOS, "Effective date: 2024-04-01\n\nWe collect your email.");
    h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();

    h.fetcher.set(TOS, "Effective date: 2024-05-01\n\nWe collect your email.");
    let report = h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
    assert!(matches!(
        report.documents["acme-tos"],
        DocStatus::Stored {
            change: ChangeState::CosmeticChange,
            ..
        }
    ));

    let current = h.monitor.get_snapshot("acme-tos", Selector::Current).await.unwrap();
    let last = h.monitor.get_snapshot("acme-tos", Selector::Last).await.unwrap();
    assert_ne!(current.meta.hashes.content_hash, last.meta.hashes.content_hash);
    assert_ne!(current.meta.hashes.structural_hash, last.meta.hashes.structural_hash);
    assert_eq!(current.meta.hashes.fingerprint_hash, last.meta.hashes.fingerprint_hash);

    let docs = h.monitor.list_documents().await.unwrap();
    let tos = docs.iter().find(|d| d.summary.doc_id == "acme-tos").unwrap();
    assert!(!tos.summary.changed);
}

#[tokio::test]
async fn cosmetic_changes_can_be_skipped_by_policy() {
    let mut config = Config::default();
    config.detection.persist_on_cosmetic = false;
    let h = harness_with(config, Arc::new(MemoryBlobStore::new())).await;

    h.fetcher.set(TOS, "Last updated: May 1, 2024\nWe collect your email.");
    h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
    h.fetcher.set(TOS, "Last updated: June 2, 2024\nWe collect your email.");

    let report = h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
    assert!(matches!(
        report.documents["acme-tos"],
        DocStatus::Skipped {
            change: Some(ChangeState::CosmeticChange),
            ..
        }
    ));
    let forced = h.monitor.run_fetch_cycle(&only("acme-tos"), true).await.unwrap();
    assert_eq!(forced.written, 1);
}

#[tokio::test]
async fn pointers_track_the_three_newest() {
    let h = harness().await;
    let mut stamps = Vec::new();
    for text in [
        "Version one text.",
        "Version two text.",
        "Version three text.",
        "Version four text.",
    ] {
        h.fetcher.set(TOS, text);
        let report = h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
        match &report.documents["acme-tos"] {
            DocStatus::Stored { timestamp, .. } => stamps.push(*timestamp),
            other => panic!("expected stored, got {:?}", other),
        }
    }
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));

    let resolve = |s| h.monitor.get_snapshot("acme-tos", s);
    assert_eq!(resolve(Selector::Current).await.unwrap().meta.timestamp, stamps[3]);
    assert_eq!(resolve(Selector::Last).await.unwrap().meta.timestamp, stamps[2]);
    assert_eq!(resolve(Selector::Prev).await.unwrap().meta.timestamp, stamps[1]);
    assert_eq!(
        resolve(Selector::At(stamps[0])).await.unwrap().content,
        "Version one text."
    );
}

#[tokio::test]
async fn empty_history_has_no_prev() {
    let h = harness().await;
    let err = h
        .monitor
        .get_snapshot("acme-tos", Selector::Prev)
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::NotFound(_)));
}

#[tokio::test]
async fn failures_are_isolated_per_document() {
    let h = harness().await;
    h.fetcher.set(TOS, "We collect your email.");
    h.fetcher.fail(PRIVACY);

    let report = h.monitor.run_fetch_cycle(&Scope::all(), false).await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert!(matches!(report.documents["acme-tos"], DocStatus::Stored { .. }));
    match &report.documents["acme-privacy"] {
        DocStatus::Failed { code, .. } => assert_eq!(code, "fetch_error"),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(h
        .monitor
        .store()
        .get_history("acme-privacy")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn empty_page_is_a_fetch_failure() {
    let h = harness().await;
    h.fetcher.set(TOS, "Home\nMenu\n\n|");
    let report = h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
    assert!(report.documents["acme-tos"].is_failed());
}

#[tokio::test]
async fn slow_fetch_times_out_without_blocking_others() {
    let mut config = Config::default();
    config.fetch.deadline_secs = 1;
    let h = harness_with(config, Arc::new(MemoryBlobStore::new())).await;
    h.fetcher.set(TOS, "We collect your email.");
    h.fetcher.set(PRIVACY, "We never sell data.");
    *h.fetcher.hang.lock().unwrap() = Some(PRIVACY.to_string());

    let report = h.monitor.run_fetch_cycle(&Scope::all(), false).await.unwrap();
    assert!(matches!(report.documents["acme-tos"], DocStatus::Stored { .. }));
    assert!(report.documents["acme-privacy"].is_failed());

    // The writer guard was never taken, so the document is still writable.
    *h.fetcher.hang.lock().unwrap() = None;
    let report = h.monitor.run_fetch_cycle(&only("acme-privacy"), false).await.unwrap();
    assert!(matches!(report.documents["acme-privacy"], DocStatus::Stored { .. }));
}

#[tokio::test]
async fn concurrent_cycles_store_one_snapshot() {
    let h = harness().await;
    h.fetcher.set(TOS, "We collect your email.");
    let scope = only("acme-tos");
    let (a, b) = tokio::join!(
        h.monitor.run_fetch_cycle(&scope, false),
        h.monitor.run_fetch_cycle(&scope, false)
    );
    assert_eq!(a.unwrap().written + b.unwrap().written, 1);
    assert_eq!(
        h.monitor.store().get_history("acme-tos").await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn default_diff_compares_prev_and_last_and_caches() {
    let h = harness().await;
    let mut stamps = Vec::new();
    for text in [
        "We collect your email.",
        "We collect your email and phone.",
        "We sell nothing.",
    ] {
        h.fetcher.set(TOS, text);
        let report = h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
        if let DocStatus::Stored { timestamp, .. } = report.documents["acme-tos"] {
            stamps.push(timestamp);
        }
    }

    let first = h
        .monitor
        .generate_diff("acme-tos", &DiffRequest::default())
        .await
        .unwrap();
    assert!(!first.was_cached());
    let record = first.record().clone();
    assert_eq!(record.meta.from_timestamp, stamps[0]);
    assert_eq!(record.meta.to_timestamp, stamps[1]);
    assert_eq!(record.meta.document_name.as_deref(), Some("Acme Terms of Service"));
    assert_eq!(record.meta.prompt_used, "prompts/default_comparison.txt");
    assert_eq!(record.meta.model, "counting");

    let second = h
        .monitor
        .generate_diff("acme-tos", &DiffRequest::default())
        .await
        .unwrap();
    assert!(second.was_cached());
    assert_eq!(second.record(), &record);
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 1);

    let latest = h.monitor.get_diff("acme-tos", None).await.unwrap();
    assert_eq!(latest, record);
    let by_pair = h
        .monitor
        .get_diff("acme-tos", Some((Selector::Prev, Selector::Last)))
        .await
        .unwrap();
    assert_eq!(by_pair, record);
}

#[tokio::test]
async fn diff_needs_enough_history() {
    let h = harness().await;
    h.fetcher.set(TOS, "We collect your email.");
    h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();

    let err = h
        .monitor
        .generate_diff("acme-tos", &DiffRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::NotFound(_)));
    let err = h.monitor.get_diff("acme-tos", None).await.unwrap_err();
    assert!(matches!(err, MonitorError::NotFound(_)));
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn diff_cycle_statuses() {
    let h = harness().await;
    for text in ["Clause A.", "Clause A and B.", "Clause A, B and C."] {
        h.fetcher.set(TOS, text);
        h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
    }
    h.fetcher.set(PRIVACY, "We never sell data.");
    h.monitor.run_fetch_cycle(&only("acme-privacy"), false).await.unwrap();

    let report = h.monitor.run_diff_cycle(&Scope::all(), false).await.unwrap();
    assert!(matches!(report.documents["acme-tos"], DocStatus::Generated { .. }));
    assert!(matches!(report.documents["acme-privacy"], DocStatus::Skipped { .. }));
    assert_eq!(report.written, 1);

    let again = h.monitor.run_diff_cycle(&Scope::all(), false).await.unwrap();
    assert!(matches!(again.documents["acme-tos"], DocStatus::Cached { .. }));
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 1);

    let forced = h.monitor.run_diff_cycle(&only("acme-tos"), true).await.unwrap();
    assert!(matches!(forced.documents["acme-tos"], DocStatus::Generated { .. }));
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.monitor.list_diffs("acme-tos").await.unwrap().len(), 1);
}

#[tokio::test]
async fn diff_overview_lists_newest_diff_per_document() {
    let h = harness().await;
    for text in ["Clause A.", "Clause A and B.", "Clause A, B and C."] {
        h.fetcher.set(TOS, text);
        h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
    }
    let before = h.monitor.diff_overview(true).await.unwrap();
    assert!(before.is_empty());

    h.monitor.run_diff_cycle(&Scope::all(), false).await.unwrap();
    let all = h.monitor.diff_overview(false).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|d| d.doc_id.as_str()).collect();
    assert_eq!(ids, vec!["acme-tos", "acme-privacy"]);
    assert!(all[0].has_diff);
    assert_eq!(all[0].latest.as_ref().unwrap().model, "counting");
    assert!(!all[1].has_diff);
    assert!(all[1].latest.is_none());

    let changed = h.monitor.diff_overview(true).await.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].name, "Acme Terms of Service");
}

#[tokio::test]
async fn health_checks_storage_and_summarizer() {
    let h = harness().await;
    let report = h.monitor.health().await;
    assert!(report.is_healthy());
    assert_eq!(report.status, CheckStatus::Healthy);
    assert_eq!(report.checks["storage"].status, CheckStatus::Healthy);
    assert_eq!(report.checks["summarizer"].model.as_deref(), Some("counting"));

    let monitor = Monitor::new(
        Config::default(),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(ScriptedFetcher::default()),
        Arc::new(TextNormalizer),
        Arc::new(DisabledSummarizer),
    );
    let report = monitor.health().await;
    assert!(report.is_healthy());
    assert_eq!(report.checks["summarizer"].status, CheckStatus::Disabled);
}

#[tokio::test]
async fn non_substantive_pairs_are_not_summarized() {
    let h = harness().await;
    for text in [
        "Effective date: 2024-01-01\nClause A.",
        "Effective date: 2024-02-01\nClause A.",
        "Effective date: 2024-03-01\nClause A.",
    ] {
        h.fetcher.set(TOS, text);
        h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
    }
    let report = h.monitor.run_diff_cycle(&only("acme-tos"), false).await.unwrap();
    assert!(matches!(report.documents["acme-tos"], DocStatus::Skipped { .. }));
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn raw_pages_are_kept_when_configured() {
    let mut config = Config::default();
    config.fetch.keep_raw = true;
    let h = harness_with(config, Arc::new(MemoryBlobStore::new())).await;
    h.fetcher.set(TOS, "We collect your email.");
    h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();

    let snapshot = h.monitor.get_snapshot("acme-tos", Selector::Current).await.unwrap();
    let key = snapshot.meta.raw_reference.clone().unwrap();
    assert!(key.ends_with("/raw.html"));
    let raw = h
        .monitor
        .store()
        .get_raw("acme-tos", Selector::Current)
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8(raw).unwrap().contains("<main>We collect your email.</main>"));
}

#[tokio::test]
async fn listing_includes_configured_documents_without_snapshots() {
    let h = harness().await;
    h.fetcher.set(TOS, "We collect your email.");
    h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();

    let docs = h.monitor.list_documents().await.unwrap();
    let ids: Vec<&str> = docs.iter().map(|d| d.summary.doc_id.as_str()).collect();
    assert_eq!(ids, vec!["acme-tos", "acme-privacy"]);
    assert_eq!(docs[0].summary.total, 1);
    assert_eq!(docs[1].summary.total, 0);
    assert!(docs[1].configured);

    let detail = h.monitor.describe_document("acme-tos").await.unwrap();
    assert_eq!(detail.history.len(), 1);
    assert_eq!(detail.config.unwrap().name, "Acme Terms of Service");
    assert!(matches!(
        h.monitor.describe_document("initech").await,
        Err(MonitorError::NotFound(_))
    ));
}

#[tokio::test]
async fn init_keeps_existing_keys() {
    let h = harness().await;
    let report = h
        .monitor
        .init(Some(br#"{"documents": [{"id": "x", "name": "X", "url": "https://x.test"}]}"#), false)
        .await
        .unwrap();
    assert!(report.written.is_empty());
    assert_eq!(report.kept.len(), 2);
    assert_eq!(h.monitor.load_documents().await.unwrap().documents.len(), 2);

    let report = h
        .monitor
        .init(Some(br#"{"documents": [{"id": "x", "name": "X", "url": "https://x.test"}]}"#), true)
        .await
        .unwrap();
    assert_eq!(report.written.len(), 2);
    assert_eq!(h.monitor.load_documents().await.unwrap().documents.len(), 1);

    let bad = h.monitor.init(Some(br#"{"documents": []}"#), true).await;
    assert!(matches!(bad, Err(MonitorError::Config(_))));
}

#[tokio::test]
async fn unknown_scope_id_is_rejected() {
    let h = harness().await;
    let err = h
        .monitor
        .run_fetch_cycle(&only("initech"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::InvalidInput(_)));
}

#[tokio::test]
async fn history_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    let stamps = {
        let h = harness_with(Config::default(), Arc::new(FsBlobStore::new(dir.path()))).await;
        let mut stamps = Vec::new();
        for text in ["Clause A.", "Clause A and B."] {
            h.fetcher.set(TOS, text);
            let report = h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
            if let DocStatus::Stored { timestamp, .. } = report.documents["acme-tos"] {
                stamps.push(timestamp);
            }
        }
        stamps
    };

    let h = harness_with(Config::default(), Arc::new(FsBlobStore::new(dir.path()))).await;
    let current = h.monitor.get_snapshot("acme-tos", Selector::Current).await.unwrap();
    assert_eq!(current.meta.timestamp, stamps[1]);
    assert_eq!(current.content, "Clause A and B.");

    h.fetcher.set(TOS, "Clause A and B.");
    let report = h.monitor.run_fetch_cycle(&only("acme-tos"), false).await.unwrap();
    assert_eq!(report.written, 0);

    assert!(dir
        .path()
        .join("snapshots/acme-tos")
        .join(stamps[0].to_string())
        .join("metadata.json")
        .exists());
}
