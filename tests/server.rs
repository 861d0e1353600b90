//! HTTP API tests: the router is served on an ephemeral port and driven
//! with reqwest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use tos_monitor::blob::MemoryBlobStore;
use tos_monitor::config::Config;
use tos_monitor::fetch::{FetchedPage, Fetcher};
use tos_monitor::monitor::Monitor;
use tos_monitor::normalize::TextNormalizer;
use tos_monitor::server::router;
use tos_monitor::summarize::Summarizer;
use tos_monitor::{MonitorError, Result};

#[derive(Default)]
struct StubFetcher {
    pages: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, url: &str, _selector: Option<&str>) -> Result<FetchedPage> {
        let text = self
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| MonitorError::Fetch(format!("{} unreachable", url)))?;
        Ok(FetchedPage {
            url: url.to_string(),
            raw: text.clone(),
            text,
            title: None,
            content_type: Some("text/plain".to_string()),
        })
    }
}

struct EchoSummarizer;

#[async_trait]
impl Summarizer for EchoSummarizer {
    async fn summarize(&self, _prompt: &str) -> Result<String> {
        Ok("Clause C was added.".to_string())
    }

    fn model_name(&self) -> &str {
        "echo"
    }
}

struct UnreachableSummarizer;

#[async_trait]
impl Summarizer for UnreachableSummarizer {
    async fn summarize(&self, _prompt: &str) -> Result<String> {
        Err(MonitorError::Summarization("connection refused".to_string()))
    }

    fn model_name(&self) -> &str {
        "gone"
    }

    async fn check(&self) -> Result<()> {
        Err(MonitorError::Summarization("connection refused".to_string()))
    }
}

struct Server {
    base: String,
    fetcher: Arc<StubFetcher>,
    client: reqwest::Client,
}

impl Server {
    async fn start() -> Self {
        Self::start_with(Arc::new(EchoSummarizer)).await
    }

    async fn start_with(summarizer: Arc<dyn Summarizer>) -> Self {
        let fetcher = Arc::new(StubFetcher::default());
        let monitor = Monitor::new(
            Config::default(),
            Arc::new(MemoryBlobStore::new()),
            fetcher.clone(),
            Arc::new(TextNormalizer),
            summarizer,
        );
        monitor
            .init(
                Some(
                    br#"{"documents": [
                        {"id": "acme-tos", "name": "Acme Terms", "url": "https://acme.test/tos"},
                        {"id": "down", "name": "Down Site", "url": "https://down.test/"}
                    ]}"#,
                ),
                false,
            )
            .await
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(monitor));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            fetcher,
            client: reqwest::Client::new(),
        }
    }

    fn set_page(&self, text: &str) {
        self.fetcher
            .pages
            .lock()
            .unwrap()
            .insert("https://acme.test/tos".to_string(), text.to_string());
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Option<Value>) -> (u16, Value) {
        let mut req = self.client.post(format!("{}{}", self.base, path));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

#[tokio::test]
async fn health_reports_version() {
    let server = Server::start().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["checks"]["storage"]["status"], "healthy");
    assert_eq!(body["checks"]["summarizer"]["model"], "echo");
}

#[tokio::test]
async fn health_is_unavailable_when_summarizer_is_down() {
    let server = Server::start_with(Arc::new(UnreachableSummarizer)).await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 503);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["storage"]["status"], "healthy");
    assert_eq!(body["checks"]["summarizer"]["status"], "unhealthy");
    assert!(body["checks"]["summarizer"]["message"]
        .as_str()
        .unwrap()
        .contains("connection refused"));
}

#[tokio::test]
async fn fetch_cycle_reports_per_document() {
    let server = Server::start().await;
    server.set_page("Clause A.");

    let (status, body) = server.post("/fetch", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["processed"], 2);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["documents"]["acme-tos"]["status"], "stored");
    assert_eq!(body["documents"]["acme-tos"]["change"], "no_history");
    assert_eq!(body["documents"]["down"]["status"], "failed");
    assert_eq!(body["documents"]["down"]["code"], "fetch_error");

    let (status, body) = server
        .post(
            "/fetch",
            Some(json!({"document_ids": ["acme-tos"], "force_update": true})),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["processed"], 1);
    assert_eq!(body["documents"]["acme-tos"]["status"], "skipped");

    let (status, body) = server
        .post("/fetch", Some(json!({"document_ids": ["nope"]})))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn documents_and_snapshots() {
    let server = Server::start().await;
    server.set_page("Clause A.");
    server.post("/fetch", None).await;

    let (status, body) = server.get("/documents").await;
    assert_eq!(status, 200);
    let docs = body["documents"].as_array().unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["doc_id"], "acme-tos");
    assert_eq!(docs[0]["total"], 1);
    assert_eq!(docs[1]["total"], 0);

    let (status, body) = server.get("/documents/acme-tos/snapshots/current").await;
    assert_eq!(status, 200);
    assert_eq!(body["content"], "Clause A.");
    assert_eq!(body["content_hash"].as_str().unwrap().len(), 64);

    let (status, body) = server.get("/documents/acme-tos/snapshots/prev").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = server.get("/documents/acme-tos/snapshots/not-a-date").await;
    assert_eq!(status, 400);

    let (status, body) = server.get("/documents/acme-tos").await;
    assert_eq!(status, 200);
    assert_eq!(body["config"]["name"], "Acme Terms");
    assert_eq!(body["history"].as_array().unwrap().len(), 1);

    let (status, _) = server.get("/documents/initech").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn diff_lifecycle() {
    let server = Server::start().await;

    let (status, _) = server.post("/documents/acme-tos/diff", None).await;
    assert_eq!(status, 404);

    for text in ["Clause A.", "Clause A and B.", "Clause A, B and C."] {
        server.set_page(text);
        server
            .post("/fetch", Some(json!({"document_ids": ["acme-tos"]})))
            .await;
    }

    let (status, body) = server.post("/documents/acme-tos/diff", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["cached"], false);
    assert_eq!(body["diff"]["summary_text"], "Clause C was added.");
    assert_eq!(body["diff"]["model"], "echo");
    let from = body["diff"]["from_timestamp"].as_str().unwrap().to_string();
    let to = body["diff"]["to_timestamp"].as_str().unwrap().to_string();

    let (_, again) = server.post("/documents/acme-tos/diff", Some(json!({}))).await;
    assert_eq!(again["cached"], true);
    assert_eq!(again["diff"], body["diff"]);

    let (status, latest) = server.get("/documents/acme-tos/diffs/latest").await;
    assert_eq!(status, 200);
    assert_eq!(latest, body["diff"]);

    let (status, pair) = server
        .get(&format!("/documents/acme-tos/diffs/{}/{}", from, to))
        .await;
    assert_eq!(status, 200);
    assert_eq!(pair, body["diff"]);

    let (status, list) = server.get("/documents/acme-tos/diffs").await;
    assert_eq!(status, 200);
    assert_eq!(list["diffs"].as_array().unwrap().len(), 1);

    let (status, body) = server
        .post(
            "/documents/acme-tos/diff",
            Some(json!({"from": "current", "to": "prev"})),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = server.post("/diffs", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["documents"]["acme-tos"]["status"], "cached");
    assert_eq!(body["documents"]["down"]["status"], "skipped");

    let (status, body) = server.get("/diffs").await;
    assert_eq!(status, 200);
    assert_eq!(body["document_count"], 2);
    assert_eq!(body["documents"][0]["doc_id"], "acme-tos");
    assert_eq!(body["documents"][0]["has_diff"], true);
    assert_eq!(body["documents"][0]["latest"]["to_timestamp"], to.as_str());
    assert_eq!(body["documents"][1]["has_diff"], false);
    assert!(body["documents"][1].get("latest").is_none());

    let (status, body) = server.get("/diffs?has_changes_only=true").await;
    assert_eq!(status, 200);
    assert_eq!(body["document_count"], 1);
    assert_eq!(body["documents"][0]["doc_id"], "acme-tos");
}
