//! Page fetching and HTML-to-text extraction.
//!
//! [`HttpFetcher`] is the production [`Fetcher`]:
//!
//! - `http(s)://` URLs are fetched with `reqwest` using a browser-like
//!   User-Agent and a per-request timeout.
//! - `file://` URLs are read from the local filesystem, which keeps tests
//!   and offline runs off the network.
//! - HTML bodies are reduced to text with `scraper`. Other bodies pass
//!   through verbatim.
//!
//! # Retry strategy
//!
//! - HTTP 429 or 5xx → retry with exponential backoff (1s, 2s, 4s, ...)
//! - other HTTP 4xx → fail immediately
//! - network error → retry
//!
//! # Extraction
//!
//! With a configured CSS selector every matching element is rendered and
//! the results joined; an unparseable selector or one that matches nothing
//! is a fetch error, since silently falling back would snapshot the wrong
//! part of the page. Without a selector the first of `main`, `article`,
//! `body` is used. Scripts, styles, navigation, headers, footers, forms
//! and similar chrome are skipped. Block elements start new lines.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::error::{MonitorError, Result};

const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "header", "footer", "aside", "form",
    "iframe", "svg", "button", "select",
];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "h1", "h2", "h3", "h4", "h5", "h6", "li", "ul",
    "ol", "dl", "dt", "dd", "table", "tr", "blockquote", "pre", "hr", "address", "figure",
    "figcaption", "details", "summary",
];

/// A fetched page before normalization.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    /// Response body as received.
    pub raw: String,
    /// Extracted text.
    pub text: String,
    pub title: Option<String>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, selector: Option<&str>) -> Result<FetchedPage>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MonitorError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
        })
    }

    async fn get_http(&self, url: &str) -> Result<(String, Option<String>)> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(url, attempt, "retrying fetch in {:?}", delay);
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .get(url)
                .header(
                    "Accept",
                    "text/html,application/xhtml+xml,text/plain;q=0.9,*/*;q=0.8",
                )
                .header("Accept-Language", "en-US,en;q=0.9")
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let body = response.text().await.map_err(|e| {
                            MonitorError::Fetch(format!("reading body of {}: {}", url, e))
                        })?;
                        return Ok((body, content_type));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(MonitorError::Fetch(format!(
                            "{} returned HTTP {}",
                            url, status
                        )));
                        continue;
                    }

                    return Err(MonitorError::Fetch(format!("{} returned HTTP {}", url, status)));
                }
                Err(e) => {
                    last_err = Some(MonitorError::Fetch(format!("{}: {}", url, e)));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| MonitorError::Fetch(format!("{}: retries exhausted", url))))
    }

    async fn get_file(&self, url: &str) -> Result<(String, Option<String>)> {
        let path = url.trim_start_matches("file://");
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MonitorError::Fetch(format!("{}: {}", url, e)))?;
        let content_type = if path.ends_with(".html") || path.ends_with(".htm") {
            Some("text/html".to_string())
        } else if path.ends_with(".txt") {
            Some("text/plain".to_string())
        } else {
            None
        };
        Ok((body, content_type))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, selector: Option<&str>) -> Result<FetchedPage> {
        let (raw, content_type) = if url.starts_with("file://") {
            self.get_file(url).await?
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.get_http(url).await?
        } else {
            return Err(MonitorError::Fetch(format!("unsupported URL scheme: {}", url)));
        };

        let (text, title) = if is_html(content_type.as_deref(), &raw) {
            let extracted = extract_html(&raw, selector)?;
            (extracted.text, extracted.title)
        } else {
            if selector.is_some() {
                warn!(url, "selector ignored for non-HTML response");
            }
            (raw.clone(), None)
        };

        debug!(url, bytes = raw.len(), chars = text.len(), "fetched page");
        Ok(FetchedPage {
            url: url.to_string(),
            raw,
            text,
            title,
            content_type,
        })
    }
}

fn is_html(content_type: Option<&str>, body: &str) -> bool {
    match content_type {
        Some(ct) if ct.contains("html") => true,
        Some(ct) if ct.starts_with("text/plain") => false,
        _ => {
            let head: String = body.trim_start().chars().take(15).collect();
            let head = head.to_ascii_lowercase();
            head.starts_with("<!doctype html") || head.starts_with("<html")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub text: String,
    pub title: Option<String>,
}

/// Extract readable text (and the `<title>`) from an HTML document.
pub fn extract_html(html: &str, selector: Option<&str>) -> Result<Extracted> {
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty());

    let mut out = String::new();
    match selector {
        Some(css) => {
            let sel = Selector::parse(css)
                .map_err(|e| MonitorError::Fetch(format!("invalid selector '{}': {}", css, e)))?;
            let mut matched = 0;
            for element in document.select(&sel) {
                matched += 1;
                render(element, false, &mut out);
                out.push_str("\n\n");
            }
            if matched == 0 {
                return Err(MonitorError::Fetch(format!(
                    "selector '{}' matched nothing",
                    css
                )));
            }
        }
        None => render(pick_root(&document), false, &mut out),
    }

    Ok(Extracted {
        text: tidy_lines(&out),
        title,
    })
}

fn pick_root(document: &Html) -> ElementRef<'_> {
    ["main", "article", "body"]
        .iter()
        .filter_map(|tag| Selector::parse(tag).ok())
        .find_map(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element())
}

fn render(element: ElementRef<'_>, preformatted: bool, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                if preformatted {
                    out.push_str(text);
                } else {
                    push_collapsed(text, out);
                }
            }
            Node::Element(el) => {
                let name = el.name();
                if SKIP_TAGS.contains(&name) {
                    continue;
                }
                if name == "br" {
                    out.push('\n');
                    continue;
                }
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let block = BLOCK_TAGS.contains(&name);
                if block {
                    out.push('\n');
                }
                if name == "li" {
                    out.push_str("• ");
                }
                render(child_el, preformatted || name == "pre", out);
                if block {
                    out.push('\n');
                }
                if matches!(name, "td" | "th") {
                    out.push(' ');
                }
            }
            _ => {}
        }
    }
}

/// Append `text` with whitespace runs reduced to one space.
fn push_collapsed(text: &str, out: &mut String) {
    let mut last_space = out.ends_with(' ') || out.ends_with('\n') || out.is_empty();
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(ch);
            last_space = false;
        }
    }
}

fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    push_collapsed(input, &mut buf);
    buf.trim().to_string()
}

/// Trim each line and squeeze runs of blank lines.
fn tidy_lines(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
