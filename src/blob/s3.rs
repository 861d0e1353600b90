//! Amazon S3 [`BlobStore`].
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication
//! (`hmac` + `sha2`), so there is no dependency on the AWS SDK or on C
//! crypto libraries.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//! bucket = "tos-monitor"
//! region = "eu-west-1"
//! prefix = "prod/"
//! # endpoint_url = "http://localhost:9000"   # MinIO, LocalStack
//! ```
//!
//! Without `endpoint_url` requests use virtual-hosted addressing
//! (`<bucket>.s3.<region>.amazonaws.com`). A custom endpoint switches to
//! path-style addressing (`<endpoint>/<bucket>/<key>`), which is what
//! MinIO and LocalStack expect.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};

use crate::config::StorageConfig;
use crate::error::{MonitorError, Result};

use super::{check_key, BlobStore};

type HmacSha256 = Hmac<Sha256>;

pub struct S3BlobStore {
    bucket: String,
    region: String,
    /// Key prefix inside the bucket; empty or ending in `/`.
    prefix: String,
    endpoint: Option<String>,
    creds: AwsCredentials,
    client: reqwest::Client,
}

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            MonitorError::Config("AWS_ACCESS_KEY_ID environment variable not set".to_string())
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            MonitorError::Config("AWS_SECRET_ACCESS_KEY environment variable not set".to_string())
        })?;
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

impl S3BlobStore {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| MonitorError::Config("storage.bucket is required for s3".to_string()))?;

        let trimmed = config.prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        };

        Ok(Self {
            bucket,
            region: config.region.clone(),
            prefix,
            endpoint: config
                .endpoint_url
                .as_ref()
                .map(|e| e.trim_end_matches('/').to_string()),
            creds: AwsCredentials::from_env()?,
            client: reqwest::Client::new(),
        })
    }

    /// Host header value for this bucket.
    fn host(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .to_string(),
            None => format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    fn base_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://{}", self.host()),
        }
    }

    /// Canonical URI for an object key, or for the bucket when `key` is
    /// `None`.
    fn canonical_uri(&self, key: Option<&str>) -> String {
        let mut uri = String::new();
        if self.endpoint.is_some() {
            uri.push('/');
            uri.push_str(&uri_encode(&self.bucket));
        }
        match key {
            Some(key) => {
                let full = format!("{}{}", self.prefix, key);
                for seg in full.split('/') {
                    uri.push('/');
                    uri.push_str(&uri_encode(seg));
                }
            }
            None if uri.is_empty() => uri.push('/'),
            None => {}
        }
        uri
    }

    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let host = self.host();
        let canonical_uri = self.canonical_uri(key);

        let mut sorted = query.to_vec();
        sorted.sort();
        let canonical_query = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(&body);
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let authorization = authorization_header(
            &self.creds,
            &self.region,
            method.as_str(),
            &canonical_uri,
            &canonical_query,
            &mut headers,
            &payload_hash,
            now,
        );

        let mut url = format!("{}{}", self.base_url(), canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", authorization);
        for (name, value) in headers.iter().filter(|(k, _)| k != "host") {
            req = req.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() || method == Method::PUT {
            req = req.body(body);
        }

        req.send().await.map_err(|e| {
            MonitorError::storage(
                format!("S3 {} s3://{}{}", method, self.bucket, canonical_uri),
                e,
            )
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        let resp = self.send(Method::GET, Some(key), &[], Vec::new()).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MonitorError::Storage(format!(
                "S3 GetObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(300).collect::<String>()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| MonitorError::storage(format!("S3 GetObject body for '{}'", key), e))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        check_key(key)?;
        let resp = self
            .send(Method::PUT, Some(key), &[], bytes.to_vec())
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MonitorError::Storage(format!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(300).collect::<String>()
            )));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        let full_prefix = format!("{}{}", self.prefix, prefix);

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !full_prefix.is_empty() {
                query.push(("prefix".to_string(), full_prefix.clone()));
            }
            if let Some(ref token) = continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.send(Method::GET, None, &query, Vec::new()).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(MonitorError::Storage(format!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(300).collect::<String>()
                )));
            }
            let xml = resp
                .text()
                .await
                .map_err(|e| MonitorError::storage("S3 ListObjectsV2 body", e))?;
            let page = parse_list_response(&xml)?;

            keys.extend(page.keys.into_iter().filter_map(|k| {
                k.strip_prefix(self.prefix.as_str())
                    .filter(|rel| !rel.is_empty() && !rel.ends_with('/'))
                    .map(str::to_string)
            }));

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation = Some(token),
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }
}

// ============ AWS SigV4 ============

/// Build the SigV4 `Authorization` header. Sorts `headers` in place; they
/// must be lowercase and include `host`.
#[allow(clippy::too_many_arguments)]
fn authorization_header(
    creds: &AwsCredentials,
    region: &str,
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    headers: &mut [(String, String)],
    payload_hash: &str,
    now: DateTime<Utc>,
) -> String {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    headers.sort_by(|a, b| a.0.cmp(&b.0));
    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    )
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ ListObjectsV2 ============

#[derive(Debug, Default)]
struct ListPage {
    keys: Vec<String>,
    is_truncated: bool,
    next_token: Option<String>,
}

fn parse_list_response(xml: &str) -> Result<ListPage> {
    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut page = ListPage::default();
    let mut current: Option<Vec<u8>> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => current = Some(e.local_name().as_ref().to_vec()),
            Ok(Event::End(_)) => current = None,
            Ok(Event::Text(te)) => {
                let text = te
                    .unescape()
                    .map_err(|e| MonitorError::storage("S3 ListObjectsV2 XML", e))?
                    .into_owned();
                match current.as_deref() {
                    Some(b"Key") => page.keys.push(text),
                    Some(b"IsTruncated") => page.is_truncated = text == "true",
                    Some(b"NextContinuationToken") => page.next_token = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(MonitorError::storage("S3 ListObjectsV2 XML", e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(page)
}
