//! Client for the wiki's RPC-style HTTP API.
//!
//! Every call is `POST {base}/api/<method>` with a JSON body and bearer auth;
//! successful responses wrap their payload in `{"data": ...}`. Attachments
//! use a two-phase upload: [`OutlineClient::create_attachment`] reserves a
//! slot, [`OutlineClient::submit_upload`] sends the bytes to it.
//!
//! Status mapping: 401 → [`OutlineError::Auth`], 429 →
//! [`OutlineError::RateLimited`], any other non-2xx (403 included) →
//! [`OutlineError::Api`].
//! This client never retries; retry policy belongs to the caller.

use reqwest::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = "outline-clipper/0.1";
const LIST_LIMIT: u32 = 100;

// ==============================
// Errors
// ==============================

#[derive(Debug, Error)]
pub enum OutlineError {
    #[error("invalid URL: {0}")]
    Url(String),
    #[error("request build failed: {0}")]
    Build(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("decode error: {0}, body_snippet: {1}")]
    Decode(String, String),
    #[error("{0}")]
    Auth(String),
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },
    #[error("response exceeds {limit} bytes (got at least {size})")]
    TooLarge { limit: usize, size: usize },
    #[error("server returned error {status}: {message}")]
    Api { status: StatusCode, message: String },
}

// ==============================
// Wire types
// ==============================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AuthInfo {
    pub user: User,
    pub team: Team,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub parent_document_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SearchHit {
    #[serde(default)]
    pub context: Option<String>,
    pub document: Document,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDocument<'a> {
    pub title: &'a str,
    pub text: &'a str,
    pub collection_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_document_id: Option<&'a str>,
    pub publish: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub url: String,
}

/// Destination returned by `attachments.create`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadSlot {
    pub upload_url: String,
    #[serde(default)]
    pub form: Option<Map<String, Value>>,
    pub attachment: Attachment,
}

/// Downloaded image bytes with their declared MIME type.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

// ==============================
// Client
// ==============================

#[derive(Clone)]
pub struct OutlineClient {
    base: Url,
    token: String,
    inner: Client,
    pub default_timeout: Duration,
}

impl std::fmt::Debug for OutlineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutlineClient")
            .field("base", &self.base.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

impl OutlineClient {
    /// Construct a client anchored to the wiki's base URL.
    pub fn new(api_url: &str, token: &str) -> Result<Self, OutlineError> {
        let mut base = Url::parse(api_url.trim()).map_err(|e| OutlineError::Url(e.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let token = sanitize_token(token)?;
        let inner = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| OutlineError::Build(e.to_string()))?;
        Ok(Self {
            base,
            token,
            inner,
            default_timeout: Duration::from_secs(30),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolve a possibly relative URL returned by the service.
    pub fn resolve(&self, url: &str) -> String {
        self.base
            .join(url)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| url.to_string())
    }

    // ==============================
    // Documents & collections
    // ==============================

    pub async fn auth_info(&self) -> Result<AuthInfo, OutlineError> {
        self.rpc("auth.info", &json!({})).await
    }

    pub async fn list_collections(&self) -> Result<Vec<Collection>, OutlineError> {
        self.rpc("collections.list", &json!({ "limit": LIST_LIMIT }))
            .await
    }

    pub async fn list_documents(&self, collection_id: &str) -> Result<Vec<Document>, OutlineError> {
        self.rpc(
            "documents.list",
            &json!({ "collectionId": collection_id, "limit": LIST_LIMIT }),
        )
        .await
    }

    pub async fn create_document(&self, doc: &NewDocument<'_>) -> Result<Document, OutlineError> {
        self.rpc("documents.create", doc).await
    }

    /// Replace (or, with `append`, extend) a document's text.
    pub async fn update_document(
        &self,
        id: &str,
        text: &str,
        append: bool,
    ) -> Result<Document, OutlineError> {
        self.rpc(
            "documents.update",
            &json!({ "id": id, "text": text, "append": append, "publish": true }),
        )
        .await
    }

    pub async fn search_documents(
        &self,
        query: &str,
        collection_id: Option<&str>,
    ) -> Result<Vec<SearchHit>, OutlineError> {
        let mut body = json!({ "query": query, "limit": 25 });
        if let Some(id) = collection_id {
            body["collectionId"] = json!(id);
        }
        self.rpc("documents.search", &body).await
    }

    // ==============================
    // Attachments
    // ==============================

    pub async fn create_attachment(
        &self,
        name: &str,
        content_type: &str,
        size: usize,
    ) -> Result<UploadSlot, OutlineError> {
        self.rpc(
            "attachments.create",
            &json!({ "name": name, "contentType": content_type, "size": size }),
        )
        .await
    }

    /// Send bytes to a slot. Slots served by the wiki itself get the bearer
    /// token and the attachment id; presigned storage URLs get only the
    /// slot's form fields.
    pub async fn submit_upload(
        &self,
        slot: &UploadSlot,
        bytes: Vec<u8>,
        name: &str,
        content_type: &str,
    ) -> Result<(), OutlineError> {
        let target = self
            .base
            .join(&slot.upload_url)
            .map_err(|e| OutlineError::Url(e.to_string()))?;
        let direct = target.origin() == self.base.origin();

        let mut form = Form::new();
        if let Some(fields) = &slot.form {
            for (key, value) in fields {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                form = form.text(key.clone(), text);
            }
        }
        if direct {
            form = form.text("attachmentId", slot.attachment.id.clone());
        }
        let part = Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str(content_type)
            .map_err(|e| OutlineError::Build(e.to_string()))?;
        form = form.part("file", part);

        let mut rb = self
            .inner
            .post(target.clone())
            .timeout(self.default_timeout)
            .multipart(form);
        if direct {
            rb = rb.bearer_auth(&self.token);
        }

        tracing::debug!(
            host_path = %format!("{}{}", target.host_str().unwrap_or("-"), target.path()),
            direct,
            attachment_id = %slot.attachment.id,
            "outline.upload.start"
        );

        let resp = rb
            .send()
            .await
            .map_err(|e| OutlineError::Network(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let headers = resp.headers().clone();
        let body = resp.bytes().await.unwrap_or_default();
        Err(status_error(status, &headers, &body))
    }

    /// Fetch an image from its original location (no wiki credentials).
    pub async fn download_image(
        &self,
        url: &str,
        max_bytes: usize,
    ) -> Result<Download, OutlineError> {
        let mut resp = self
            .inner
            .get(url)
            .timeout(self.default_timeout)
            .send()
            .await
            .map_err(|e| OutlineError::Network(e.to_string()))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or_default();
            return Err(status_error(status, &headers, &body));
        }
        if let Some(len) = resp.content_length().filter(|&len| len > max_bytes as u64) {
            return Err(OutlineError::TooLarge {
                limit: max_bytes,
                size: len as usize,
            });
        }
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or("").trim().to_lowercase())
            .unwrap_or_default();

        let mut bytes = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| OutlineError::Network(e.to_string()))?
        {
            if bytes.len() + chunk.len() > max_bytes {
                return Err(OutlineError::TooLarge {
                    limit: max_bytes,
                    size: bytes.len() + chunk.len(),
                });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(Download {
            bytes,
            content_type,
        })
    }

    // ==============================
    // Core request implementation
    // ==============================

    async fn rpc<B, T>(&self, method: &str, body: &B) -> Result<T, OutlineError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self
            .base
            .join(&format!("api/{}", method))
            .map_err(|e| OutlineError::Url(e.to_string()))?;

        tracing::debug!(method, host = %url.host_str().unwrap_or("-"), "outline.request.start");
        let t0 = std::time::Instant::now();

        let resp = self
            .inner
            .post(url)
            .timeout(self.default_timeout)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| OutlineError::Network(e.to_string()))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| OutlineError::Network(e.to_string()))?;

        tracing::debug!(
            method,
            %status,
            duration_ms = t0.elapsed().as_millis() as u64,
            body_len = bytes.len(),
            "outline.response"
        );

        if !status.is_success() {
            let err = status_error(status, &headers, &bytes);
            tracing::warn!(method, %status, error = %err, "outline.error");
            return Err(err);
        }

        serde_json::from_slice::<Envelope<T>>(&bytes)
            .map(|env| env.data)
            .map_err(|e| OutlineError::Decode(e.to_string(), snip_body(&bytes)))
    }
}

// ==============================
// Helpers
// ==============================

fn status_error(status: StatusCode, headers: &reqwest::header::HeaderMap, body: &[u8]) -> OutlineError {
    match status {
        StatusCode::UNAUTHORIZED => {
            OutlineError::Auth(extract_error_message(body).unwrap_or_else(|| status.to_string()))
        }
        StatusCode::TOO_MANY_REQUESTS => OutlineError::RateLimited {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok()),
        },
        _ => OutlineError::Api {
            status,
            message: extract_error_message(body).unwrap_or_else(|| snip_body(body)),
        },
    }
}

/// `{"message": ...}`, `{"error": ...}` or `{"detail": ...}`.
fn extract_error_message(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Msg {
        #[serde(default)]
        message: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        detail: String,
    }

    let m = serde_json::from_slice::<Msg>(body).ok()?;
    [m.message, m.error, m.detail]
        .into_iter()
        .find(|s| !s.is_empty())
}

fn snip_body(body: &[u8]) -> String {
    let mut snip = String::from_utf8_lossy(body).to_string();
    if snip.len() > 500 {
        let mut cut = 500;
        while !snip.is_char_boundary(cut) {
            cut -= 1;
        }
        snip.truncate(cut);
        snip.push_str("...");
    }
    snip
}

fn sanitize_token(raw: &str) -> Result<String, OutlineError> {
    let mut s = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_string();
    s.retain(|ch| !ch.is_ascii_whitespace());

    if s.is_empty() {
        return Err(OutlineError::Build("API token is empty".into()));
    }
    if !s.is_ascii() || s.bytes().any(|b| b < 0x20 || b == 0x7F) {
        return Err(OutlineError::Build(
            "API token contains invalid characters".into(),
        ));
    }
    HeaderValue::from_str(&format!("Bearer {}", s))
        .map_err(|e| OutlineError::Build(format!("invalid Authorization header: {e}")))?;
    Ok(s)
}
