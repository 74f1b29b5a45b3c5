use crate::error::ClipError;
use crate::extract::{fetch_page, ExtractionError, Extractor};
use crate::models::{
    AppendRequest, ClipOutcome, ClipRequest, ClipperOptions, ConnectionRequest, ExtractRequest,
    Location, PageContent, PageSource, RecentClip, SearchRequest, UploadState,
};
use crate::outline::{AuthInfo, Collection, Document, NewDocument, OutlineClient, SearchHit};
use crate::pipeline::{ImagePipeline, PipelineOutcome, PipelineStatus, RetryPolicy, UploadProgress};
use crate::store::{Store, StoredConfig};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

// ── Service ──────────────────────────────────────────────────────────────────

/// Everything a clip needs: settings, extraction and the single upload slot.
pub struct ClipService {
    store: Arc<Store>,
    extractor: Extractor,
    policy: RetryPolicy,
    active_upload: Mutex<Option<CancellationToken>>,
}

impl ClipService {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            extractor: Extractor::default(),
            policy: RetryPolicy::default(),
            active_upload: Mutex::new(None),
        }
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ── Extraction ───────────────────────────────────────────────────────────

    pub async fn extract(&self, req: ExtractRequest) -> Result<PageContent, ClipError> {
        let options = req
            .options
            .unwrap_or_else(|| self.store.snapshot().options);
        let html = load_html(&req.url, req.html).await?;
        let page = PageSource {
            html,
            url: req.url,
            selection_html: req.selection_html,
            highlights: None,
        };
        Ok(self.extractor.extract(&page, &options)?)
    }

    /// Extract only the user's selection; a missing or blank one is rejected.
    pub async fn extract_selection(&self, req: ExtractRequest) -> Result<PageContent, ClipError> {
        let has_selection = req
            .selection_html
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        if !has_selection {
            return Err(ExtractionError::EmptySelection.into());
        }
        self.extract(req).await
    }

    // ── Clipping ─────────────────────────────────────────────────────────────

    /// Extract, decorate, re-host images and create the document.
    pub async fn clip(&self, req: ClipRequest) -> Result<ClipOutcome, ClipError> {
        let cfg = self.store.snapshot();
        let client = client_from(&cfg)?;
        let options = req.options.clone().unwrap_or_else(|| cfg.options.clone());
        let location = resolve_location(&req, &cfg)?;

        let html = load_html(&req.url, req.html).await?;
        let page = PageSource {
            html,
            url: req.url,
            selection_html: req.selection_html,
            highlights: req.highlights,
        };
        let mut content = self.extractor.extract(&page, &options)?;
        if let Some(title) = req.title.filter(|t| !t.trim().is_empty()) {
            content.title = title.trim().to_string();
        }

        let body = decorate(&content, &options, Utc::now());
        let images = std::mem::take(&mut content.images);

        let outcome = if options.include_images && options.upload_images && !images.is_empty() {
            self.upload_images(&client, body, images).await?
        } else {
            PipelineOutcome {
                content: body,
                images: Vec::new(),
                processed: 0,
                uploaded: 0,
                status: PipelineStatus::Done,
            }
        };

        let doc = client
            .create_document(&NewDocument {
                title: &content.title,
                text: &outcome.content,
                collection_id: &location.collection_id,
                parent_document_id: location.parent_document_id.as_deref(),
                publish: true,
            })
            .await?;
        let document_url = doc.url.as_deref().map(|u| client.resolve(u));

        let recent = RecentClip {
            document_id: doc.id.clone(),
            title: content.title.clone(),
            url: content.url.clone(),
            document_url: document_url.clone(),
            clipped_at: Utc::now(),
        };
        self.store.update(|cfg| {
            cfg.push_recent(recent);
            cfg.last_location = Some(location);
        })?;

        tracing::info!(
            document_id = %doc.id,
            title = %content.title,
            images_processed = outcome.processed,
            images_uploaded = outcome.uploaded,
            status = ?outcome.status,
            "clip.done"
        );

        Ok(ClipOutcome {
            document_id: doc.id,
            document_url,
            title: content.title,
            images_processed: outcome.processed,
            images_uploaded: outcome.uploaded,
            stopped: outcome.status == PipelineStatus::Stopped,
        })
    }

    async fn upload_images(
        &self,
        client: &OutlineClient,
        body: String,
        images: Vec<crate::models::ImageInfo>,
    ) -> Result<PipelineOutcome, ClipError> {
        let session = UploadSession::begin(self)?;
        self.store.set_upload_state(UploadState {
            is_uploading: true,
            current_index: 0,
            total_images: images.len(),
            start_time: Some(Utc::now()),
            should_stop: false,
        })?;

        let store = self.store.clone();
        let mut mirror = move |p: &UploadProgress| {
            let (index, total) = (p.index, p.total);
            store.update_in_background(move |cfg| {
                cfg.upload_state.current_index = index;
                cfg.upload_state.total_images = total;
            });
        };

        let outcome = ImagePipeline::new(client, self.policy.clone())
            .run(body, images, &session.token, &mut mirror)
            .await;
        drop(session);
        Ok(outcome)
    }

    /// Ask the running upload, if any, to stop before its next image.
    pub fn request_stop(&self) -> bool {
        let token = lock(&self.active_upload).clone();
        match token {
            Some(token) => {
                token.cancel();
                if let Err(err) = self.store.update(|cfg| cfg.upload_state.should_stop = true) {
                    tracing::warn!(error = %err, "clip.upload_state_write_failed");
                }
                tracing::info!("clip.stop_requested");
                true
            }
            None => false,
        }
    }

    pub fn upload_state(&self) -> UploadState {
        self.store.upload_state()
    }

    // ── Wiki operations ──────────────────────────────────────────────────────

    /// Check credentials. Explicit credentials are saved once they work.
    pub async fn test_connection(
        &self,
        req: Option<ConnectionRequest>,
    ) -> Result<AuthInfo, ClipError> {
        let client = match &req {
            Some(r) => OutlineClient::new(&r.api_url, &r.api_token)?,
            None => client_from(&self.store.snapshot())?,
        };
        let info = client
            .auth_info()
            .await
            .map_err(ClipError::from_auth_check)?;
        if let Some(r) = req {
            self.store.update(|cfg| {
                cfg.api_url = Some(r.api_url.trim().to_string());
                cfg.api_token = Some(r.api_token.trim().to_string());
            })?;
        }
        tracing::info!(user = %info.user.name, team = %info.team.name, "clip.connection_ok");
        Ok(info)
    }

    pub async fn collections(&self) -> Result<Vec<Collection>, ClipError> {
        Ok(client_from(&self.store.snapshot())?
            .list_collections()
            .await?)
    }

    pub async fn documents(&self, collection_id: &str) -> Result<Vec<Document>, ClipError> {
        Ok(client_from(&self.store.snapshot())?
            .list_documents(collection_id)
            .await?)
    }

    pub async fn search(&self, req: SearchRequest) -> Result<Vec<SearchHit>, ClipError> {
        Ok(client_from(&self.store.snapshot())?
            .search_documents(&req.query, req.collection_id.as_deref())
            .await?)
    }

    /// Append markdown to an existing document.
    pub async fn append(&self, req: AppendRequest) -> Result<Document, ClipError> {
        let text = format!("\n\n{}", req.text.trim());
        Ok(client_from(&self.store.snapshot())?
            .update_document(&req.document_id, &text, true)
            .await?)
    }

    pub fn recent(&self) -> Vec<RecentClip> {
        self.store.snapshot().recent_clips
    }

    pub fn options(&self) -> ClipperOptions {
        self.store.snapshot().options
    }

    pub fn set_options(&self, options: ClipperOptions) -> Result<ClipperOptions, ClipError> {
        self.store.update(|cfg| cfg.options = options.clone())?;
        Ok(options)
    }
}

// ── Upload session ───────────────────────────────────────────────────────────

/// Holds the single upload slot; releasing it clears the shared state even
/// when the clip future is dropped mid-batch.
struct UploadSession<'a> {
    service: &'a ClipService,
    token: CancellationToken,
}

impl<'a> UploadSession<'a> {
    fn begin(service: &'a ClipService) -> Result<Self, ClipError> {
        let mut active = lock(&service.active_upload);
        if active.is_some() {
            return Err(ClipError::Busy);
        }
        let token = CancellationToken::new();
        *active = Some(token.clone());
        Ok(Self { service, token })
    }
}

impl Drop for UploadSession<'_> {
    fn drop(&mut self) {
        *lock(&self.service.active_upload) = None;
        if let Err(err) = self.service.store.set_upload_state(UploadState::default()) {
            tracing::warn!(error = %err, "clip.upload_state_write_failed");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

async fn load_html(url: &str, html: Option<String>) -> Result<String, ClipError> {
    match html.filter(|h| !h.trim().is_empty()) {
        Some(html) => Ok(html),
        None => Ok(fetch_page(url).await?),
    }
}

fn client_from(cfg: &StoredConfig) -> Result<OutlineClient, ClipError> {
    let url = cfg
        .api_url
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ClipError::Config("API URL is not set".into()))?;
    let token = cfg
        .api_token
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ClipError::Config("API token is not set".into()))?;
    OutlineClient::new(url, token).map_err(|e| ClipError::Config(e.to_string()))
}

/// Explicit request location, then the last used one, then the default
/// collection.
fn resolve_location(req: &ClipRequest, cfg: &StoredConfig) -> Result<Location, ClipError> {
    if let Some(id) = req.collection_id.as_deref().filter(|s| !s.is_empty()) {
        return Ok(Location {
            collection_id: id.to_string(),
            parent_document_id: req.parent_document_id.clone().filter(|s| !s.is_empty()),
        });
    }
    if let Some(last) = &cfg.last_location {
        return Ok(last.clone());
    }
    cfg.default_collection_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|id| Location {
            collection_id: id.to_string(),
            parent_document_id: None,
        })
        .ok_or_else(|| ClipError::Config("no collection selected".into()))
}

/// Document body with highlights, source, timestamp and tags appended as the
/// options ask.
pub fn decorate(page: &PageContent, options: &ClipperOptions, now: DateTime<Utc>) -> String {
    let mut out = page.content.trim_end().to_string();

    if options.add_highlights {
        let highlights: Vec<String> = page
            .highlights
            .iter()
            .flatten()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .map(quote)
            .collect();
        if !highlights.is_empty() {
            out.push_str("\n\n## Highlights\n\n");
            out.push_str(&highlights.join("\n\n"));
        }
    }

    let mut footer = Vec::new();
    if options.add_source_url {
        footer.push(format!(
            "> Source: [{}]({})",
            escape_link_text(&page.title),
            page.url
        ));
    }
    if options.add_timestamp {
        footer.push(format!(
            "> Clipped: {}",
            now.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    let tags: Vec<String> = options
        .tags
        .iter()
        .map(|t| t.trim().trim_start_matches('#').split_whitespace().collect::<Vec<_>>().join("-"))
        .filter(|t| !t.is_empty())
        .map(|t| format!("#{t}"))
        .collect();
    if !tags.is_empty() {
        footer.push(format!("Tags: {}", tags.join(" ")));
    }

    if !footer.is_empty() {
        out.push_str("\n\n---\n\n");
        out.push_str(&footer.join("\n\n"));
    }
    out
}

fn quote(text: &str) -> String {
    text.lines()
        .map(|l| format!("> {}", l.trim()).trim_end().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_link_text(text: &str) -> String {
    text.replace('[', "\\[").replace(']', "\\]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn page() -> PageContent {
        PageContent {
            title: "Rust [2024]".into(),
            content: "Body text.\n".into(),
            url: "https://blog.example.com/post".into(),
            highlights: Some(vec!["first line\nsecond".into(), "  ".into()]),
            ..Default::default()
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn default_options_add_source_and_highlights() {
        let out = decorate(&page(), &ClipperOptions::default(), at());
        assert_eq!(
            out,
            "Body text.\n\n## Highlights\n\n> first line\n> second\n\n---\n\n\
             > Source: [Rust \\[2024\\]](https://blog.example.com/post)"
        );
    }

    #[test]
    fn timestamp_and_tags() {
        let options = ClipperOptions {
            add_source_url: false,
            add_highlights: false,
            add_timestamp: true,
            tags: vec!["rust".into(), "#web dev".into(), " ".into()],
            ..Default::default()
        };
        let out = decorate(&page(), &options, at());
        assert_eq!(
            out,
            "Body text.\n\n---\n\n> Clipped: 2024-05-01T12:30:00Z\n\nTags: #rust #web-dev"
        );
    }

    #[test]
    fn nothing_to_add() {
        let options = ClipperOptions {
            add_source_url: false,
            add_highlights: false,
            ..Default::default()
        };
        assert_eq!(decorate(&page(), &options, at()), "Body text.");
    }

    fn request(collection: Option<&str>) -> ClipRequest {
        ClipRequest {
            url: "https://x.com".into(),
            html: None,
            selection_html: None,
            highlights: None,
            title: None,
            collection_id: collection.map(str::to_string),
            parent_document_id: Some("parent".into()),
            options: None,
        }
    }

    #[test]
    fn location_precedence() {
        let mut cfg = StoredConfig {
            default_collection_id: Some("default".into()),
            ..Default::default()
        };
        assert_eq!(resolve_location(&request(None), &cfg).unwrap().collection_id, "default");

        cfg.last_location = Some(Location {
            collection_id: "last".into(),
            parent_document_id: None,
        });
        assert_eq!(resolve_location(&request(None), &cfg).unwrap().collection_id, "last");

        let explicit = resolve_location(&request(Some("given")), &cfg).unwrap();
        assert_eq!(explicit.collection_id, "given");
        assert_eq!(explicit.parent_document_id.as_deref(), Some("parent"));

        assert!(matches!(
            resolve_location(&request(None), &StoredConfig::default()),
            Err(ClipError::Config(_))
        ));
    }

    #[test]
    fn missing_credentials_are_config_errors() {
        let err = client_from(&StoredConfig::default()).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn second_session_is_busy_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("s.json")).unwrap());
        let service = ClipService::new(store);

        let session = UploadSession::begin(&service).unwrap();
        assert!(matches!(UploadSession::begin(&service), Err(ClipError::Busy)));
        assert!(service.request_stop());
        assert!(session.token.is_cancelled());
        assert!(service.upload_state().should_stop);

        drop(session);
        assert!(!service.request_stop());
        assert_eq!(service.upload_state(), UploadState::default());
        assert!(UploadSession::begin(&service).is_ok());
    }

    #[tokio::test]
    async fn selection_extract_requires_a_selection() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("s.json")).unwrap());
        let service = ClipService::new(store);
        let request = |selection: Option<&str>| ExtractRequest {
            url: "https://blog.example.com/post".into(),
            html: Some("<html><body><p>Whole page</p></body></html>".into()),
            selection_html: selection.map(str::to_string),
            options: None,
        };

        for missing in [None, Some("  \n ")] {
            let err = service.extract_selection(request(missing)).await.unwrap_err();
            assert!(matches!(err, ClipError::Extraction(ExtractionError::EmptySelection)));
            assert_eq!(err.category(), "extraction");
        }

        let content = service
            .extract_selection(request(Some("<p>Just <b>this</b></p>")))
            .await
            .unwrap();
        assert_eq!(content.selection.as_deref(), Some("Just this"));
        assert!(!content.content.contains("Whole page"));
    }
}
