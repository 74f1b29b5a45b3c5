use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Extraction ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    /// Absolute address the bytes are fetched from.
    pub original_url: String,
    /// Literal substring that appears in the document body.
    pub markdown_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default)]
    pub is_content_image: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PageContent {
    pub title: String,
    pub content: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlights: Option<Vec<String>>,
}

/// A page (or a selected region of it) handed to the extractor.
#[derive(Debug, Clone, Default)]
pub struct PageSource {
    pub html: String,
    pub url: String,
    pub selection_html: Option<String>,
    pub highlights: Option<Vec<String>>,
}

// ── Options & persisted state ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClipperOptions {
    pub include_images: bool,
    pub upload_images: bool,
    pub simplify_content: bool,
    pub add_source_url: bool,
    pub add_timestamp: bool,
    pub add_highlights: bool,
    pub remove_ads: bool,
    pub keep_formatting: bool,
    pub tags: Vec<String>,
}

impl Default for ClipperOptions {
    fn default() -> Self {
        Self {
            include_images: true,
            upload_images: true,
            simplify_content: false,
            add_source_url: true,
            add_timestamp: false,
            add_highlights: true,
            remove_ads: true,
            keep_formatting: true,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    pub is_uploading: bool,
    pub current_index: usize,
    pub total_images: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    pub should_stop: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub collection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_document_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecentClip {
    pub document_id: String,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,
    pub clipped_at: DateTime<Utc>,
}

// ── Service DTOs ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractRequest {
    pub url: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub selection_html: Option<String>,
    #[serde(default)]
    pub options: Option<ClipperOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipRequest {
    pub url: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub selection_html: Option<String>,
    #[serde(default)]
    pub highlights: Option<Vec<String>>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub parent_document_id: Option<String>,
    #[serde(default)]
    pub options: Option<ClipperOptions>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClipOutcome {
    pub document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,
    pub title: String,
    pub images_processed: usize,
    pub images_uploaded: usize,
    pub stopped: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub api_url: String,
    pub api_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub collection_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    pub document_id: String,
    pub text: String,
}
