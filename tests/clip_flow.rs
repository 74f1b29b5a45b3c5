mod common;

use std::sync::Arc;

use outline_clipper::extract::{ContainerHeuristic, Extractor};
use outline_clipper::models::{ClipRequest, ClipperOptions};
use outline_clipper::store::Store;
use outline_clipper::{ClipError, ClipService};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(server: &MockServer, dir: &tempfile::TempDir) -> ClipService {
    let store = Arc::new(Store::open(dir.path().join("clipper.json")).unwrap());
    store
        .update(|cfg| {
            cfg.api_url = Some(server.uri());
            cfg.api_token = Some("test-token".into());
            cfg.default_collection_id = Some("col-1".into());
        })
        .unwrap();
    ClipService::new(store)
        .with_extractor(Extractor::new(Box::new(ContainerHeuristic)))
        .with_retry_policy(common::fast_policy())
}

fn page_html(image_url: &str) -> String {
    format!(
        r#"<html><head><title>Field Notes</title></head><body>
        <nav><a href="/">Home</a></nav>
        <article>
          <h1>Field Notes</h1>
          <p>We walked along the ridge for most of the afternoon and took a few pictures.</p>
          <img src="{image_url}" alt="Ridge" width="1200" height="800">
          <p>The light was good until about five, after which the clouds rolled in.</p>
        </article>
        </body></html>"#
    )
}

fn request(url: &str, html: String) -> ClipRequest {
    ClipRequest {
        url: url.to_string(),
        html: Some(html),
        selection_html: None,
        highlights: Some(vec!["the clouds rolled in".into()]),
        title: None,
        collection_id: None,
        parent_document_id: None,
        options: None,
    }
}

#[tokio::test]
async fn clip_uploads_images_and_creates_document() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let image_url = format!("{}/media/ridge.png", server.uri());

    common::mount_image(&server, "/media/ridge.png", 1).await;
    Mock::given(method("POST"))
        .and(path("/api/attachments.create"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::slot("/api/files.create", "/api/attachments.redirect?id=att-1")),
        )
        .expect(1)
        .mount(&server)
        .await;
    common::mount_direct_upload(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/api/documents.create"))
        .and(body_partial_json(json!({ "title": "Field Notes", "collectionId": "col-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "doc-9", "title": "Field Notes", "url": "/doc/field-notes-doc9" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let svc = service(&server, &dir);
    let outcome = svc
        .clip(request("https://trail.example.com/notes", page_html(&image_url)))
        .await
        .expect("clip succeeds");

    assert_eq!(outcome.document_id, "doc-9");
    assert_eq!(outcome.images_processed, 1);
    assert_eq!(outcome.images_uploaded, 1);
    assert!(!outcome.stopped);
    assert_eq!(
        outcome.document_url.as_deref(),
        Some(format!("{}/doc/field-notes-doc9", server.uri()).as_str())
    );

    let created = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path() == "/api/documents.create")
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&created.body).unwrap();
    let text = body["text"].as_str().unwrap();
    let hosted = format!("{}/api/attachments.redirect?id=att-1", server.uri());
    assert!(text.contains(&format!("![Ridge]({hosted})")), "{text}");
    assert!(!text.contains(&image_url));
    assert!(!text.contains("Home"));
    assert!(text.contains("## Highlights\n\n> the clouds rolled in"));
    assert!(text.ends_with("> Source: [Field Notes](https://trail.example.com/notes)"));

    let cfg = svc.store().snapshot();
    assert_eq!(cfg.recent_clips.len(), 1);
    assert_eq!(cfg.recent_clips[0].document_id, "doc-9");
    assert_eq!(cfg.last_location.unwrap().collection_id, "col-1");
    assert!(!cfg.upload_state.is_uploading);
}

#[tokio::test]
async fn image_failures_do_not_block_the_document() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let image_url = format!("{}/media/ridge.png", server.uri());

    Mock::given(method("GET"))
        .and(path("/media/ridge.png"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/documents.create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "doc-1", "title": "Field Notes" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let svc = service(&server, &dir);
    let outcome = svc
        .clip(request("https://trail.example.com/notes", page_html(&image_url)))
        .await
        .expect("document is still created");
    assert_eq!(outcome.images_processed, 1);
    assert_eq!(outcome.images_uploaded, 0);

    let created = &server.received_requests().await.unwrap()[1];
    let body: serde_json::Value = serde_json::from_slice(&created.body).unwrap();
    assert!(body["text"].as_str().unwrap().contains(&image_url));
}

#[tokio::test]
async fn upload_disabled_skips_the_pipeline() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let image_url = format!("{}/media/ridge.png", server.uri());
    common::mount_image(&server, "/media/ridge.png", 0).await;
    Mock::given(method("POST"))
        .and(path("/api/documents.create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "doc-2", "title": "Field Notes" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let svc = service(&server, &dir);
    let mut req = request("https://trail.example.com/notes", page_html(&image_url));
    req.options = Some(ClipperOptions {
        upload_images: false,
        ..Default::default()
    });
    let outcome = svc.clip(req).await.unwrap();
    assert_eq!(outcome.images_processed, 0);
}

#[tokio::test]
async fn remote_failure_is_surfaced_with_message() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("POST"))
        .and(path("/api/documents.create"))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({ "message": "Not allowed in this collection" })),
        )
        .mount(&server)
        .await;

    let svc = service(&server, &dir);
    let mut req = request(
        "https://trail.example.com/notes",
        "<html><body><article><p>Just text that is long enough to count as content.</p></article></body></html>".into(),
    );
    req.options = Some(ClipperOptions {
        include_images: false,
        ..Default::default()
    });
    let err = svc.clip(req).await.unwrap_err();
    assert_eq!(err.category(), "remote");
    assert!(matches!(err, ClipError::RemoteApi(_)));
    assert!(err.to_string().contains("Not allowed in this collection"));
    assert!(svc.recent().is_empty());
}

#[tokio::test]
async fn empty_page_is_an_extraction_error() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let svc = service(&server, &dir);

    let err = svc
        .clip(request("https://trail.example.com/empty", "<html><body>  </body></html>".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, ClipError::Extraction(_)));
    assert_eq!(err.to_string(), "No readable content found");
}

#[tokio::test]
async fn test_connection_saves_working_credentials() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    Mock::given(method("POST"))
        .and(path("/api/auth.info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "user": { "id": "u1", "name": "Sam" },
                "team": { "id": "t1", "name": "Docs" }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(Store::open(dir.path().join("c.json")).unwrap());
    let svc = ClipService::new(store);
    let info = svc
        .test_connection(Some(outline_clipper::models::ConnectionRequest {
            api_url: server.uri(),
            api_token: "fresh-token".into(),
        }))
        .await
        .unwrap();
    assert_eq!(info.team.name, "Docs");
    assert_eq!(svc.store().snapshot().api_token.as_deref(), Some("fresh-token"));
}
