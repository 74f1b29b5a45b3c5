mod common;

use outline_clipper::outline::{NewDocument, OutlineError};
use reqwest::StatusCode;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn unauthorized_maps_to_auth_error() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth.info"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({ "ok": false, "error": "authentication_required", "message": "Authentication required" })),
        )
        .mount(&server)
        .await;

    let err = common::client(&server).auth_info().await.unwrap_err();
    match err {
        OutlineError::Auth(message) => assert_eq!(message, "Authentication required"),
        other => panic!("expected auth error, got {other:?}"),
    }
}

#[tokio::test]
async fn api_errors_carry_the_service_message() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/documents.create"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({ "error": "validation_error", "message": "collectionId: Invalid uuid" })),
        )
        .mount(&server)
        .await;

    let err = common::client(&server)
        .create_document(&NewDocument {
            title: "T",
            text: "body",
            collection_id: "nope",
            parent_document_id: None,
            publish: true,
        })
        .await
        .unwrap_err();
    match err {
        OutlineError::Api { status, message } => {
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(message, "collectionId: Invalid uuid");
        }
        other => panic!("expected api error, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limit_reads_retry_after() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/collections.list"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
        .mount(&server)
        .await;

    let err = common::client(&server).list_collections().await.unwrap_err();
    assert!(matches!(err, OutlineError::RateLimited { retry_after: Some(3) }));
}

#[tokio::test]
async fn envelopes_are_unwrapped_and_requests_are_authenticated() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/collections.list"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": "c1", "name": "Reading", "description": null },
                { "id": "c2", "name": "Research" }
            ],
            "pagination": { "offset": 0, "limit": 100 }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/documents.create"))
        .and(body_partial_json(json!({
            "title": "Clip",
            "collectionId": "c1",
            "parentDocumentId": "p1",
            "publish": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "d1", "title": "Clip", "url": "/doc/clip-d1" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::client(&server);
    let collections = client.list_collections().await.unwrap();
    assert_eq!(collections.len(), 2);
    assert_eq!(collections[1].name, "Research");

    let doc = client
        .create_document(&NewDocument {
            title: "Clip",
            text: "# Clip",
            collection_id: "c1",
            parent_document_id: Some("p1"),
            publish: true,
        })
        .await
        .unwrap();
    assert_eq!(doc.id, "d1");
    assert_eq!(
        client.resolve(doc.url.as_deref().unwrap()),
        format!("{}/doc/clip-d1", server.uri())
    );
}

#[tokio::test]
async fn undecodable_success_is_a_decode_error() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth.info"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = common::client(&server).auth_info().await.unwrap_err();
    assert!(matches!(err, OutlineError::Decode(_, ref body) if body.contains("maintenance")));
}

#[tokio::test]
async fn search_and_append() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/documents.search"))
        .and(body_partial_json(json!({ "query": "rust", "collectionId": "c1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [ { "context": "about <b>rust</b>", "document": { "id": "d1", "title": "Rust notes" } } ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/documents.update"))
        .and(body_partial_json(json!({ "id": "d1", "append": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "d1", "title": "Rust notes" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = common::client(&server);
    let hits = client.search_documents("rust", Some("c1")).await.unwrap();
    assert_eq!(hits[0].document.title, "Rust notes");

    let doc = client.update_document("d1", "\n\nmore", true).await.unwrap();
    assert_eq!(doc.id, "d1");
}

#[tokio::test]
async fn download_stops_at_the_byte_cap() {
    common::init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(vec![7u8; 64]),
        )
        .mount(&server)
        .await;

    let client = common::client(&server);
    let url = format!("{}/big.png", server.uri());
    let err = client.download_image(&url, 32).await.unwrap_err();
    assert!(matches!(err, OutlineError::TooLarge { limit: 32, .. }), "{err}");

    let download = client.download_image(&url, 64).await.expect("within cap");
    assert_eq!(download.bytes.len(), 64);
    assert_eq!(download.content_type, "image/png");
}
