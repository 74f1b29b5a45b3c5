#![allow(dead_code)]

use std::sync::OnceLock;
use std::time::Duration;

use outline_clipper::outline::OutlineClient;
use outline_clipper::pipeline::RetryPolicy;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

static INIT: OnceLock<()> = OnceLock::new();

pub fn init_test_tracing() {
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];

/// Same schedule shape as the default, scaled down to milliseconds.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(20),
        inter_image_delay: Duration::ZERO,
    }
}

pub fn client(server: &MockServer) -> OutlineClient {
    OutlineClient::new(&server.uri(), "test-token").expect("client")
}

pub fn slot(upload_url: &str, attachment_url: &str) -> Value {
    json!({
        "data": {
            "uploadUrl": upload_url,
            "form": { "key": "uploads/abc", "acl": "public-read" },
            "attachment": { "id": "att-1", "url": attachment_url }
        }
    })
}

pub async fn mount_image(server: &MockServer, image_path: &str, expected_calls: u64) {
    Mock::given(method("GET"))
        .and(path(image_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(PNG.to_vec()),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

/// Direct upload endpoint served by the wiki itself.
pub async fn mount_direct_upload(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/api/files.create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(expected_calls)
        .mount(server)
        .await;
}
