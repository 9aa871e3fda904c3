//! HTTP contract of the vision oracle client.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use image::RgbImage;
use serde_json::json;

use remote_pilot::vlm::{OllamaClient, SemanticLocator, VisionOracle, VlmConfig, VlmError, check_health};

fn client(url: &str, timeout: u64) -> OllamaClient {
    OllamaClient::new(VlmConfig::new(url).model("llava:7b").timeout(timeout)).unwrap()
}

fn frame() -> RgbImage {
    RgbImage::new(800, 600)
}

/// A local port with nothing listening on it
fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}

#[test]
fn test_generate_returns_response_text() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"model": "llava:7b", "response": "A login dialog", "done": true}));
    });

    let reply = client(&server.base_url(), 10).generate(&frame(), "What is shown?").unwrap();

    assert_eq!(reply, "A login dialog");
    mock.assert();
}

#[test]
fn test_trailing_slash_in_base_url() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200).json_body(json!({"response": "ok"}));
    });

    let url = format!("{}/", server.base_url());
    assert_eq!(client(&url, 10).generate(&frame(), "ping").unwrap(), "ok");
    mock.assert();
}

#[test]
fn test_non_200_is_status_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(404).body("model 'llava:7b' not found");
    });

    let err = client(&server.base_url(), 10).generate(&frame(), "hi").unwrap_err();
    match err {
        VlmError::Status { code, body } => {
            assert_eq!(code, 404);
            assert!(body.contains("not found"));
        }
        other => panic!("expected status error, got {other}"),
    }
}

#[test]
fn test_body_without_response_field_is_invalid() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200).json_body(json!({"error": "oops"}));
    });

    let err = client(&server.base_url(), 10).generate(&frame(), "hi").unwrap_err();
    assert!(matches!(err, VlmError::InvalidResponse(_)), "{err}");
}

#[test]
fn test_slow_server_is_timeout() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200)
            .delay(Duration::from_secs(3))
            .json_body(json!({"response": "late"}));
    });

    let err = client(&server.base_url(), 1).generate(&frame(), "hi").unwrap_err();
    assert!(matches!(err, VlmError::Timeout(_)), "{err}");
}

#[test]
fn test_closed_port_is_unreachable() {
    let url = closed_port_url();
    let err = client(&url, 5).generate(&frame(), "hi").unwrap_err();
    match err {
        VlmError::Unreachable(target) => assert_eq!(target, url),
        other => panic!("expected unreachable, got {other}"),
    }
}

#[test]
fn test_locator_over_http_falls_back_to_region() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200).json_body(json!({"response": "TOP-RIGHT"}));
    });

    let locator = SemanticLocator::new(Arc::new(client(&server.base_url(), 10)));
    let result = locator.find_element(&frame(), "the close button").unwrap();

    assert!(result.found);
    assert_eq!((result.x, result.y, result.confidence), (Some(600), Some(150), Some(60)));
    // Phase one yields no JSON, so both phases hit the server
    mock.assert_hits(2);
}

#[test]
fn test_check_health() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/tags");
        then.status(200).json_body(json!({"models": []}));
    });

    assert!(check_health(&server.base_url(), 5).unwrap());
    assert!(!check_health(&closed_port_url(), 2).unwrap());
}
