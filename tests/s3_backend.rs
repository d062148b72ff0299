//! S3 backend against a mocked S3 endpoint (`wiremock`).
//!
//! Verifies the object layout, the metadata and tags sent with each record,
//! and how HTTP statuses map onto backend results.

use std::time::Duration;

use wiremock::matchers::{header_exists, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use whisper::models::secret::{derive_key_material, Secret};
use whisper::store::object::{ObjectBackend, S3Config};
use whisper::store::Backend;

fn config(server: &MockServer) -> S3Config {
    S3Config {
        bucket_name: "bucket".into(),
        bucket_path: "whisper".into(),
        region: "us-east-1".into(),
        endpoint: Some(server.uri()),
        access_key_id: Some("test-key".into()),
        secret_access_key: Some("test-secret".into()),
        timeout: Duration::from_secs(5),
    }
}

fn secret() -> Secret {
    Secret::new("1 day", &derive_key_material("p1", "k"), "CIPHERTEXT", 4).unwrap()
}

#[tokio::test]
async fn test_put_sends_metadata_and_tags() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/bucket/whisper/[0-9a-f]{40}\.json$"))
        .and(header_exists("x-amz-tagging"))
        .and(header_exists("x-amz-meta-create_date"))
        .and(header_exists("x-amz-meta-expire_date"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"abc\""))
        .expect(1)
        .mount(&server)
        .await;

    let backend = ObjectBackend::s3(config(&server)).unwrap();
    backend.put(&secret()).await.unwrap();
}

#[tokio::test]
async fn test_get_found_and_missing() {
    let server = MockServer::start().await;
    let s = secret();
    let body = serde_json::to_vec(&s).unwrap();

    Mock::given(method("GET"))
        .and(path(format!("/bucket/whisper/{}.json", s.id)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"abc\"")
                .insert_header("Last-Modified", "Wed, 01 Jan 2025 00:00:00 GMT")
                .insert_header("x-amz-meta-create_date", s.create_date.to_string().as_str())
                .insert_header("x-amz-meta-expire_date", s.expire_date.to_string().as_str())
                .set_body_bytes(body),
        )
        .mount(&server)
        .await;

    let backend = ObjectBackend::s3(config(&server)).unwrap();
    assert_eq!(backend.get(&s.id).await.unwrap(), Some(s.clone()));

    // Anything unmatched answers 404.
    let other = "f".repeat(40);
    assert_eq!(backend.get(&other).await.unwrap(), None);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/bucket/whisper/[0-9a-f]{40}\.json$"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let backend = ObjectBackend::s3(config(&server)).unwrap();
    let id = "a".repeat(40);
    backend.delete(&id).await.unwrap();
    backend.delete(&id).await.unwrap();
    // Malformed ids never reach the network.
    backend.delete("../other").await.unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_start_probes_bucket() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bucket"))
        .and(query_param("list-type", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Name>bucket</Name><Prefix>whisper/</Prefix><KeyCount>0</KeyCount><MaxKeys>1000</MaxKeys><Delimiter>/</Delimiter><IsTruncated>false</IsTruncated></ListBucketResult>"#,
        ))
        .expect(1..)
        .mount(&server)
        .await;

    let backend = ObjectBackend::s3(config(&server)).unwrap();
    backend.start().await.unwrap();
}

#[tokio::test]
async fn test_start_fails_for_missing_bucket() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?><Error><Code>NoSuchBucket</Code></Error>"#,
        ))
        .mount(&server)
        .await;

    let backend = ObjectBackend::s3(config(&server)).unwrap();
    assert!(backend.start().await.is_err());
}
