//! HTTP surface, served on a local port over in-memory collaborators.
//!
//! Run with: cargo test --test api_test

mod helpers;

use helpers::*;
use photo_dedup::db::PhotoRepository;
use photo_dedup::models::photo::DuplicateStatus;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::Value;

fn image_part(name: &str, bytes: Vec<u8>) -> Part {
    Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str("image/png")
        .expect("valid mime")
}

async fn upload(client: &reqwest::Client, base_url: &str, form: Form) -> (StatusCode, Value) {
    let response = client
        .post(format!("{base_url}/api/v1/upload"))
        .multipart(form)
        .send()
        .await
        .expect("upload request");
    let status = response.status();
    (status, response.json().await.expect("json body"))
}

#[tokio::test]
async fn test_upload_reports_stored_and_failed_files() {
    let env = TestEnv::new();
    let base_url = env.spawn_server().await;
    let client = reqwest::Client::new();

    let form = Form::new()
        .part("images", image_part("a.png", noise_png(1)))
        .part("images", image_part("notes.png", b"not an image".to_vec()))
        .part("images", image_part("b.png", noise_png(2)));
    let (status, body) = upload(&client, &base_url, form).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["uploaded"].as_array().unwrap().len(), 2);
    assert_eq!(body["failed"][0]["index"], 1);
    assert_eq!(body["failed"][0]["filename"], "notes.png");
    assert_eq!(body["uploaded"][0]["duplicateStatus"]["state"], "unknown");
    assert_eq!(env.queue.jobs().len(), 2);
}

#[tokio::test]
async fn test_upload_with_every_file_failing_is_bad_gateway() {
    let env = TestEnv::new();
    env.blobs.fail_upload_call(1);
    let base_url = env.spawn_server().await;
    let client = reqwest::Client::new();

    let form = Form::new().part("images", image_part("a.png", noise_png(1)));
    let (status, body) = upload(&client, &base_url, form).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["uploaded"].as_array().unwrap().is_empty());
    assert_eq!(body["failed"][0]["code"], "storage");
}

#[tokio::test]
async fn test_upload_without_images_is_rejected() {
    let env = TestEnv::new();
    let base_url = env.spawn_server().await;
    let client = reqwest::Client::new();

    let form = Form::new().text("comment", "no files here");
    let (status, body) = upload(&client, &base_url, form).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("No files"));
}

#[tokio::test]
async fn test_upload_succeeds_while_queue_is_down() {
    let env = TestEnv::new();
    env.queue.set_available(false);
    let base_url = env.spawn_server().await;
    let client = reqwest::Client::new();

    let form = Form::new().part("images", image_part("a.png", noise_png(1)));
    let (status, body) = upload(&client, &base_url, form).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["uploaded"][0]["checkDeferred"], true);

    let health = client
        .get(format!("{base_url}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
    let health: Value = health.json().await.unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["checks"]["queue"]["status"], "error");
    assert_eq!(health["checks"]["database"]["status"], "ok");
}

#[tokio::test]
async fn test_list_paginates_in_upload_order() {
    let env = TestEnv::new();
    let base_url = env.spawn_server().await;
    let client = reqwest::Client::new();

    let form = Form::new()
        .part("images", image_part("0.png", noise_png(1)))
        .part("images", image_part("1.png", noise_png(2)))
        .part("images", image_part("2.png", noise_png(3)));
    upload(&client, &base_url, form).await;

    let page: Value = client
        .get(format!("{base_url}/api/v1/photos?page=2&limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(page["page"], 2);
    assert_eq!(page["limit"], 2);
    assert_eq!(page["totalPhotos"], 3);
    assert_eq!(page["totalPages"], 2);
    assert_eq!(page["data"].as_array().unwrap().len(), 1);
    assert_eq!(page["data"][0]["filename"], "2.png");
}

#[tokio::test]
async fn test_list_rejects_invalid_query() {
    let env = TestEnv::new();
    let base_url = env.spawn_server().await;
    let client = reqwest::Client::new();

    for query in [
        "limit=0",
        "limit=101",
        "page=0",
        "page=abc",
        "lat=95&lng=0&radius=1",
        "startDate=yesterday",
    ] {
        let response = client
            .get(format!("{base_url}/api/v1/photos?{query}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query: {query}");
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].is_string(), "query: {query}");
    }
}

#[tokio::test]
async fn test_get_and_delete_photo() {
    let env = TestEnv::new();
    let base_url = env.spawn_server().await;
    let client = reqwest::Client::new();

    let form = Form::new().part("images", image_part("a.png", noise_png(1)));
    let (_, body) = upload(&client, &base_url, form).await;
    let id = body["uploaded"][0]["id"].as_str().unwrap().to_string();
    let blob_id = body["uploaded"][0]["blobId"].as_str().unwrap().to_string();

    let photo: Value = client
        .get(format!("{base_url}/api/v1/photos/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(photo["id"], id.as_str());

    let deleted = client
        .delete(format!("{base_url}/api/v1/photos/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    assert!(!env.blobs.contains(&blob_id));

    for response in [
        client.get(format!("{base_url}/api/v1/photos/{id}")).send().await.unwrap(),
        client.delete(format!("{base_url}/api/v1/photos/{id}")).send().await.unwrap(),
    ] {
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_delete_keeps_record_when_blob_removal_fails() {
    let env = TestEnv::new();
    let base_url = env.spawn_server().await;
    let client = reqwest::Client::new();

    let form = Form::new().part("images", image_part("a.png", noise_png(1)));
    let (_, body) = upload(&client, &base_url, form).await;
    let id = body["uploaded"][0]["id"].as_str().unwrap().to_string();

    env.blobs.fail_deletes(true);
    let response = client
        .delete(format!("{base_url}/api/v1/photos/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(env.photos.all().len(), 1);
}

#[tokio::test]
async fn test_deleting_original_defers_recheck_of_its_duplicates() {
    let env = TestEnv::new();
    let base_url = env.spawn_server().await;
    let client = reqwest::Client::new();

    let form = Form::new()
        .part("images", image_part("a.png", noise_png(1)))
        .part("images", image_part("a-again.png", noise_png(1)));
    let (_, body) = upload(&client, &base_url, form).await;
    let original: uuid::Uuid = body["uploaded"][0]["id"].as_str().unwrap().parse().unwrap();
    let copy = body["uploaded"][1]["id"].as_str().unwrap().to_string();
    env.photos
        .update_duplicate_status(copy.parse().unwrap(), DuplicateStatus::DuplicateOf(original))
        .await
        .unwrap();

    let deleted = client
        .delete(format!("{base_url}/api/v1/photos/{original}"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let photo: Value = client
        .get(format!("{base_url}/api/v1/photos/{copy}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(photo["duplicateStatus"]["state"], "unknown");
    assert_eq!(photo["checkDeferred"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_renders() {
    let env = TestEnv::new();
    let base_url = env.spawn_server().await;

    let response = reqwest::get(format!("{base_url}/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
