//! Tests for artifact references, size accounting and the local store.

use anchorflow::artifacts::{
    ArtifactRef, ArtifactStore, CALLBACK_RESULT_THRESHOLD, TASK_PAYLOAD_THRESHOLD, is_reference,
    serialized_size,
};
use anchorflow::artifacts::local_store::LocalArtifactStore;

// ===== References =====

#[test]
fn reference_roundtrips_through_json() {
    let reference = ArtifactRef {
        uri: "s3://bucket/reports/wf-1/final_report.json".to_string(),
        size_bytes: 123_456,
    };

    let value = reference.to_value();
    assert_eq!(value.get("artifact_type").unwrap(), "reference");

    let parsed = ArtifactRef::from_value(&value).unwrap();
    assert_eq!(parsed, reference);
}

#[test]
fn plain_objects_are_not_references() {
    assert!(!is_reference(&serde_json::json!({"uri": "s3://x/y"})));
    assert!(!is_reference(&serde_json::json!({"artifact_type": "inline"})));
    assert!(!is_reference(&serde_json::json!("s3://x/y")));
    assert!(is_reference(&serde_json::json!({
        "artifact_type": "reference",
        "uri": "s3://x/y",
        "size_bytes": 10,
    })));
}

#[test]
fn size_counts_raw_bytes_for_strings() {
    let s = serde_json::json!("abcd");
    // Raw length, not the quoted JSON length.
    assert_eq!(serialized_size(&s), 4);

    let obj = serde_json::json!({"a": 1});
    assert_eq!(serialized_size(&obj), r#"{"a":1}"#.len());
}

#[test]
fn thresholds_are_ordered() {
    // Callback results get more headroom than task payloads.
    assert!(CALLBACK_RESULT_THRESHOLD > TASK_PAYLOAD_THRESHOLD);
}

// ===== Local store =====

#[tokio::test]
async fn local_store_structured_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalArtifactStore::new(dir.path());

    let content = serde_json::json!({"summary": "findings", "items": [1, 2, 3]});
    let reference = store
        .store("steps/wf-1/analysis.json", &content, "application/json")
        .await
        .unwrap();

    assert!(reference.uri.starts_with("file://"));
    assert!(reference.size_bytes > 0);

    let fetched = store.fetch(&reference.uri).await.unwrap();
    assert_eq!(fetched, content);
}

#[tokio::test]
async fn local_store_text_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalArtifactStore::new(dir.path());

    let content = serde_json::json!("# Final Report\n\nBody text.");
    let reference = store
        .store("reports/wf-1/final_report.md", &content, "text/markdown")
        .await
        .unwrap();

    // Text artifacts are stored raw, so the size is the raw byte count.
    assert_eq!(reference.size_bytes as usize, content.as_str().unwrap().len());

    let fetched = store.fetch(&reference.uri).await.unwrap();
    assert_eq!(fetched, content);
}

#[tokio::test]
async fn local_store_presigned_url_carries_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalArtifactStore::new(dir.path());

    let reference = store
        .store("approvals/wf-1/analysis_results.json", &serde_json::json!({}), "application/json")
        .await
        .unwrap();

    let url = store.presigned_read_url(&reference.uri, 86_400).await.unwrap();
    assert!(url.contains("expires_in=86400"));
}

#[tokio::test]
async fn local_store_fetch_missing_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalArtifactStore::new(dir.path());

    let err = store
        .fetch(&format!("file://{}/missing.json", dir.path().display()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "StorageFault");
}
