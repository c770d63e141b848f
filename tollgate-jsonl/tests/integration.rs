use std::time::Duration;
use tollgate::telemetry::{emit_best_effort, RateLimitEvent};
use tollgate_jsonl::JsonlSink;
use tower_service::Service;

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let mut sink = JsonlSink::new(&path);

    sink.call(RateLimitEvent::Allowed { key: "ip:192.0.2.1".into(), remaining: 4, limit: 5 })
        .await
        .unwrap();
    sink.call(RateLimitEvent::Denied {
        key: "ip:192.0.2.1".into(),
        retry_after: Duration::from_millis(200),
    })
    .await
    .unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> =
        contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["kind"], "allowed");
    assert_eq!(lines[0]["remaining"], 4);
    assert_eq!(lines[1]["kind"], "denied");
    assert_eq!(lines[1]["retry_after_ms"], 200);
}

#[tokio::test]
async fn unwritable_path_is_an_error_but_best_effort_swallows_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing-dir").join("events.jsonl");
    let mut sink = JsonlSink::new(&path);

    let event = RateLimitEvent::Failed { reason: "backend down".into() };
    assert!(sink.call(event.clone()).await.is_err());
    emit_best_effort(sink, event).await;
    assert!(!path.exists());
}
