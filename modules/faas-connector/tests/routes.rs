use axum::body::Body;
use axum::http::{Request, StatusCode};
use faas_connector::routes::router;
use faas_connector::Metrics;
use tower::ServiceExt;

async fn get(metrics: Metrics, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router(metrics)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_health() {
    let (status, body) = get(Metrics::new().unwrap(), "/api/health").await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["module"], "faas-connector");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_metrics_exposition() {
    let metrics = Metrics::new().unwrap();
    metrics.record_outcome("poison");
    metrics.record_send("invalid");

    let (status, body) = get(metrics, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("connector_records_total{outcome=\"poison\"} 1"));
    assert!(text.contains("connector_sends_total{kind=\"invalid\"} 1"));
}
