//! The lifecycle coordinator driving the real telemetry receiver.

use opentelemetry_lambda_collector::{
    BuildInfo, Collector, CollectorError, CollectorSettings, Conf, LifecycleState,
    ReceiverFactory,
};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

fn settings(yaml: &str) -> CollectorSettings {
    CollectorSettings {
        build_info: BuildInfo::new("0.0.0-test"),
        config: Conf::from_yaml("yaml:test", yaml).unwrap(),
    }
}

#[tokio::test]
async fn test_receiver_forwards_batches_while_running() {
    let (batch_tx, mut batch_rx) = mpsc::channel(4);
    let mut collector = Collector::new(
        ReceiverFactory::new(batch_tx),
        settings("receivers::telemetryapi::port: 0"),
    );

    collector.start().await.unwrap();
    assert_eq!(collector.state(), LifecycleState::Running);

    let addr = collector
        .service()
        .and_then(|service| service.local_addr())
        .expect("receiver bound");

    let response = reqwest::Client::new()
        .post(format!("http://{}/", addr))
        .json(&json!([
            {
                "time": "2024-01-01T00:00:00.000Z",
                "type": "platform.start",
                "record": {"requestId": "req-1", "version": "$LATEST"}
            }
        ]))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let batch = tokio::time::timeout(Duration::from_secs(1), batch_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].event_type, "platform.start");
    assert_eq!(batch[0].record["requestId"], "req-1");

    collector.stop().await.unwrap();
    assert_eq!(collector.state(), LifecycleState::Stopped);

    let refused = reqwest::Client::new()
        .get(format!("http://{}/health", addr))
        .timeout(Duration::from_millis(500))
        .send()
        .await;
    assert!(refused.is_err(), "receiver still serving after stop");
}

#[tokio::test]
async fn test_receiver_with_bad_config_fails_to_build() {
    let (batch_tx, _batch_rx) = mpsc::channel(4);
    let mut collector = Collector::new(
        ReceiverFactory::new(batch_tx),
        settings("receivers::telemetryapi::port: not-a-port"),
    );

    let err = collector.start().await.unwrap_err();

    assert!(matches!(err, CollectorError::Build(_)));
    assert_eq!(collector.state(), LifecycleState::Failed);
}

#[tokio::test]
async fn test_receiver_port_in_use_reported_at_start() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let (batch_tx, _batch_rx) = mpsc::channel(4);
    let mut collector = Collector::new(
        ReceiverFactory::new(batch_tx),
        settings(&format!("receivers::telemetryapi::port: {port}")),
    )
    .with_startup_timeout(Duration::from_secs(2));

    let err = collector.start().await.unwrap_err();

    assert!(
        matches!(err, CollectorError::Run(_) | CollectorError::UnexpectedState(_)),
        "unexpected error: {err:?}"
    );
    assert_eq!(collector.state(), LifecycleState::Failed);
}
