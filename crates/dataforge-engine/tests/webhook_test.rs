//! Webhook delivery durability: persisted-before-send rows, HMAC
//! signatures, retry with backoff and permanent failure.

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dataforge_core::models::{DeliveryStatus, EventType, ProviderType, WebhookType};
use dataforge_core::record::records_from_value;
use dataforge_engine::app::CreateDataSource;
use dataforge_engine::webhook::{sign, WebhookDispatcherConfig};
use dataforge_engine::{AppSettings, DataForge};

fn fast_retries() -> WebhookDispatcherConfig {
    WebhookDispatcherConfig {
        max_attempts: 3,
        backoff: vec![Duration::from_millis(30), Duration::from_millis(60)],
        request_timeout: Duration::from_secs(2),
    }
}

async fn wait_for_status(
    forge: &DataForge,
    config_id: &str,
    status: DeliveryStatus,
) -> dataforge_core::models::WebhookDelivery {
    for _ in 0..200 {
        let deliveries = forge.webhook_deliveries(config_id).unwrap();
        if let Some(delivery) = deliveries.iter().find(|d| d.status == status) {
            return delivery.clone();
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no delivery reached {:?}", status);
}

struct Fixture {
    forge: DataForge,
    project_id: String,
    d1: String,
}

async fn started_fixture(dir: &TempDir) -> Fixture {
    let mut settings = AppSettings::new(dir.path());
    settings.webhooks = fast_retries();
    let forge = DataForge::open(settings).unwrap();
    forge.start().await.unwrap();
    let project = forge.create_project("p", None).unwrap();
    let d1 = forge
        .create_data_source(
            &project.id,
            CreateDataSource::new("d1", ProviderType::Mock, json!({})),
        )
        .unwrap();
    Fixture {
        project_id: project.id,
        d1: d1.id,
        forge,
    }
}

fn import_once(fx: &Fixture) {
    fx.forge
        .import(
            &fx.project_id,
            &fx.d1,
            records_from_value(json!([{"id": 1}])).unwrap(),
            None,
            None,
        )
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn matching_event_is_delivered_and_signed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fx = started_fixture(&dir).await;
    let config = fx
        .forge
        .create_webhook_config(
            "ops",
            WebhookType::Generic,
            &format!("{}/hook", server.uri()),
            vec![EventType::IngestSuccess],
            None,
            None,
            Some("sekrit".to_string()),
        )
        .unwrap();

    import_once(&fx);

    let delivery = wait_for_status(&fx.forge, &config.id, DeliveryStatus::Success).await;
    assert_eq!(delivery.http_status, Some(200));
    assert_eq!(delivery.attempts, 1);
    assert!(delivery.delivered_at.is_some());

    // The endpoint saw a correctly signed body.
    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let body = String::from_utf8(request.body.clone()).unwrap();
    let signature = request
        .headers
        .get("X-Signature")
        .expect("signature header")
        .to_str()
        .unwrap();
    assert_eq!(signature, sign("sekrit", &body));
    let payload: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(payload["event_type"], json!("ingest.success"));
    assert_eq!(payload["data_source_id"], json!(fx.d1));

    fx.forge.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_retry_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fx = started_fixture(&dir).await;
    let config = fx
        .forge
        .create_webhook_config(
            "flaky",
            WebhookType::Generic,
            &format!("{}/flaky", server.uri()),
            vec![EventType::IngestSuccess],
            None,
            None,
            None,
        )
        .unwrap();

    import_once(&fx);

    let delivery = wait_for_status(&fx.forge, &config.id, DeliveryStatus::Success).await;
    assert_eq!(delivery.attempts, 3);
    fx.forge.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_attempts_mark_failed_but_never_block_ingest() {
    let dir = TempDir::new().unwrap();
    let fx = started_fixture(&dir).await;
    // Dead endpoint: nothing listens here.
    let config = fx
        .forge
        .create_webhook_config(
            "dead",
            WebhookType::Generic,
            "http://127.0.0.1:1/hook",
            vec![EventType::IngestSuccess],
            None,
            None,
            None,
        )
        .unwrap();

    import_once(&fx);
    // The import already succeeded; the delivery chain fails on its own.
    assert_eq!(
        fx.forge
            .list_versions(&fx.project_id, &fx.d1, None)
            .unwrap()
            .len(),
        1
    );

    let delivery = wait_for_status(&fx.forge, &config.id, DeliveryStatus::Failed).await;
    assert_eq!(delivery.attempts, 3);
    assert!(delivery.last_error.is_some());
    fx.forge.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_whitelist_filters_deliveries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fx = started_fixture(&dir).await;
    let config = fx
        .forge
        .create_webhook_config(
            "failures-only",
            WebhookType::Generic,
            &format!("{}/hook", server.uri()),
            vec![EventType::IngestFailure],
            None,
            None,
            None,
        )
        .unwrap();

    import_once(&fx);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fx.forge.webhook_deliveries(&config.id).unwrap().is_empty());
    fx.forge.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slack_payload_renders_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slack"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fx = started_fixture(&dir).await;
    let config = fx
        .forge
        .create_webhook_config(
            "slack",
            WebhookType::Slack,
            &format!("{}/slack", server.uri()),
            vec![EventType::IngestSuccess],
            None,
            None,
            None,
        )
        .unwrap();

    import_once(&fx);
    wait_for_status(&fx.forge, &config.id, DeliveryStatus::Success).await;

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let text = body["text"].as_str().unwrap();
    assert!(text.contains("ingest.success"));
    fx.forge.shutdown().unwrap();
}
