use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use fleet_devkit::fixtures::HostBuilder;
use fleet_devkit::test_utils::TEST_API_KEY;
use fleet_devkit::FleetHarness;
use fleet_kernel::models::{HostStatus, DEFAULT_CONFIG_PATH};
use serde_json::{json, Value};
use tower::ServiceExt;

fn call(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-api-key", TEST_API_KEY);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_sweep_over_http_publishes_report() -> anyhow::Result<()> {
    let harness = FleetHarness::new();
    harness.add_host(HostBuilder::new("web").status(HostStatus::Active).build()).await?;
    harness.prober.down("web");

    let response = harness.router().oneshot(call("POST", "/sweep", None)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["logged"], 1);

    let published = harness.assert_published("fleet/sweep_completed@v1")?;
    assert_eq!(published["report"]["changed"], 1);
    // periodic and on-demand sweeps announce the transitions they committed
    let change = harness.assert_published("fleet/status_changed@v1")?;
    assert_eq!(change["host"], "web");
    assert_eq!(change["new_status"], "Down");

    let logs = json_body(harness.router().oneshot(call("GET", "/hosts/web/logs", None)).await?).await;
    assert_eq!(logs.as_array().map(Vec::len), Some(1));
    assert_eq!(logs[0]["event_type"], "Status Change");

    let daily = json_body(harness.router().oneshot(call("GET", "/reports/daily", None)).await?).await;
    assert_eq!(daily["total_changes"], 1);
    Ok(())
}

#[tokio::test]
async fn test_check_endpoint_publishes_status_change() -> anyhow::Result<()> {
    let harness = FleetHarness::new();
    harness.add_host(HostBuilder::new("db").status(HostStatus::Active).build()).await?;
    harness.prober.down("db");

    let check = json_body(harness.router().oneshot(call("POST", "/hosts/db/check", None)).await?).await;
    assert_eq!(check["status"], "Down");

    let change = harness.assert_published("fleet/status_changed@v1")?;
    assert_eq!(change["old_status"], "Active");
    assert_eq!(change["new_status"], "Down");
    harness.assert_published("fleet/check_requested@v1")?;

    harness.add_host(HostBuilder::new("off").status(HostStatus::Disabled).build()).await?;
    let disabled = harness.router().oneshot(call("POST", "/hosts/off/check", None)).await?;
    assert_eq!(disabled.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_config_edit_round_trip_over_http() -> anyhow::Result<()> {
    let harness = FleetHarness::new();
    harness.add_host(HostBuilder::new("web").build()).await?;
    harness.prober.up("web");
    harness.remote.put_file("web", DEFAULT_CONFIG_PATH, "[agent]\n");

    let current = json_body(harness.router().oneshot(call("GET", "/hosts/web/config", None)).await?).await;
    assert_eq!(current["config"], "[agent]\n");

    let body = json!({ "config": "[agent]\n  hostname = \"web\"\n" });
    let response = harness
        .router()
        .oneshot(call("PUT", "/hosts/web/config", Some(body)))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let update = json_body(response).await;
    assert!(update["backup_path"].as_str().is_some_and(|p| p.contains(".bak.")));

    harness.assert_published("fleet/config_updated@v1")?;
    // post-edit status check runs in the background
    let check = harness.wait_for_message("fleet/check_requested@v1", 2_000).await?;
    assert_eq!(check.map(|c| c["status"].clone()), Some(json!("Active")));
    assert_eq!(harness.status_of("web").await?, HostStatus::Active);

    let test = json_body(harness.router().oneshot(call("POST", "/hosts/web/config/test", None)).await?).await;
    assert_eq!(test["exit_code"], 0);
    assert!(test["output"].as_str().is_some_and(|o| o.contains("OUTPUT:")));
    harness.assert_sessions_closed()?;
    Ok(())
}

#[tokio::test]
async fn test_service_endpoint() -> anyhow::Result<()> {
    let harness = FleetHarness::new();
    harness.add_host(HostBuilder::new("web").build()).await?;

    let ok = harness
        .router()
        .oneshot(call("POST", "/hosts/web/service/reload", None))
        .await?;
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(harness.assert_published("fleet/service_action@v1")?["action"], "reload");

    let rejected = harness
        .router()
        .oneshot(call("POST", "/hosts/web/service/drop-table", None))
        .await?;
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(rejected).await["error"], "validation");
    assert_eq!(harness.remote.connect_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_statistics_and_cleanup() -> anyhow::Result<()> {
    let harness = FleetHarness::new();
    harness.add_host(HostBuilder::new("a").status(HostStatus::Active).build()).await?;
    harness.prober.down("a");
    harness.sweeper.sweep().await;

    let stats = json_body(harness.router().oneshot(call("GET", "/logs/stats", None)).await?).await;
    assert_eq!(stats["total_logs"], 1);
    assert_eq!(stats["top_hosts"][0]["key"], "a");

    // 40 days later the event is past a 30 day cleanup
    harness.clock.advance(time::Duration::days(40));
    let recent = json_body(harness.router().oneshot(call("GET", "/logs/recent", None)).await?).await;
    assert_eq!(recent.as_array().map(Vec::len), Some(0));

    let cleanup = json_body(harness.router().oneshot(call("POST", "/logs/cleanup", None)).await?).await;
    assert_eq!(cleanup["removed"], 1);
    assert!(harness.events().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unresolvable_secret_is_a_bad_request() -> anyhow::Result<()> {
    let harness = FleetHarness::new();
    harness
        .add_host(HostBuilder::new("vault").password("env:FLEET_DEVKIT_UNSET_SECRET").build())
        .await?;

    let response = harness.router().oneshot(call("GET", "/hosts/vault/config", None)).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "validation");
    Ok(())
}
