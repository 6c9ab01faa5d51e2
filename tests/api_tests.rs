use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{NaiveDate, NaiveDateTime};
use dvbguide::{
    channels::{IpChannel, IpChannelList},
    create_app,
    epg::LoadEvent,
    manager::{DvbManager, ManagerConfig},
    metrics::MonitoringConfig,
    middleware::{FrontendType, SourceType},
    simulated::{Fixture, SimulatedMiddleware},
};
use serde_json::Value;
use tower::util::ServiceExt;

fn t(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 10, 18)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

fn fixture() -> Fixture {
    Fixture::at(t(12, 0))
        .frontend(0, &[FrontendType::Cab])
        .frontend(1, &[FrontendType::Ip])
        .service("DUMMY", SourceType::Undefined)
        .service("Das Erste", SourceType::Cab)
        .event("Tagesschau", t(20, 0), t(20, 15), 0x2)
        .event("Tatort", t(20, 15), t(21, 45), 0x1)
        .service("Eurosport", SourceType::Sat)
        .event("Snooker", t(14, 0), t(14, 50), 0x4)
}

fn setup() -> (Arc<SimulatedMiddleware>, Arc<DvbManager>, Router) {
    let sim = Arc::new(SimulatedMiddleware::new(fixture()));
    let ip = IpChannelList::new(vec![IpChannel {
        name: "Web TV".to_string(),
        url: "http://iptv.example/web.m3u8".to_string(),
    }]);
    let manager =
        Arc::new(DvbManager::initialize(sim.clone(), ip, &ManagerConfig::default()).unwrap());
    let app = create_app(manager.clone(), MonitoringConfig::default());
    (sim, manager, app)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn load_current(manager: &DvbManager, app: &Router) -> LoadEvent {
    let mut finished = manager.epg().subscribe_finished();
    let (status, body) = send(app, "POST", "/api/epg/load/current", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["started"], true);
    tokio::time::timeout(Duration::from_secs(5), finished.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_channels_api() {
    let (_sim, _manager, app) = setup();

    let (status, body) = send(&app, "GET", "/api/channels", None).await;
    assert_eq!(status, StatusCode::OK);

    let channels = body.as_array().unwrap();
    assert_eq!(channels.len(), 3);
    assert_eq!(channels[0]["name"], "Das Erste");
    assert_eq!(channels[0]["number"], 1);
    assert_eq!(channels[0]["kind"], "broadcast");
    assert_eq!(channels[2]["name"], "Web TV");
    assert_eq!(channels[2]["kind"], "ip");
}

#[tokio::test]
async fn test_resolve_channel_and_out_of_range() {
    let (_sim, _manager, app) = setup();

    let (status, body) = send(&app, "GET", "/api/channels/2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "ip");
    assert_eq!(body["physical_index"], 0);
    assert_eq!(body["url"], "http://iptv.example/web.m3u8");

    let (status, body) = send(&app, "GET", "/api/channels/3", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("out of range"));
}

#[tokio::test]
async fn test_tune_by_number_and_wrap() {
    let (sim, _manager, app) = setup();

    let (status, body) = send(&app, "POST", "/api/tune/0", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "tuned");
    assert_eq!(body["channel"]["name"], "Das Erste");
    assert!(sim.calls().contains(&"start_service(100,0,1)".to_string()));

    // Down from the first channel wraps to the IP channel at the end.
    let (_, body) = send(&app, "POST", "/api/tune/down", None).await;
    assert_eq!(body["channel"]["number"], 3);
    assert_eq!(sim.zapped_url(dvbguide::middleware::RouteId(110)).as_deref(), Some("http://iptv.example/web.m3u8"));

    let (_, body) = send(&app, "GET", "/api/tune", None).await;
    assert_eq!(body["current"], 2);
    assert_eq!(body["last_watched"], 2);

    let (status, _) = send(&app, "POST", "/api/stop", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_tune_without_route_reports_no_route() {
    let (sim, _manager, app) = setup();

    // Eurosport is a SAT service and there is no SAT frontend.
    let (status, body) = send(&app, "POST", "/api/tune/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "no_route");
    assert_eq!(body["source"], "sat");
    assert!(!sim.calls().iter().any(|c| c.starts_with("start_service")));
}

#[tokio::test]
async fn test_epg_load_and_grid() {
    let (_sim, manager, app) = setup();

    let (_, state) = send(&app, "GET", "/api/epg/state", None).await;
    assert_eq!(state["day_offset"], 0);
    assert_eq!(state["genre"], "all");
    assert_eq!(state["loading"], false);

    assert!(matches!(load_current(&manager, &app).await, LoadEvent::Finished(_)));

    let (status, grid) = send(&app, "GET", "/api/epg/grid", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(grid["date"], "2026-10-18");
    let slots = grid["slots"].as_array().unwrap();
    assert_eq!(slots.len(), 24);
    assert_eq!(slots[20]["channels"][0].as_array().unwrap().len(), 2);
    assert_eq!(slots[21]["channels"][0][0]["name"], "Tatort");
    assert_eq!(slots[14]["channels"][1][0]["genre"], "Sports");

    let (_, state) = send(&app, "GET", "/api/epg/state", None).await;
    assert_eq!(state["date"], "18/10/2026");
    assert_eq!(state["last_error"], Value::Null);
}

#[tokio::test]
async fn test_failed_background_load_is_reported() {
    let (sim, manager, app) = setup();
    // Physical service 1 is "Das Erste", the first broadcast channel.
    sim.fail_service(Some(1));

    let LoadEvent::Failed(failed) = load_current(&manager, &app).await else {
        panic!("load should have failed");
    };
    assert_eq!(failed.day_offset, 0);
    assert!(failed.error.contains("unreachable"));

    let (_, state) = send(&app, "GET", "/api/epg/state", None).await;
    assert_eq!(state["loading"], false);
    assert_eq!(state["last_error"], failed.error.as_str());
    assert_eq!(state["date"], Value::Null);

    sim.fail_service(None);
    assert!(matches!(load_current(&manager, &app).await, LoadEvent::Finished(_)));
    let (_, state) = send(&app, "GET", "/api/epg/state", None).await;
    assert_eq!(state["last_error"], Value::Null);
}

#[tokio::test]
async fn test_epg_load_rejects_unknown_day() {
    let (_sim, _manager, app) = setup();
    let (status, _) = send(&app, "POST", "/api/epg/load/sideways", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_genre_filter() {
    let (sim, manager, app) = setup();

    let (status, state) = send(
        &app,
        "PUT",
        "/api/epg/genre",
        Some(serde_json::json!({ "genre": "sports" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["genre"], "sports");
    assert!(sim.calls().iter().any(|c| c.ends_with(",Sports)")));

    load_current(&manager, &app).await;
    assert_eq!(manager.epg().grid().event_count(), 1);
}

#[tokio::test]
async fn test_record_and_remind_grid_entries() {
    let (sim, manager, app) = setup();
    load_current(&manager, &app).await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/epg/record",
        Some(serde_json::json!({ "hour": 20, "channel": 0, "entry": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let records = sim.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.name, "Tatort");

    let (status, _) = send(
        &app,
        "POST",
        "/api/epg/remind",
        Some(serde_json::json!({ "hour": 20, "channel": 0, "entry": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sim.reminders().len(), 1);

    let (status, _) = send(
        &app,
        "POST",
        "/api/epg/record",
        Some(serde_json::json!({ "hour": 3, "channel": 0, "entry": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // No SAT record route.
    let (status, _) = send(
        &app,
        "POST",
        "/api/epg/record",
        Some(serde_json::json!({ "hour": 14, "channel": 1, "entry": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        "POST",
        "/api/epg/remind/manual",
        Some(serde_json::json!({ "channel": 1, "start": "2026-10-18T22:00:00" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sim.reminders().len(), 2);
}

#[tokio::test]
async fn test_middleware_failure_maps_to_bad_gateway() {
    let (sim, _manager, app) = setup();
    sim.set_offline(true);

    let (status, body) = send(&app, "GET", "/api/channels", None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("middleware"));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (_sim, manager, app) = setup();
    load_current(&manager, &app).await;

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("dvbguide_epg_passes_total"));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (_sim, _manager, app) = setup();
    let (status, _) = send(&app, "GET", "/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
