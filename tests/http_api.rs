use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header;
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;
use ulid::Ulid;

use corral::http::{self, AppState};
use corral::sync::{HttpFetcher, Synchronizer};
use corral::tenant::TenantManager;

const API_KEY: &str = "test-key";

// ── Test infrastructure ──────────────────────────────────────

async fn start_server() -> SocketAddr {
    let dir = std::env::temp_dir().join(format!("corral_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    start_server_in(dir).await
}

async fn start_server_in(dir: PathBuf) -> SocketAddr {
    let tenants = Arc::new(TenantManager::new(dir, 1000));
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(2)).unwrap());
    let sync = Arc::new(Synchronizer::new(fetcher, 4));

    let app = http::router(AppState {
        tenants,
        sync,
        api_key: Some(API_KEY.to_string()),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Serves a fixed iCalendar payload, standing in for a partner platform.
async fn start_feed_server(body: &'static str) -> String {
    let app = Router::new().route(
        "/cal.ics",
        get(move || async move {
            ([(header::CONTENT_TYPE, "text/calendar")], body)
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/cal.ics")
}

struct ApiClient {
    base: String,
    tenant: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(addr: SocketAddr, tenant: &str) -> Self {
        Self {
            base: format!("http://{addr}"),
            tenant: tenant.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.http
            .post(format!("{}{}", self.base, path))
            .bearer_auth(API_KEY)
            .header("x-corral-tenant", &self.tenant)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.http
            .get(format!("{}{}", self.base, path))
            .bearer_auth(API_KEY)
            .header("x-corral-tenant", &self.tenant)
            .send()
            .await
            .unwrap()
    }

    async fn register_vehicle(&self) -> String {
        let res = self
            .post("/vehicles", serde_json::json!({ "label": "camper-01" }))
            .await;
        assert_eq!(res.status(), 201);
        res.json::<Value>().await.unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn is_available(&self, vehicle: &str, start: &str, end: &str) -> bool {
        let res = self
            .get(&format!(
                "/vehicles/{vehicle}/availability?start={start}&end={end}"
            ))
            .await;
        assert_eq!(res.status(), 200);
        res.json::<Value>().await.unwrap()["available"]
            .as_bool()
            .unwrap()
    }
}

const PARTNER_FEED: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//partner//EN\r\nBEGIN:VEVENT\r\nUID:ext-1@partner\r\nDTSTART;VALUE=DATE:20260320\r\nDTEND;VALUE=DATE:20260323\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn rejects_requests_without_api_key() {
    let addr = start_server().await;
    let res = reqwest::Client::new()
        .get(format!("http://{addr}/vehicles"))
        .header("x-corral-tenant", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
}

#[tokio::test]
async fn rejects_requests_without_tenant_header() {
    let addr = start_server().await;
    let res = reqwest::Client::new()
        .get(format!("http://{addr}/vehicles"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
}

#[tokio::test]
async fn reservation_lifecycle_over_http() {
    let addr = start_server().await;
    let api = ApiClient::new(addr, "acme");
    let vehicle = api.register_vehicle().await;

    assert!(api.is_available(&vehicle, "2026-03-10", "2026-03-14").await);

    let res = api
        .post(
            &format!("/vehicles/{vehicle}/reservations"),
            serde_json::json!({ "start": "2026-03-10", "end": "2026-03-14" }),
        )
        .await;
    assert_eq!(res.status(), 201);
    let reservation = res.json::<Value>().await.unwrap();
    let reservation_id = reservation["id"].as_str().unwrap().to_string();
    assert_eq!(reservation["status"], "pending");

    // Overlap is a 409 with a structured conflict body.
    let res = api
        .post(
            &format!("/vehicles/{vehicle}/reservations"),
            serde_json::json!({ "start": "2026-03-13", "end": "2026-03-16" }),
        )
        .await;
    assert_eq!(res.status(), 409);
    let body = res.json::<Value>().await.unwrap();
    assert_eq!(body["conflict"]["source"]["kind"], "reservation");

    assert!(!api.is_available(&vehicle, "2026-03-12", "2026-03-12").await);

    // Confirm, then cancel; the range frees up.
    let res = api
        .post(
            &format!("/reservations/{reservation_id}/status"),
            serde_json::json!({ "status": "confirmed" }),
        )
        .await;
    assert_eq!(res.status(), 204);

    let res = api
        .post(
            &format!("/reservations/{reservation_id}/cancel"),
            serde_json::json!({}),
        )
        .await;
    assert_eq!(res.status(), 204);
    assert!(api.is_available(&vehicle, "2026-03-10", "2026-03-14").await);
}

#[tokio::test]
async fn invalid_range_is_rejected() {
    let addr = start_server().await;
    let api = ApiClient::new(addr, "acme");
    let vehicle = api.register_vehicle().await;

    let res = api
        .post(
            &format!("/vehicles/{vehicle}/reservations"),
            serde_json::json!({ "start": "2026-03-14", "end": "2026-03-10" }),
        )
        .await;
    assert_eq!(res.status(), 400);
}

#[tokio::test]
async fn link_sync_blocks_and_revoke_frees() {
    let addr = start_server().await;
    let feed_url = start_feed_server(PARTNER_FEED).await;
    let api = ApiClient::new(addr, "acme");
    let vehicle = api.register_vehicle().await;

    let res = api
        .post(
            &format!("/vehicles/{vehicle}/links"),
            serde_json::json!({ "feed_url": feed_url, "source_label": "partner" }),
        )
        .await;
    assert_eq!(res.status(), 201);
    let link_id = res.json::<Value>().await.unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    let res = api
        .post(&format!("/links/{link_id}/sync"), serde_json::json!({}))
        .await;
    assert_eq!(res.status(), 200);
    let result = res.json::<Value>().await.unwrap();
    assert!(result["error"].is_null());
    assert_eq!(result["event_count"], 1);

    // Exclusive DTEND 2026-03-23 blocks through the 22nd only.
    assert!(!api.is_available(&vehicle, "2026-03-20", "2026-03-20").await);
    assert!(!api.is_available(&vehicle, "2026-03-22", "2026-03-22").await);
    assert!(api.is_available(&vehicle, "2026-03-23", "2026-03-23").await);

    let res = api
        .post(&format!("/links/{link_id}/revoke"), serde_json::json!({}))
        .await;
    assert_eq!(res.status(), 204);
    assert!(api.is_available(&vehicle, "2026-03-20", "2026-03-22").await);
}

#[tokio::test]
async fn sync_all_reports_per_link_outcomes() {
    let addr = start_server().await;
    let feed_url = start_feed_server(PARTNER_FEED).await;
    let api = ApiClient::new(addr, "acme");

    let vehicle_ok = api.register_vehicle().await;
    let vehicle_bad = api.register_vehicle().await;
    api.post(
        &format!("/vehicles/{vehicle_ok}/links"),
        serde_json::json!({ "feed_url": feed_url, "source_label": "partner" }),
    )
    .await;
    // Nothing listens on this port.
    api.post(
        &format!("/vehicles/{vehicle_bad}/links"),
        serde_json::json!({ "feed_url": "http://127.0.0.1:9/cal.ics", "source_label": "partner" }),
    )
    .await;

    let res = api.post("/sync", serde_json::json!({})).await;
    assert_eq!(res.status(), 200);
    let report = res.json::<Value>().await.unwrap();
    assert_eq!(report["synced"], 1);
    assert_eq!(report["failed"], 1);
    assert_eq!(report["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn export_feed_is_token_gated() {
    let addr = start_server().await;
    let api = ApiClient::new(addr, "acme");
    let vehicle = api.register_vehicle().await;
    api.post(
        &format!("/vehicles/{vehicle}/reservations"),
        serde_json::json!({ "start": "2026-03-10", "end": "2026-03-14" }),
    )
    .await;

    // Until the operator issues a token, no token value can match.
    let plain = reqwest::Client::new();
    let res = plain
        .get(format!("http://{addr}/feeds/acme/{vehicle}.ics?token=anything"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = api.get("/export-token").await;
    assert_eq!(res.status(), 200);
    let token = res.json::<Value>().await.unwrap()["token"]
        .as_str()
        .unwrap()
        .to_string();

    // No bearer key needed on the feed route, just the token.
    let res = plain
        .get(format!("http://{addr}/feeds/acme/{vehicle}.ics?token={token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert!(res
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/calendar"));
    let ics = res.text().await.unwrap();
    assert!(ics.contains("BEGIN:VCALENDAR"));
    assert!(ics.contains("DTSTART;VALUE=DATE:20260310"));
    // Exclusive outbound end: last blocked day 14th → DTEND 15th.
    assert!(ics.contains("DTEND;VALUE=DATE:20260315"));

    let res = plain
        .get(format!(
            "http://{addr}/feeds/acme/{vehicle}.ics?token=wrong-token"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
}

#[tokio::test]
async fn rejected_exports_leave_no_tenant_state() {
    let dir = std::env::temp_dir().join(format!("corral_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let addr = start_server_in(dir.clone()).await;

    // Unauthenticated hits on never-seen tenant names must not create
    // anything durable: no WAL files, no engines.
    let plain = reqwest::Client::new();
    for i in 0..5 {
        let res = plain
            .get(format!(
                "http://{addr}/feeds/ghost-{i}/{}.ics?token=bogus",
                Ulid::new()
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 401);
    }

    let leftovers: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(
        leftovers.is_empty(),
        "rejected requests created tenant state: {leftovers:?}"
    );
}

#[tokio::test]
async fn tenants_are_isolated_over_http() {
    let addr = start_server().await;
    let acme = ApiClient::new(addr, "acme");
    let rival = ApiClient::new(addr, "rival");

    let vehicle = acme.register_vehicle().await;
    let res = rival
        .get(&format!(
            "/vehicles/{vehicle}/availability?start=2026-03-10&end=2026-03-14"
        ))
        .await;
    assert_eq!(res.status(), 404);
}
