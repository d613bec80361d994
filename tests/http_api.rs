//! End-to-end tests over the REST surface: real routes, real engine,
//! temp-dir WALs, JSON in and out.

use std::sync::Arc;

use actix_web::{App, test, web};
use serde_json::{Value, json};
use ulid::Ulid;

use parkd::config::Config;
use parkd::http::{self, AppState};
use parkd::tenant::TenantManager;

fn fresh_state(token: Option<&str>) -> web::Data<AppState> {
    let dir = std::env::temp_dir()
        .join("parkd_test_http")
        .join(Ulid::new().to_string());
    std::fs::create_dir_all(&dir).unwrap();
    let config = Config::from_lookup(|_| None);
    web::Data::new(AppState {
        tenants: Arc::new(TenantManager::new(dir, config.clone())),
        token: token.map(str::to_string),
        release: config.release,
        expand: config.expand,
    })
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new().app_data($state.clone()).configure(http::routes),
        )
        .await
    };
}

fn admin() -> (&'static str, &'static str) {
    ("x-role", "admin")
}

macro_rules! create_lot {
    ($app:expr) => {{
        let req = test::TestRequest::post()
            .uri("/v1/lots")
            .insert_header(admin())
            .set_json(json!({"name": "North Garage", "address": "1 Main St"}))
            .to_request();
        let lot: Value = test::call_and_read_body_json(&$app, req).await;
        lot["id"].as_str().unwrap().to_string()
    }};
}

macro_rules! create_slot {
    ($app:expr, $lot:expr, $number:expr) => {{
        let req = test::TestRequest::post()
            .uri(&format!("/v1/lots/{}/slots", $lot))
            .insert_header(admin())
            .set_json(json!({"number": $number}))
            .to_request();
        let slot: Value = test::call_and_read_body_json(&$app, req).await;
        slot["id"].as_str().unwrap().to_string()
    }};
}

fn booking_body(lot: &str, slot: Option<&str>, start: &str, end: &str) -> Value {
    let mut body = json!({"lot_id": lot, "start": start, "end": end});
    if let Some(s) = slot {
        body["slot_id"] = json!(s);
    }
    body
}

#[actix_web::test]
async fn lot_slot_booking_flow() {
    let state = fresh_state(None);
    let app = app!(state);
    let lot = create_lot!(app);
    let slot = create_slot!(app, lot, "A1");

    let req = test::TestRequest::post()
        .uri("/v1/bookings")
        .insert_header(("x-user", "u1"))
        .set_json(booking_body(&lot, Some(&slot), "2024-01-01T09:00:00Z", "2024-01-01T17:00:00Z"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let booking: Value = test::read_body_json(resp).await;
    assert_eq!(booking["status"], "confirmed");
    assert_eq!(booking["slot_id"], slot.as_str());
    assert_eq!(booking["user"], "u1");

    let id = booking["id"].as_str().unwrap();
    let req = test::TestRequest::get()
        .uri(&format!("/v1/bookings/{id}"))
        .to_request();
    let fetched: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(fetched["id"], booking["id"]);

    let req = test::TestRequest::get()
        .uri(&format!("/v1/lots/{lot}/bookings"))
        .to_request();
    let listing: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(listing.as_array().unwrap().len(), 1);
}

#[actix_web::test]
async fn overlap_conflicts_touching_does_not() {
    let state = fresh_state(None);
    let app = app!(state);
    let lot = create_lot!(app);
    let slot = create_slot!(app, lot, "A1");

    let req = test::TestRequest::post()
        .uri("/v1/bookings")
        .insert_header(("x-user", "u1"))
        .set_json(booking_body(&lot, Some(&slot), "2024-01-01T09:00:00Z", "2024-01-01T17:00:00Z"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    // Overlapping window on the same slot.
    let req = test::TestRequest::post()
        .uri("/v1/bookings")
        .insert_header(("x-user", "u2"))
        .set_json(booking_body(&lot, Some(&slot), "2024-01-01T12:00:00Z", "2024-01-01T13:00:00Z"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let err: Value = test::read_body_json(resp).await;
    assert_eq!(err["code"], "SLOT_UNAVAILABLE");

    // Touching endpoint is free.
    let req = test::TestRequest::post()
        .uri("/v1/bookings")
        .insert_header(("x-user", "u2"))
        .set_json(booking_body(&lot, Some(&slot), "2024-01-01T17:00:00Z", "2024-01-01T18:00:00Z"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);
}

#[actix_web::test]
async fn auto_assignment_until_exhausted() {
    let state = fresh_state(None);
    let app = app!(state);
    let lot = create_lot!(app);
    let a1 = create_slot!(app, lot, "A1");
    let a2 = create_slot!(app, lot, "A2");

    let body = booking_body(&lot, None, "2024-01-01T09:00:00Z", "2024-01-01T17:00:00Z");
    let mut assigned = Vec::new();
    for user in ["u1", "u2"] {
        let req = test::TestRequest::post()
            .uri("/v1/bookings")
            .insert_header(("x-user", user))
            .set_json(body.clone())
            .to_request();
        let booking: Value = test::call_and_read_body_json(&app, req).await;
        assigned.push(booking["slot_id"].as_str().unwrap().to_string());
    }
    assert_eq!(assigned, vec![a1, a2]);

    let req = test::TestRequest::post()
        .uri("/v1/bookings")
        .insert_header(("x-user", "u3"))
        .set_json(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
    let err: Value = test::read_body_json(resp).await;
    assert_eq!(err["code"], "NO_SLOTS_AVAILABLE");
}

#[actix_web::test]
async fn availability_is_derived_live() {
    let state = fresh_state(None);
    let app = app!(state);
    let lot = create_lot!(app);
    create_slot!(app, lot, "A1");
    let a2 = create_slot!(app, lot, "A2");

    let req = test::TestRequest::post()
        .uri("/v1/bookings")
        .insert_header(("x-user", "u1"))
        .set_json(booking_body(&lot, None, "2024-01-01T09:00:00Z", "2024-01-01T17:00:00Z"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let req = test::TestRequest::get()
        .uri(&format!(
            "/v1/lots/{lot}/availability?start=2024-01-01T10:00:00Z&end=2024-01-01T11:00:00Z"
        ))
        .to_request();
    let free: Value = test::call_and_read_body_json(&app, req).await;
    let free = free.as_array().unwrap();
    assert_eq!(free.len(), 1);
    assert_eq!(free[0]["id"], a2.as_str());
}

#[actix_web::test]
async fn cancel_is_owner_or_admin() {
    let state = fresh_state(None);
    let app = app!(state);
    let lot = create_lot!(app);
    let slot = create_slot!(app, lot, "A1");

    let req = test::TestRequest::post()
        .uri("/v1/bookings")
        .insert_header(("x-user", "u1"))
        .set_json(booking_body(&lot, Some(&slot), "2024-01-01T09:00:00Z", "2024-01-01T17:00:00Z"))
        .to_request();
    let booking: Value = test::call_and_read_body_json(&app, req).await;
    let id = booking["id"].as_str().unwrap().to_string();

    // A stranger may not cancel.
    let req = test::TestRequest::post()
        .uri(&format!("/v1/bookings/{id}/cancel"))
        .insert_header(("x-user", "u2"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    // The owner may.
    let req = test::TestRequest::post()
        .uri(&format!("/v1/bookings/{id}/cancel"))
        .insert_header(("x-user", "u1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let cancelled: Value = test::read_body_json(resp).await;
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["cancelled"], "user");
}

#[actix_web::test]
async fn checkin_marks_booking_active() {
    let state = fresh_state(None);
    let app = app!(state);
    let lot = create_lot!(app);
    let slot = create_slot!(app, lot, "A1");

    // Quick-book runs from now, so check-in is immediately legal.
    let req = test::TestRequest::post()
        .uri("/v1/bookings/quick")
        .insert_header(("x-user", "u1"))
        .set_json(json!({"lot_id": lot}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let booking: Value = test::read_body_json(resp).await;
    assert_eq!(booking["slot_id"], slot.as_str());
    let id = booking["id"].as_str().unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/v1/bookings/{id}/checkin"))
        .insert_header(("x-user", "u1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let checked: Value = test::read_body_json(resp).await;
    assert_eq!(checked["status"], "active");
    assert!(checked["checked_in_at"].is_string());
}

#[actix_web::test]
async fn admin_endpoints_reject_plain_users() {
    let state = fresh_state(None);
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/lots")
        .insert_header(("x-user", "u1"))
        .set_json(json!({"name": "Garage"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    let req = test::TestRequest::post()
        .uri("/v1/jobs/sweep")
        .insert_header(("x-user", "u1"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);
}

#[actix_web::test]
async fn bearer_token_gates_everything() {
    let state = fresh_state(Some("s3cret"));
    let app = app!(state);

    let req = test::TestRequest::get().uri("/v1/lots").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    let err: Value = test::read_body_json(resp).await;
    assert_eq!(err["code"], "UNAUTHORIZED");

    let req = test::TestRequest::get()
        .uri("/v1/lots")
        .insert_header(("authorization", "Bearer s3cret"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
}

#[actix_web::test]
async fn tenants_do_not_see_each_other() {
    let state = fresh_state(None);
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/lots")
        .insert_header(admin())
        .insert_header(("x-parkd-org", "acme"))
        .set_json(json!({"name": "Acme Garage"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let req = test::TestRequest::get()
        .uri("/v1/lots")
        .insert_header(("x-parkd-org", "globex"))
        .to_request();
    let lots: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(lots.as_array().unwrap().len(), 0);
}

#[actix_web::test]
async fn waitlist_join_and_list() {
    let state = fresh_state(None);
    let app = app!(state);
    let lot = create_lot!(app);

    for user in ["w1", "w2"] {
        let req = test::TestRequest::post()
            .uri(&format!("/v1/lots/{lot}/waitlist"))
            .insert_header(("x-user", user))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
    }

    let req = test::TestRequest::get()
        .uri(&format!("/v1/lots/{lot}/waitlist"))
        .to_request();
    let entries: Value = test::call_and_read_body_json(&app, req).await;
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["user"], "w1");
    assert!(entries[0]["notified_at"].is_null());
}

#[actix_web::test]
async fn recurrence_create_and_expand_job() {
    let state = fresh_state(None);
    let app = app!(state);
    let lot = create_lot!(app);
    let slot = create_slot!(app, lot, "A1");

    let req = test::TestRequest::post()
        .uri("/v1/recurrences")
        .insert_header(("x-user", "u1"))
        .set_json(json!({
            "lot_id": lot,
            "slot_id": slot,
            "weekdays": [0, 1, 2, 3, 4, 5, 6],
            "start_date": "2024-01-01",
            "start_time": "09:00:00",
            "end_time": "17:00:00",
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let rule: Value = test::read_body_json(resp).await;
    assert_eq!(rule["active"], true);
    assert_eq!(rule["start_time"], "09:00");

    // Default horizon is 7 days; every weekday matches, so the run-once
    // job materializes 8 bookings (today through day 7).
    let req = test::TestRequest::post()
        .uri("/v1/jobs/expand")
        .insert_header(admin())
        .to_request();
    let result: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(result["count"], 8);

    // Second run: nothing new.
    let req = test::TestRequest::post()
        .uri("/v1/jobs/expand")
        .insert_header(admin())
        .to_request();
    let result: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(result["count"], 0);
}

#[actix_web::test]
async fn sweep_job_reports_zero_when_clean() {
    let state = fresh_state(None);
    let app = app!(state);
    create_lot!(app);

    let req = test::TestRequest::post()
        .uri("/v1/jobs/sweep")
        .insert_header(admin())
        .to_request();
    let result: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(result["count"], 0);
}

#[actix_web::test]
async fn malformed_ids_are_rejected() {
    let state = fresh_state(None);
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/v1/bookings/not-a-ulid")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let err: Value = test::read_body_json(resp).await;
    assert_eq!(err["code"], "VALIDATION");
}
