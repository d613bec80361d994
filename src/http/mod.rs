//! REST surface. Thin translation layer: headers to identity, ISO-8601
//! to unix milliseconds, engine results to JSON. All state changes go
//! through the tenant's engine.

pub mod error;

pub use error::ApiError;

use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, delete, get, patch, post, web};
use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::config::{ExpandPolicy, ReleasePolicy};
use crate::engine::{Engine, EngineError, now_ms};
use crate::model::*;
use crate::tenant::TenantManager;

pub struct AppState {
    pub tenants: Arc<TenantManager>,
    pub token: Option<String>,
    pub release: ReleasePolicy,
    pub expand: ExpandPolicy,
}

// ── Identity and tenancy ─────────────────────────────────────

/// Caller identity as asserted by the upstream identity service.
struct Actor {
    user: Option<String>,
    admin: bool,
}

fn header<'r>(req: &'r HttpRequest, name: &str) -> Option<&'r str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Static bearer token gate. Open when no token is configured.
fn check_token(state: &AppState, req: &HttpRequest) -> Result<(), ApiError> {
    let Some(expected) = &state.token else {
        return Ok(());
    };
    match header(req, "authorization").and_then(|v| v.strip_prefix("Bearer ")) {
        Some(got) if got == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

fn actor(req: &HttpRequest) -> Actor {
    Actor {
        user: header(req, "x-user").map(str::to_string),
        admin: header(req, "x-role").is_some_and(|r| r.eq_ignore_ascii_case("admin")),
    }
}

impl Actor {
    fn require_user(&self) -> Result<&str, ApiError> {
        self.user.as_deref().ok_or(ApiError::Forbidden)
    }

    fn require_admin(&self) -> Result<(), ApiError> {
        if self.admin { Ok(()) } else { Err(ApiError::Forbidden) }
    }

    /// Owner-or-admin rule used by cancel, check-in and swap.
    fn may_touch(&self, owner: &str) -> Result<(), ApiError> {
        if self.admin || self.user.as_deref() == Some(owner) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    fn name(&self) -> &str {
        self.user.as_deref().unwrap_or("admin")
    }
}

/// Tenant comes from `X-Parkd-Org`; absent means the default tenant.
fn engine_for(state: &AppState, req: &HttpRequest) -> Result<Arc<Engine>, ApiError> {
    check_token(state, req)?;
    let tenant = header(req, "x-parkd-org").unwrap_or("default");
    Ok(state.tenants.get_or_create(tenant)?)
}

fn audit(actor: &Actor, action: &str, subject: Ulid) {
    info!(target: "audit", actor = actor.name(), action, subject = %subject);
}

// ── Wire conversions ─────────────────────────────────────────

fn parse_id(s: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(s).map_err(|_| ApiError::Validation(format!("malformed id: {s:?}")))
}

fn to_ms(t: DateTime<Utc>) -> Ms {
    t.timestamp_millis()
}

fn to_datetime(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn to_day(date: NaiveDate) -> i64 {
    date.signed_duration_since(NaiveDate::default()).num_days()
}

fn to_date(day: i64) -> NaiveDate {
    NaiveDate::default() + chrono::Days::new(day.max(0) as u64)
}

fn to_minute(t: NaiveTime) -> u16 {
    (t.hour() * 60 + t.minute()) as u16
}

// ── DTOs ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateLot {
    name: String,
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
struct UpdateLot {
    name: Option<String>,
    address: Option<String>,
    open: Option<bool>,
}

#[derive(Deserialize)]
struct CreateSlot {
    number: String,
}

#[derive(Deserialize)]
struct UpdateSlot {
    out_of_service: bool,
}

#[derive(Deserialize)]
struct CreateBooking {
    lot_id: String,
    /// Omitted = auto-assign first free slot.
    slot_id: Option<String>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    guest_name: Option<String>,
    guest_email: Option<String>,
}

#[derive(Deserialize)]
struct QuickBook {
    lot_id: String,
}

#[derive(Deserialize)]
struct SwapBooking {
    slot_id: String,
}

#[derive(Deserialize)]
struct AvailabilityQuery {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct CreateRecurrence {
    lot_id: String,
    slot_id: String,
    /// Weekdays, 0 = Monday … 6 = Sunday.
    weekdays: Vec<u8>,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    start_time: NaiveTime,
    end_time: NaiveTime,
}

#[derive(Serialize)]
struct BookingDto {
    id: Ulid,
    slot_id: Ulid,
    lot_id: Ulid,
    user: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    status: BookingStatus,
    kind: BookingKind,
    checked_in_at: Option<DateTime<Utc>>,
    cancelled: Option<CancelReason>,
}

impl From<BookingInfo> for BookingDto {
    fn from(b: BookingInfo) -> Self {
        Self {
            id: b.id,
            slot_id: b.slot_id,
            lot_id: b.lot_id,
            user: b.user,
            start: to_datetime(b.start),
            end: to_datetime(b.end),
            status: b.status,
            kind: b.kind,
            checked_in_at: b.checked_in_at.map(to_datetime),
            cancelled: b.cancelled,
        }
    }
}

#[derive(Serialize)]
struct RecurrenceDto {
    id: Ulid,
    user: String,
    lot_id: Ulid,
    slot_id: Ulid,
    weekdays: Vec<u8>,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    start_time: String,
    end_time: String,
    active: bool,
}

impl From<Recurrence> for RecurrenceDto {
    fn from(r: Recurrence) -> Self {
        Self {
            id: r.id,
            user: r.user,
            lot_id: r.lot_id,
            slot_id: r.slot_id,
            weekdays: r.weekdays.days(),
            start_date: to_date(r.start_day),
            end_date: r.end_day.map(to_date),
            start_time: format!("{:02}:{:02}", r.start_minute / 60, r.start_minute % 60),
            end_time: format!("{:02}:{:02}", r.end_minute / 60, r.end_minute % 60),
            active: r.active,
        }
    }
}

#[derive(Serialize)]
struct WaitlistDto {
    id: Ulid,
    lot_id: Ulid,
    user: String,
    joined_at: DateTime<Utc>,
    notified_at: Option<DateTime<Utc>>,
}

impl From<WaitlistInfo> for WaitlistDto {
    fn from(w: WaitlistInfo) -> Self {
        Self {
            id: w.id,
            lot_id: w.lot_id,
            user: w.user,
            joined_at: to_datetime(w.joined_at),
            notified_at: w.notified_at.map(to_datetime),
        }
    }
}

#[derive(Serialize)]
struct JobResult {
    count: usize,
}

// ── Lots ─────────────────────────────────────────────────────

#[post("/v1/lots")]
async fn create_lot(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateLot>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    actor.require_admin()?;

    let id = Ulid::new();
    let body = body.into_inner();
    engine.create_lot(id, body.name, body.address).await?;
    audit(&actor, "lot.create", id);
    let lot = engine.get_lot(&id).await.ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Created().json(lot))
}

#[get("/v1/lots")]
async fn list_lots(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    Ok(HttpResponse::Ok().json(engine.list_lots().await))
}

#[patch("/v1/lots/{id}")]
async fn update_lot(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<UpdateLot>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    actor.require_admin()?;

    let id = parse_id(&path)?;
    let current = engine
        .get_lot(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    let body = body.into_inner();
    engine
        .update_lot(
            id,
            body.name.unwrap_or(current.name),
            body.address.unwrap_or(current.address),
            body.open.unwrap_or(current.open),
        )
        .await?;
    audit(&actor, "lot.update", id);
    let updated = engine
        .get_lot(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Ok().json(updated))
}

#[delete("/v1/lots/{id}")]
async fn delete_lot(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    actor.require_admin()?;

    let id = parse_id(&path)?;
    engine.delete_lot(id).await?;
    audit(&actor, "lot.delete", id);
    Ok(HttpResponse::NoContent().finish())
}

// ── Slots ────────────────────────────────────────────────────

#[post("/v1/lots/{id}/slots")]
async fn create_slot(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<CreateSlot>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    actor.require_admin()?;

    let lot_id = parse_id(&path)?;
    let id = Ulid::new();
    engine.create_slot(id, lot_id, body.into_inner().number).await?;
    audit(&actor, "slot.create", id);
    let slot = engine
        .get_slot(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Created().json(slot))
}

#[get("/v1/lots/{id}/slots")]
async fn list_slots(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let lot_id = parse_id(&path)?;
    Ok(HttpResponse::Ok().json(engine.list_slots(&lot_id).await?))
}

#[patch("/v1/slots/{id}")]
async fn update_slot(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<UpdateSlot>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    actor.require_admin()?;

    let id = parse_id(&path)?;
    engine.set_slot_service(id, body.out_of_service).await?;
    audit(&actor, "slot.update", id);
    let slot = engine
        .get_slot(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Ok().json(slot))
}

#[delete("/v1/slots/{id}")]
async fn delete_slot(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    actor.require_admin()?;

    let id = parse_id(&path)?;
    engine.delete_slot(id).await?;
    audit(&actor, "slot.delete", id);
    Ok(HttpResponse::NoContent().finish())
}

// ── Bookings ─────────────────────────────────────────────────

#[post("/v1/bookings")]
async fn create_booking(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateBooking>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    let user = actor.require_user()?.to_string();

    let body = body.into_inner();
    let lot_id = parse_id(&body.lot_id)?;
    let slot_id = body.slot_id.as_deref().map(parse_id).transpose()?;
    let span = Span {
        start: to_ms(body.start),
        end: to_ms(body.end),
    };
    let kind = match (body.guest_name, body.guest_email) {
        (None, None) => BookingKind::OneOff,
        (Some(name), Some(email)) => BookingKind::Guest { name, email },
        _ => {
            return Err(ApiError::Validation(
                "guest bookings need both guest_name and guest_email".into(),
            ));
        }
    };

    let id = Ulid::new();
    engine
        .create_booking(id, lot_id, slot_id, user, span, kind)
        .await?;
    audit(&actor, "booking.create", id);
    let booking = engine
        .get_booking(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Created().json(BookingDto::from(booking)))
}

#[post("/v1/bookings/quick")]
async fn quick_book(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<QuickBook>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    let user = actor.require_user()?.to_string();

    let lot_id = parse_id(&body.lot_id)?;
    let id = Ulid::new();
    engine.quick_book(id, lot_id, user, now_ms()).await?;
    audit(&actor, "booking.quick", id);
    let booking = engine
        .get_booking(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Created().json(BookingDto::from(booking)))
}

#[get("/v1/bookings/{id}")]
async fn get_booking(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let id = parse_id(&path)?;
    let booking = engine
        .get_booking(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Ok().json(BookingDto::from(booking)))
}

#[get("/v1/lots/{id}/bookings")]
async fn list_bookings(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let lot_id = parse_id(&path)?;
    let bookings: Vec<BookingDto> = engine
        .list_bookings(&lot_id)
        .await?
        .into_iter()
        .map(BookingDto::from)
        .collect();
    Ok(HttpResponse::Ok().json(bookings))
}

#[post("/v1/bookings/{id}/cancel")]
async fn cancel_booking(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    let id = parse_id(&path)?;

    let booking = engine
        .get_booking(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    actor.may_touch(&booking.user)?;

    let reason = if actor.user.as_deref() == Some(booking.user.as_str()) {
        CancelReason::User
    } else {
        CancelReason::Admin
    };
    engine.cancel_booking(id, reason).await?;
    audit(&actor, "booking.cancel", id);
    let updated = engine
        .get_booking(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Ok().json(BookingDto::from(updated)))
}

#[post("/v1/bookings/{id}/checkin")]
async fn check_in(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    let id = parse_id(&path)?;

    let booking = engine
        .get_booking(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    actor.may_touch(&booking.user)?;

    engine.check_in(id, now_ms()).await?;
    audit(&actor, "booking.checkin", id);
    let updated = engine
        .get_booking(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Ok().json(BookingDto::from(updated)))
}

#[post("/v1/bookings/{id}/swap")]
async fn swap_booking(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<SwapBooking>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    let id = parse_id(&path)?;
    let target = parse_id(&body.slot_id)?;

    let booking = engine
        .get_booking(&id)
        .await
        .ok_or(EngineError::NotFound(id))?;
    actor.may_touch(&booking.user)?;

    let new_id = engine.swap_booking(id, Ulid::new(), target).await?;
    audit(&actor, "booking.swap", new_id);
    let moved = engine
        .get_booking(&new_id)
        .await
        .ok_or(EngineError::NotFound(new_id))?;
    Ok(HttpResponse::Ok().json(BookingDto::from(moved)))
}

// ── Availability ─────────────────────────────────────────────

#[get("/v1/lots/{id}/availability")]
async fn availability(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<AvailabilityQuery>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let lot_id = parse_id(&path)?;
    let span = Span {
        start: to_ms(query.start),
        end: to_ms(query.end),
    };
    Ok(HttpResponse::Ok().json(engine.free_slots(&lot_id, &span).await?))
}

// ── Recurrences ──────────────────────────────────────────────

#[post("/v1/recurrences")]
async fn create_recurrence(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateRecurrence>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    let user = actor.require_user()?.to_string();

    let body = body.into_inner();
    let rule = Recurrence {
        id: Ulid::new(),
        user,
        lot_id: parse_id(&body.lot_id)?,
        slot_id: parse_id(&body.slot_id)?,
        weekdays: WeekdaySet::from_days(&body.weekdays),
        start_day: to_day(body.start_date),
        end_day: body.end_date.map(to_day),
        start_minute: to_minute(body.start_time),
        end_minute: to_minute(body.end_time),
        active: true,
    };
    let id = rule.id;
    engine.create_recurrence(rule).await?;
    audit(&actor, "recurrence.create", id);
    let created = engine
        .get_recurrence(&id)
        .ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Created().json(RecurrenceDto::from(created)))
}

#[get("/v1/recurrences")]
async fn list_recurrences(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let rules: Vec<RecurrenceDto> = engine
        .list_recurrences()
        .into_iter()
        .map(RecurrenceDto::from)
        .collect();
    Ok(HttpResponse::Ok().json(rules))
}

#[post("/v1/recurrences/{id}/deactivate")]
async fn deactivate_recurrence(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    let id = parse_id(&path)?;

    let rule = engine
        .get_recurrence(&id)
        .ok_or(EngineError::NotFound(id))?;
    actor.may_touch(&rule.user)?;

    engine.deactivate_recurrence(id).await?;
    audit(&actor, "recurrence.deactivate", id);
    Ok(HttpResponse::NoContent().finish())
}

// ── Waitlist ─────────────────────────────────────────────────

#[post("/v1/lots/{id}/waitlist")]
async fn join_waitlist(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    let user = actor.require_user()?.to_string();

    let lot_id = parse_id(&path)?;
    let id = Ulid::new();
    engine.join_waitlist(id, lot_id, user, now_ms()).await?;
    audit(&actor, "waitlist.join", id);
    let entries = engine.list_waitlist(&lot_id).await?;
    let entry = entries
        .into_iter()
        .find(|e| e.id == id)
        .ok_or(EngineError::NotFound(id))?;
    Ok(HttpResponse::Created().json(WaitlistDto::from(entry)))
}

#[get("/v1/lots/{id}/waitlist")]
async fn list_waitlist(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let lot_id = parse_id(&path)?;
    let entries: Vec<WaitlistDto> = engine
        .list_waitlist(&lot_id)
        .await?
        .into_iter()
        .map(WaitlistDto::from)
        .collect();
    Ok(HttpResponse::Ok().json(entries))
}

// ── Jobs (run-once entry points for external schedulers) ─────

#[post("/v1/jobs/sweep")]
async fn run_sweep(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    actor.require_admin()?;

    let count = engine.sweep(now_ms(), &state.release).await;
    Ok(HttpResponse::Ok().json(JobResult { count }))
}

#[post("/v1/jobs/expand")]
async fn run_expand(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let engine = engine_for(&state, &req)?;
    let actor = actor(&req);
    actor.require_admin()?;

    let count = engine.expand(now_ms(), state.expand.horizon_days).await;
    Ok(HttpResponse::Ok().json(JobResult { count }))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(create_lot)
        .service(list_lots)
        .service(update_lot)
        .service(delete_lot)
        .service(create_slot)
        .service(list_slots)
        .service(update_slot)
        .service(delete_slot)
        .service(create_booking)
        .service(quick_book)
        .service(get_booking)
        .service(list_bookings)
        .service(cancel_booking)
        .service(check_in)
        .service(swap_booking)
        .service(availability)
        .service(create_recurrence)
        .service(list_recurrences)
        .service(deactivate_recurrence)
        .service(join_waitlist)
        .service(list_waitlist)
        .service(run_sweep)
        .service(run_expand);
}
