//! Axum REST API handlers.
//!
//! The caller is identified by the `x-user-id` header set by the auth proxy
//! in front of this service. Routes under `/accounts/:id` are open to that
//! account and to admins.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::collage::CollageRequest;
use crate::db;
use crate::errors::{Result, StoreError};
use crate::feed::{ChangeFeed, Subscription, Topic};
use crate::history::{self, OrderStatus, OrderStream, OrderView};
use crate::ledger::{HistoryStream, Ledger};
use crate::lookup::LookupClient;
use crate::models::{Account, EntryKind, LedgerEntry, Skin};
use crate::site::{Phase, SiteStatus};
use crate::unlock::UnlockGate;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub ledger: Ledger,
    pub gate: Arc<UnlockGate>,
    pub feed: ChangeFeed,
    pub lookup: Option<LookupClient>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/accounts", post(create_account))
        .route("/accounts/:id", get(get_account))
        .route("/accounts/:id/credit", post(credit_account))
        .route("/accounts/:id/ledger", get(get_ledger))
        .route("/accounts/:id/ledger.csv", get(get_ledger_csv))
        .route("/accounts/:id/ledger/stream", get(stream_ledger))
        .route("/accounts/:id/orders", get(get_orders).post(ingest_order))
        .route("/accounts/:id/orders/stream", get(stream_orders))
        .route(
            "/accounts/:id/collages",
            get(get_collages).delete(delete_collage),
        )
        .route("/accounts/:id/collages/stream", get(stream_collages))
        .route("/skins", get(get_skins).post(upsert_skin))
        .route("/collage/quote", post(quote))
        .route("/collage/sessions", post(open_session))
        .route("/collage/sessions/:id", get(get_session).put(update_session))
        .route("/collage/sessions/:id/preview", get(preview_session))
        .route("/collage/sessions/:id/unlock", post(unlock_session))
        .route("/collage/sessions/:id/download", get(download_session))
        .route("/lookup/:user_id/:zone_id", get(lookup_account))
        .route("/site-status", get(get_site_status).put(put_site_status))
        .route("/site-status/stream", get(stream_site_status))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct LedgerResponse {
    pub account_id: String,
    pub count: usize,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Serialize)]
pub struct OrdersResponse {
    pub account_id: String,
    pub count: usize,
    pub orders: Vec<OrderView>,
    /// Per-status counts over all orders, before filtering.
    pub facets: BTreeMap<&'static str, usize>,
}

#[derive(Serialize)]
pub struct CollagesResponse {
    pub account_id: String,
    pub collages: Vec<String>,
}

#[derive(Serialize)]
pub struct PreviewResponse {
    pub session_id: String,
    pub png_base64: String,
}

#[derive(Serialize)]
pub struct SiteStatusResponse {
    #[serde(flatten)]
    pub status: SiteStatus,
    #[serde(flatten)]
    pub phase: Phase,
}

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreditRequest {
    /// `credit`, `top_up` or `refund`.
    pub kind: String,
    pub amount: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct OrderIngest {
    pub id: String,
    pub doc: Value,
}

#[derive(Deserialize)]
pub struct CollageRef {
    pub url: String,
}

#[derive(Deserialize)]
pub struct UnlockRequest {
    pub confirmed_price: i64,
}

// ─────────────────────────────────────────────────────────
// Errors and caller identity
// ─────────────────────────────────────────────────────────

fn status_of(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        StoreError::Forbidden(_) | StoreError::NotUnlocked => StatusCode::FORBIDDEN,
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        StoreError::Validation(_) => StatusCode::BAD_REQUEST,
        StoreError::Maintenance | StoreError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::UploadFailed(_) | StoreError::PersistFailed(_) | StoreError::Http(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: StoreError) -> Response {
    let status = status_of(&err);
    if status.is_server_error() {
        warn!("Request failed: {err}");
    }
    (
        status,
        Json(json!(ErrorResponse {
            error: err.to_string()
        })),
    )
        .into_response()
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    respond_with(StatusCode::OK, result)
}

fn respond_with<T: Serialize>(status: StatusCode, result: Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(json!(body))).into_response(),
        Err(e) => error_response(e),
    }
}

fn caller(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

async fn require_admin(pool: &SqlitePool, caller: Option<&str>) -> Result<Account> {
    let id = caller.ok_or(StoreError::NotAuthenticated)?;
    let account = db::get_account(pool, id).await?;
    if !account.is_admin() {
        return Err(StoreError::Forbidden("admin role required".to_string()));
    }
    Ok(account)
}

/// The account itself or an admin may read and change it.
async fn require_owner_or_admin(pool: &SqlitePool, caller: Option<&str>, account_id: &str) -> Result<()> {
    let id = caller.ok_or(StoreError::NotAuthenticated)?;
    if id == account_id {
        return Ok(());
    }
    require_admin(pool, Some(id)).await.map(|_| ())
}

// ─────────────────────────────────────────────────────────
// Handlers: accounts and ledger
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /accounts`
///
/// Provisions the calling identity with a zero balance. Called by the auth
/// provider after sign-up.
pub async fn create_account(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    let result = async {
        let id = caller(&headers).ok_or(StoreError::NotAuthenticated)?;
        let account = db::create_account(&state.pool, id, "user").await?;
        info!("Provisioned account {id}");
        Ok::<_, StoreError>(account)
    }
    .await;
    respond_with(StatusCode::CREATED, result)
}

/// `GET /accounts/:id`
pub async fn get_account(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Response {
    let result = async {
        require_owner_or_admin(&state.pool, caller(&headers), &account_id).await?;
        db::get_account(&state.pool, &account_id).await
    }
    .await;
    respond(result)
}

/// `POST /accounts/:id/credit` (admin)
pub async fn credit_account(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Json(body): Json<CreditRequest>,
) -> Response {
    let result = async {
        let admin = require_admin(&state.pool, caller(&headers)).await?;
        let kind = match EntryKind::parse(&body.kind) {
            Some(kind) if !kind.is_debit() => kind,
            _ => {
                return Err(StoreError::Validation(format!(
                    "'{}' is not a credit kind (credit, top_up, refund)",
                    body.kind
                )))
            }
        };
        let reason = if body.reason.trim().is_empty() {
            kind.as_str().to_string()
        } else {
            body.reason.trim().to_string()
        };
        state
            .ledger
            .record(&account_id, kind, body.amount, &reason, &admin.id)
            .await
    }
    .await;
    respond(result)
}

/// `GET /accounts/:id/ledger?q=`
pub async fn get_ledger(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let result = async {
        require_owner_or_admin(&state.pool, caller(&headers), &account_id).await?;
        let entries = state.ledger.entries(&account_id).await?;
        let entries = history::filter_entries(&entries, &query.q);
        Ok::<_, StoreError>(LedgerResponse {
            account_id: account_id.clone(),
            count: entries.len(),
            entries,
        })
    }
    .await;
    respond(result)
}

/// `GET /accounts/:id/ledger.csv?q=`
pub async fn get_ledger_csv(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let result = async {
        require_owner_or_admin(&state.pool, caller(&headers), &account_id).await?;
        let entries = state.ledger.entries(&account_id).await?;
        Ok::<_, StoreError>(history::ledger_csv_local(&history::filter_entries(
            &entries, &query.q,
        )))
    }
    .await;

    match result {
        Ok(csv) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"ledger-{account_id}.csv\""),
                ),
            ],
            csv,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

fn ledger_events(history: HistoryStream) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold(history, |mut history| async move {
        let event = match history.next().await {
            None => return None,
            Some(Ok(entries)) => Event::default()
                .event("ledger")
                .json_data(&entries)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
            Some(Err(e)) => Event::default().event("error").data(e.to_string()),
        };
        Some((Ok(event), history))
    })
}

/// `GET /accounts/:id/ledger/stream`
///
/// Server-sent events: one `ledger` event with the full history right away,
/// then another after every change. Disconnecting drops the subscription.
pub async fn stream_ledger(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Response {
    if let Err(e) = require_owner_or_admin(&state.pool, caller(&headers), &account_id).await {
        return error_response(e);
    }
    Sse::new(ledger_events(state.ledger.history(&account_id)))
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers: orders and saved collages
// ─────────────────────────────────────────────────────────

/// `GET /accounts/:id/orders?q=&status=`
pub async fn get_orders(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let result = async {
        require_owner_or_admin(&state.pool, caller(&headers), &account_id).await?;
        let all = history::load_orders(&state.pool, &account_id).await?;
        let facets = history::status_facets(&all)
            .into_iter()
            .map(|(status, count)| (status.as_str(), count))
            .collect();
        let status = query.status.as_deref().map(OrderStatus::parse);
        let orders = history::filter_orders(&all, &query.q, status);
        Ok::<_, StoreError>(OrdersResponse {
            account_id: account_id.clone(),
            count: orders.len(),
            orders,
            facets,
        })
    }
    .await;
    respond(result)
}

fn order_events(orders: OrderStream) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold(orders, |mut orders| async move {
        let event = match orders.next().await {
            None => return None,
            Some(Ok(views)) => Event::default()
                .event("orders")
                .json_data(&views)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
            Some(Err(e)) => Event::default().event("error").data(e.to_string()),
        };
        Some((Ok(event), orders))
    })
}

/// `GET /accounts/:id/orders/stream`
pub async fn stream_orders(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Response {
    if let Err(e) = require_owner_or_admin(&state.pool, caller(&headers), &account_id).await {
        return error_response(e);
    }
    let orders = OrderStream::new(state.pool.clone(), &state.feed, &account_id);
    Sse::new(order_events(orders))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// `POST /accounts/:id/orders` (admin)
///
/// Order documents pushed by the payment backend.
pub async fn ingest_order(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Json(body): Json<OrderIngest>,
) -> Response {
    let result = async {
        require_admin(&state.pool, caller(&headers)).await?;
        if body.id.trim().is_empty() {
            return Err(StoreError::Validation("order id is empty".to_string()));
        }
        history::ingest_order(&state.pool, &state.feed, &account_id, &body.id, &body.doc).await?;
        Ok::<_, StoreError>(json!({ "account_id": account_id, "order_id": body.id }))
    }
    .await;
    respond_with(StatusCode::CREATED, result)
}

/// `GET /accounts/:id/collages`
pub async fn get_collages(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Response {
    let result = async {
        require_owner_or_admin(&state.pool, caller(&headers), &account_id).await?;
        let collages = state.gate.saved_collages(&account_id).await?;
        Ok::<_, StoreError>(CollagesResponse {
            account_id: account_id.clone(),
            collages,
        })
    }
    .await;
    respond(result)
}

fn collage_events(
    gate: Arc<UnlockGate>,
    account_id: String,
    changes: Subscription,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold(changes, move |mut changes| {
        let gate = gate.clone();
        let account_id = account_id.clone();
        async move {
            if !changes.next_change().await {
                return None;
            }
            let event = match gate.saved_collages(&account_id).await {
                Ok(collages) => Event::default()
                    .event("collages")
                    .json_data(&CollagesResponse { account_id, collages })
                    .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
                Err(e) => Event::default().event("error").data(e.to_string()),
            };
            Some((Ok(event), changes))
        }
    })
}

/// `GET /accounts/:id/collages/stream`
///
/// Re-sends the saved list after every unlock or removal.
pub async fn stream_collages(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Response {
    if let Err(e) = require_owner_or_admin(&state.pool, caller(&headers), &account_id).await {
        return error_response(e);
    }
    let changes = state.feed.subscribe(Topic::Collages(account_id.clone()));
    Sse::new(collage_events(state.gate.clone(), account_id, changes))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// `DELETE /accounts/:id/collages?url=`
pub async fn delete_collage(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Query(target): Query<CollageRef>,
) -> Response {
    let result = async {
        require_owner_or_admin(&state.pool, caller(&headers), &account_id).await?;
        if !state.gate.remove_collage(&account_id, &target.url).await? {
            return Err(StoreError::NotFound(format!("collage {}", target.url)));
        }
        Ok::<_, StoreError>(json!({ "removed": target.url }))
    }
    .await;
    respond(result)
}

// ─────────────────────────────────────────────────────────
// Handlers: catalog and collage sessions
// ─────────────────────────────────────────────────────────

/// `GET /skins`
pub async fn get_skins(State(state): State<Arc<ApiState>>) -> Response {
    respond(db::list_skins(&state.pool).await)
}

/// `POST /skins` (admin)
pub async fn upsert_skin(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(skin): Json<Skin>,
) -> Response {
    let result = async {
        require_admin(&state.pool, caller(&headers)).await?;
        if skin.id.trim().is_empty() || skin.image_url.trim().is_empty() {
            return Err(StoreError::Validation(
                "skin id and image_url are required".to_string(),
            ));
        }
        db::upsert_skin(&state.pool, &skin).await?;
        Ok::<_, StoreError>(skin)
    }
    .await;
    respond(result)
}

/// `POST /collage/quote`
pub async fn quote(State(state): State<Arc<ApiState>>, Json(request): Json<CollageRequest>) -> Response {
    respond(Ok(state.gate.quote(&request)))
}

/// `POST /collage/sessions`
pub async fn open_session(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<CollageRequest>,
) -> Response {
    respond_with(
        StatusCode::CREATED,
        state.gate.open(caller(&headers), request).await,
    )
}

/// `GET /collage/sessions/:id`
pub async fn get_session(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    respond(state.gate.view(caller(&headers), &session_id).await)
}

/// `PUT /collage/sessions/:id`
pub async fn update_session(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(request): Json<CollageRequest>,
) -> Response {
    respond(
        state
            .gate
            .update(caller(&headers), &session_id, request)
            .await,
    )
}

/// `GET /collage/sessions/:id/preview`
pub async fn preview_session(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    let result = state
        .gate
        .preview(caller(&headers), &session_id)
        .await
        .map(|png| PreviewResponse {
            session_id: session_id.clone(),
            png_base64: base64::engine::general_purpose::STANDARD.encode(png),
        });
    respond(result)
}

/// `POST /collage/sessions/:id/unlock`
pub async fn unlock_session(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<UnlockRequest>,
) -> Response {
    respond(
        state
            .gate
            .unlock(caller(&headers), &session_id, body.confirmed_price)
            .await,
    )
}

/// `GET /collage/sessions/:id/download`
pub async fn download_session(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    match state.gate.download(caller(&headers), &session_id).await {
        Ok(png) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/png".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"collage-{session_id}.png\""),
                ),
            ],
            png,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ─────────────────────────────────────────────────────────
// Handlers: lookup and site status
// ─────────────────────────────────────────────────────────

/// `GET /lookup/:user_id/:zone_id`
pub async fn lookup_account(
    State(state): State<Arc<ApiState>>,
    Path((user_id, zone_id)): Path<(String, String)>,
) -> Response {
    let Some(client) = &state.lookup else {
        return error_response(StoreError::Config(
            "game-account lookup is not configured".to_string(),
        ));
    };
    respond(client.lookup(&user_id, &zone_id).await)
}

/// `GET /site-status`
pub async fn get_site_status(State(state): State<Arc<ApiState>>) -> Response {
    let result = db::get_site_status(&state.pool)
        .await
        .map(|status| SiteStatusResponse {
            phase: status.phase(db::now_millis()),
            status,
        });
    respond(result)
}

fn site_status_events(
    pool: SqlitePool,
    changes: Subscription,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold(changes, move |mut changes| {
        let pool = pool.clone();
        async move {
            if !changes.next_change().await {
                return None;
            }
            let event = match db::get_site_status(&pool).await {
                Ok(status) => Event::default()
                    .event("site_status")
                    .json_data(&SiteStatusResponse {
                        phase: status.phase(db::now_millis()),
                        status,
                    })
                    .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
                Err(e) => Event::default().event("error").data(e.to_string()),
            };
            Some((Ok(event), changes))
        }
    })
}

/// `GET /site-status/stream`
///
/// Public, like `GET /site-status`. A new event follows every admin change.
pub async fn stream_site_status(State(state): State<Arc<ApiState>>) -> Response {
    let changes = state.feed.subscribe(Topic::SiteStatus);
    Sse::new(site_status_events(state.pool.clone(), changes))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// `PUT /site-status` (admin)
pub async fn put_site_status(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(status): Json<SiteStatus>,
) -> Response {
    let result = async {
        let admin = require_admin(&state.pool, caller(&headers)).await?;
        db::set_site_status(&state.pool, &status).await?;
        state.feed.publish(Topic::SiteStatus);
        info!(
            "Site status set by {}: maintenance={} scheduled={:?}",
            admin.id, status.maintenance, status.scheduled_start_ms
        );
        Ok::<_, StoreError>(SiteStatusResponse {
            phase: status.phase(db::now_millis()),
            status,
        })
    }
    .await;
    respond(result)
}
