//! Order and transaction history views.
//!
//! Order documents come from the payment backend in whatever shape it had
//! at the time, so every field is read defensively and falls back to a
//! placeholder. Nothing in here fails on a malformed document.

use std::collections::BTreeMap;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::Result;
use crate::feed::{ChangeFeed, Subscription, Topic};
use crate::models::{LedgerEntry, StoredOrder};

pub const UNKNOWN: &str = "Unknown";
pub const PLACEHOLDER: &str = "-";

/// Epoch values below this are seconds, above it milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;
/// 0001-01-01T00:00:00Z and 9999-12-31T23:59:59.999Z; anything outside is shown as unknown.
const DISPLAY_RANGE_MS: std::ops::RangeInclusive<i64> = -62_135_596_800_000..=253_402_300_799_999;
const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const LEDGER_CSV_HEADER: &str = "ID,Type,Amount,By,Reason,New Balance,Timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    Unknown,
}

impl OrderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "processing" => Self::Pending,
            "completed" | "success" | "done" => Self::Completed,
            "failed" | "cancelled" | "error" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

/// An order with every field present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderView {
    pub id: String,
    pub item: String,
    pub cost: f64,
    pub status: OrderStatus,
    pub payment_method: String,
    pub game_user_id: String,
    pub zone_id: String,
    /// Epoch millis when known, used for sorting.
    pub created_at_ms: Option<i64>,
    pub created_at: String,
}

// ─────────────────────────────────────────────────────────
// Normalisation
// ─────────────────────────────────────────────────────────

fn text_field(doc: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match doc.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn number_field(doc: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match doc.get(key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(v) = s.trim().parse::<f64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn normalize_order<Tz: TimeZone>(id: &str, doc: &Value, tz: &Tz) -> OrderView
where
    Tz::Offset: std::fmt::Display,
{
    let created = doc
        .get("createdAt")
        .or_else(|| doc.get("created_at"))
        .or_else(|| doc.get("timestamp"));
    let created_at_ms = created.and_then(timestamp_millis);

    OrderView {
        id: text_field(doc, &["id", "orderId"]).unwrap_or_else(|| id.to_string()),
        item: text_field(doc, &["item", "itemName", "product"])
            .unwrap_or_else(|| PLACEHOLDER.to_string()),
        cost: number_field(doc, &["cost", "price", "amount"]).unwrap_or(0.0),
        status: text_field(doc, &["status"])
            .map(|s| OrderStatus::parse(&s))
            .unwrap_or(OrderStatus::Unknown),
        payment_method: text_field(doc, &["paymentMethod", "payment_method", "method"])
            .unwrap_or_else(|| PLACEHOLDER.to_string()),
        game_user_id: text_field(doc, &["userId", "gameUserId", "game_user_id"])
            .unwrap_or_else(|| PLACEHOLDER.to_string()),
        zone_id: text_field(doc, &["zoneId", "zone_id", "serverId"])
            .unwrap_or_else(|| PLACEHOLDER.to_string()),
        created_at_ms,
        created_at: match created_at_ms {
            Some(ms) => format_millis(ms, tz),
            None => UNKNOWN.to_string(),
        },
    }
}

/// Normalise stored orders, newest first. Undecodable documents become
/// all-placeholder rows rather than disappearing.
pub fn normalize_orders<Tz: TimeZone>(stored: &[StoredOrder], tz: &Tz) -> Vec<OrderView>
where
    Tz::Offset: std::fmt::Display,
{
    let mut orders: Vec<OrderView> = stored
        .iter()
        .map(|o| {
            let doc = serde_json::from_str(&o.doc).unwrap_or(Value::Null);
            let mut view = normalize_order(&o.id, &doc, tz);
            if view.created_at_ms.is_none() {
                view.created_at_ms = Some(o.received_at);
            }
            view
        })
        .collect();
    orders.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
    orders
}

// ─────────────────────────────────────────────────────────
// Filtering
// ─────────────────────────────────────────────────────────

fn matches_query(fields: &[&str], query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    needle.is_empty() || fields.iter().any(|f| f.to_lowercase().contains(&needle))
}

/// Case-insensitive substring search across the visible fields, optionally
/// restricted to one status.
pub fn filter_orders(orders: &[OrderView], query: &str, status: Option<OrderStatus>) -> Vec<OrderView> {
    orders
        .iter()
        .filter(|o| status.map_or(true, |s| o.status == s))
        .filter(|o| {
            matches_query(
                &[
                    o.id.as_str(),
                    o.item.as_str(),
                    o.status.as_str(),
                    o.payment_method.as_str(),
                    o.game_user_id.as_str(),
                    o.zone_id.as_str(),
                ],
                query,
            )
        })
        .cloned()
        .collect()
}

pub fn status_facets(orders: &[OrderView]) -> BTreeMap<OrderStatus, usize> {
    let mut facets = BTreeMap::new();
    for order in orders {
        *facets.entry(order.status).or_insert(0) += 1;
    }
    facets
}

pub fn filter_entries(entries: &[LedgerEntry], query: &str) -> Vec<LedgerEntry> {
    entries
        .iter()
        .filter(|e| {
            let id = e.id.to_string();
            matches_query(
                &[id.as_str(), e.kind.as_str(), e.reason.as_str(), e.actor.as_str()],
                query,
            )
        })
        .cloned()
        .collect()
}

// ─────────────────────────────────────────────────────────
// Timestamps
// ─────────────────────────────────────────────────────────

/// Interpret a stored timestamp as epoch millis.
///
/// Tried in order: a server timestamp object (`{seconds, nanoseconds}` or
/// `{_seconds, _nanoseconds}`), a numeric epoch, then a date string.
pub fn timestamp_millis(value: &Value) -> Option<i64> {
    if let Value::Object(map) = value {
        let seconds = map
            .get("seconds")
            .or_else(|| map.get("_seconds"))
            .and_then(Value::as_i64)?;
        let nanos = map
            .get("nanoseconds")
            .or_else(|| map.get("_nanoseconds"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        return seconds.checked_mul(1000)?.checked_add(nanos / 1_000_000);
    }

    if let Some(n) = value.as_f64() {
        return epoch_to_millis(n as i64);
    }

    let raw = value.as_str()?.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return epoch_to_millis(n);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(raw, DISPLAY_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Small magnitudes are seconds. `None` when the value does not fit in millis.
fn epoch_to_millis(n: i64) -> Option<i64> {
    if n.unsigned_abs() < MILLIS_THRESHOLD.unsigned_abs() {
        n.checked_mul(1000)
    } else {
        Some(n)
    }
}

fn format_millis<Tz: TimeZone>(ms: i64, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    if !DISPLAY_RANGE_MS.contains(&ms) {
        return UNKNOWN.to_string();
    }
    match Utc.timestamp_millis_opt(ms).single() {
        Some(utc) => utc.with_timezone(tz).format(DISPLAY_FORMAT).to_string(),
        None => UNKNOWN.to_string(),
    }
}

/// Human-readable time in `tz`, or `"Unknown"` when the value cannot be read.
pub fn format_timestamp<Tz: TimeZone>(value: &Value, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    timestamp_millis(value)
        .map(|ms| format_millis(ms, tz))
        .unwrap_or_else(|| UNKNOWN.to_string())
}

// ─────────────────────────────────────────────────────────
// CSV
// ─────────────────────────────────────────────────────────

/// Export ledger entries in the given order. Fields are joined as-is; a comma
/// inside a reason shifts the remaining columns.
pub fn ledger_csv<Tz: TimeZone>(entries: &[LedgerEntry], tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let mut lines = Vec::with_capacity(entries.len() + 1);
    lines.push(LEDGER_CSV_HEADER.to_string());
    for e in entries {
        lines.push(
            [
                e.id.to_string(),
                e.kind.clone(),
                e.amount.to_string(),
                e.actor.clone(),
                e.reason.clone(),
                e.balance_after.to_string(),
                format_millis(e.created_at, tz),
            ]
            .join(","),
        );
    }
    lines.join("\n")
}

pub fn ledger_csv_local(entries: &[LedgerEntry]) -> String {
    ledger_csv(entries, &Local)
}

// ─────────────────────────────────────────────────────────
// Live orders
// ─────────────────────────────────────────────────────────

/// Store an order document and notify live views.
pub async fn ingest_order(
    pool: &SqlitePool,
    feed: &ChangeFeed,
    account_id: &str,
    order_id: &str,
    doc: &Value,
) -> Result<()> {
    db::upsert_order(pool, account_id, order_id, doc).await?;
    feed.publish(Topic::Orders(account_id.to_string()));
    Ok(())
}

pub async fn load_orders(pool: &SqlitePool, account_id: &str) -> Result<Vec<OrderView>> {
    let stored = db::list_orders(pool, account_id).await?;
    Ok(normalize_orders(&stored, &Local))
}

/// Normalised order snapshots of one account, re-read on every change.
#[derive(Debug)]
pub struct OrderStream {
    pool: SqlitePool,
    account_id: String,
    sub: Subscription,
}

impl OrderStream {
    pub fn new(pool: SqlitePool, feed: &ChangeFeed, account_id: &str) -> Self {
        Self {
            pool,
            account_id: account_id.to_string(),
            sub: feed.subscribe(Topic::Orders(account_id.to_string())),
        }
    }

    pub async fn next(&mut self) -> Option<Result<Vec<OrderView>>> {
        if !self.sub.next_change().await {
            return None;
        }
        Some(load_orders(&self.pool, &self.account_id).await)
    }

    pub fn dispose(self) {
        self.sub.dispose();
    }
}
