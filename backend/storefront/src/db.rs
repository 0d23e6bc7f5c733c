//! Database layer: migrations, accounts, the balance ledger, saved collages,
//! orders, the collage catalog and the site switch.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{Result, StoreError};
use crate::models::{Account, EntryKind, LedgerEntry, Skin, StoredOrder};
use crate::site::SiteStatus;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // An in-memory database lives and dies with its connection, so keep
    // exactly one open for the lifetime of the pool.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─────────────────────────────────────────────────────────
// Accounts
// ─────────────────────────────────────────────────────────

const ACCOUNT_COLUMNS: &str =
    "id, role, balance, usage_count, last_active_at, last_saved_at, created_at";

/// Create an account with a zero balance. Fails with `Conflict` if the id is taken.
pub async fn create_account(pool: &SqlitePool, id: &str, role: &str) -> Result<Account> {
    let inserted = sqlx::query("INSERT OR IGNORE INTO users (id, role, created_at) VALUES (?1, ?2, ?3)")
        .bind(id)
        .bind(role)
        .bind(now_millis())
        .execute(pool)
        .await?
        .rows_affected();

    if inserted == 0 {
        return Err(StoreError::Conflict(format!("account {id} already exists")));
    }
    get_account(pool, id).await
}

pub async fn get_account(pool: &SqlitePool, id: &str) -> Result<Account> {
    sqlx::query_as::<_, Account>(&format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("account {id}")))
}

// ─────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────

/// A balance mutation together with the history row that records it.
#[derive(Debug, Clone)]
pub struct EntryRequest<'a> {
    pub account_id: &'a str,
    pub kind: EntryKind,
    /// Always positive; the sign comes from `kind`.
    pub amount: i64,
    pub reason: &'a str,
    pub actor: &'a str,
    /// Also count one paid collage unlock.
    pub bump_usage: bool,
}

/// Apply a balance mutation and append its history row in one transaction.
///
/// The balance read at the start of the transaction is the one the
/// insufficient-funds check runs against, and the update only lands if the
/// row still holds that value. A concurrent writer that slipped in between
/// makes this call fail with `Conflict` instead of overdrawing the account.
pub async fn apply_ledger_entry(pool: &SqlitePool, req: &EntryRequest<'_>) -> Result<LedgerEntry> {
    let mut tx = pool.begin().await?;

    let (balance,): (i64,) = sqlx::query_as("SELECT balance FROM users WHERE id = ?1")
        .bind(req.account_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("account {}", req.account_id)))?;

    let new_balance = if req.kind.is_debit() {
        if balance < req.amount {
            return Err(StoreError::InsufficientBalance {
                balance,
                required: req.amount,
            });
        }
        balance - req.amount
    } else {
        balance
            .checked_add(req.amount)
            .ok_or_else(|| StoreError::Validation("balance overflow".to_string()))?
    };

    let now = now_millis();
    let updated = sqlx::query(
        r#"
        UPDATE users
        SET    balance = ?1, usage_count = usage_count + ?2, last_active_at = ?3
        WHERE  id = ?4 AND balance = ?5
        "#,
    )
    .bind(new_balance)
    .bind(i64::from(req.bump_usage))
    .bind(now)
    .bind(req.account_id)
    .bind(balance)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(StoreError::Conflict(format!(
            "balance of {} changed during the update",
            req.account_id
        )));
    }

    let entry = sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO balance_history
            (account_id, kind, amount, reason, actor, balance_after, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        RETURNING id, account_id, kind, amount, reason, actor, balance_after, created_at
        "#,
    )
    .bind(req.account_id)
    .bind(req.kind.as_str())
    .bind(req.amount)
    .bind(req.reason)
    .bind(req.actor)
    .bind(new_balance)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(entry)
}

/// Fetch the balance history of an account, newest first.
pub async fn list_ledger(pool: &SqlitePool, account_id: &str) -> Result<Vec<LedgerEntry>> {
    let rows = sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT id, account_id, kind, amount, reason, actor, balance_after, created_at
        FROM   balance_history
        WHERE  account_id = ?1
        ORDER  BY created_at DESC, id DESC
        "#,
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Saved collages
// ─────────────────────────────────────────────────────────

async fn load_collages<'e, E>(executor: E, account_id: &str) -> Result<Vec<String>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let (raw,): (String,) = sqlx::query_as("SELECT collages FROM users WHERE id = ?1")
        .bind(account_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))?;
    Ok(serde_json::from_str(&raw)?)
}

async fn store_collages<'e, E>(executor: E, account_id: &str, urls: &[String]) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("UPDATE users SET collages = ?1 WHERE id = ?2")
        .bind(serde_json::to_string(urls)?)
        .bind(account_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Read the saved collage URLs, oldest first, trimming the stored list to
/// the `cap` most recent entries when it has grown past it.
pub async fn saved_collages(pool: &SqlitePool, account_id: &str, cap: usize) -> Result<Vec<String>> {
    let urls = load_collages(pool, account_id).await?;
    if urls.len() <= cap {
        return Ok(urls);
    }

    let trimmed = urls[urls.len() - cap..].to_vec();
    store_collages(pool, account_id, &trimmed).await?;
    info!(
        "Trimmed saved collages of {account_id} from {} to {}",
        urls.len(),
        trimmed.len()
    );
    Ok(trimmed)
}

/// Append a collage URL unless it is already saved. Returns whether the list changed.
pub async fn append_collage(pool: &SqlitePool, account_id: &str, url: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let mut urls = load_collages(&mut *tx, account_id).await?;
    if urls.iter().any(|u| u == url) {
        return Ok(false);
    }
    urls.push(url.to_string());
    store_collages(&mut *tx, account_id, &urls).await?;
    sqlx::query("UPDATE users SET last_saved_at = ?1 WHERE id = ?2")
        .bind(now_millis())
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

/// Remove one saved collage URL. Returns whether it was present.
pub async fn remove_collage(pool: &SqlitePool, account_id: &str, url: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let mut urls = load_collages(&mut *tx, account_id).await?;
    let before = urls.len();
    urls.retain(|u| u != url);
    if urls.len() == before {
        return Ok(false);
    }
    store_collages(&mut *tx, account_id, &urls).await?;
    tx.commit().await?;
    Ok(true)
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

/// Store (or replace) an order document for an account.
pub async fn upsert_order(
    pool: &SqlitePool,
    account_id: &str,
    order_id: &str,
    doc: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO orders (id, account_id, doc, received_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (account_id, id) DO UPDATE SET doc = excluded.doc, received_at = excluded.received_at
        "#,
    )
    .bind(order_id)
    .bind(account_id)
    .bind(serde_json::to_string(doc)?)
    .bind(now_millis())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_orders(pool: &SqlitePool, account_id: &str) -> Result<Vec<StoredOrder>> {
    let rows = sqlx::query_as::<_, StoredOrder>(
        "SELECT id, doc, received_at FROM orders WHERE account_id = ?1 ORDER BY received_at DESC",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────

pub async fn upsert_skin(pool: &SqlitePool, skin: &Skin) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO skins (id, name, image_url, weight, family)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (id) DO UPDATE SET
            name = excluded.name, image_url = excluded.image_url,
            weight = excluded.weight, family = excluded.family
        "#,
    )
    .bind(&skin.id)
    .bind(&skin.name)
    .bind(&skin.image_url)
    .bind(skin.weight)
    .bind(&skin.family)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_skins(pool: &SqlitePool) -> Result<Vec<Skin>> {
    let rows = sqlx::query_as::<_, Skin>(
        "SELECT id, name, image_url, weight, family FROM skins ORDER BY family ASC, name ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Site status
// ─────────────────────────────────────────────────────────

pub async fn get_site_status(pool: &SqlitePool) -> Result<SiteStatus> {
    let status = sqlx::query_as::<_, SiteStatus>(
        "SELECT maintenance, scheduled_start_ms, message FROM site_status WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(status.unwrap_or_default())
}

pub async fn set_site_status(pool: &SqlitePool, status: &SiteStatus) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO site_status (id, maintenance, scheduled_start_ms, message)
        VALUES (1, ?1, ?2, ?3)
        ON CONFLICT (id) DO UPDATE SET
            maintenance = excluded.maintenance,
            scheduled_start_ms = excluded.scheduled_start_ms,
            message = excluded.message
        "#,
    )
    .bind(status.maintenance)
    .bind(status.scheduled_start_ms)
    .bind(&status.message)
    .execute(pool)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SqlitePool {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        create_account(&pool, "alice", "user").await.expect("account");
        pool
    }

    fn deduction(amount: i64) -> EntryRequest<'static> {
        EntryRequest {
            account_id: "alice",
            kind: EntryKind::Deduction,
            amount,
            reason: "collage",
            actor: "alice",
            bump_usage: true,
        }
    }

    async fn seed_balance(pool: &SqlitePool, amount: i64) {
        apply_ledger_entry(
            pool,
            &EntryRequest {
                account_id: "alice",
                kind: EntryKind::TopUp,
                amount,
                reason: "seed",
                actor: "system",
                bump_usage: false,
            },
        )
        .await
        .expect("seed");
    }

    #[tokio::test]
    async fn duplicate_account_is_a_conflict() {
        let pool = setup().await;
        let err = create_account(&pool, "alice", "user").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn deduction_records_snapshot_and_usage() {
        let pool = setup().await;
        seed_balance(&pool, 100).await;

        let entry = apply_ledger_entry(&pool, &deduction(40)).await.unwrap();
        assert_eq!(entry.kind, "deduction");
        assert_eq!(entry.amount, 40);
        assert_eq!(entry.balance_after, 60);

        let account = get_account(&pool, "alice").await.unwrap();
        assert_eq!(account.balance, 60);
        assert_eq!(account.usage_count, 1);
        assert!(account.last_active_at.is_some());
    }

    #[tokio::test]
    async fn overdraft_leaves_no_trace() {
        let pool = setup().await;
        seed_balance(&pool, 10).await;

        let err = apply_ledger_entry(&pool, &deduction(40)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientBalance {
                balance: 10,
                required: 40
            }
        ));

        assert_eq!(get_account(&pool, "alice").await.unwrap().balance, 10);
        assert_eq!(list_ledger(&pool, "alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let pool = setup().await;
        let req = EntryRequest {
            account_id: "bob",
            ..deduction(1)
        };
        assert!(matches!(
            apply_ledger_entry(&pool, &req).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ledger_lists_newest_first() {
        let pool = setup().await;
        seed_balance(&pool, 50).await;
        apply_ledger_entry(&pool, &deduction(20)).await.unwrap();

        let entries = list_ledger(&pool, "alice").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "deduction");
        assert_eq!(entries[1].kind, "top_up");
    }

    #[tokio::test]
    async fn saved_collages_trim_to_most_recent_on_read() {
        let pool = setup().await;
        for i in 0..8 {
            assert!(append_collage(&pool, "alice", &format!("https://cdn/{i}.png"))
                .await
                .unwrap());
        }

        let urls = saved_collages(&pool, "alice", 5).await.unwrap();
        let expected: Vec<String> = (3..8).map(|i| format!("https://cdn/{i}.png")).collect();
        assert_eq!(urls, expected);

        // The trim was written back.
        assert_eq!(load_collages(&pool, "alice").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn append_collage_deduplicates() {
        let pool = setup().await;
        assert!(append_collage(&pool, "alice", "https://cdn/a.png").await.unwrap());
        assert!(!append_collage(&pool, "alice", "https://cdn/a.png").await.unwrap());
        assert_eq!(saved_collages(&pool, "alice", 5).await.unwrap().len(), 1);
        assert!(get_account(&pool, "alice").await.unwrap().last_saved_at.is_some());
    }

    #[tokio::test]
    async fn remove_collage_drops_single_url() {
        let pool = setup().await;
        append_collage(&pool, "alice", "a").await.unwrap();
        append_collage(&pool, "alice", "b").await.unwrap();

        assert!(remove_collage(&pool, "alice", "a").await.unwrap());
        assert!(!remove_collage(&pool, "alice", "a").await.unwrap());
        assert_eq!(saved_collages(&pool, "alice", 5).await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn orders_are_replaced_by_id() {
        let pool = setup().await;
        upsert_order(&pool, "alice", "o1", &serde_json::json!({"status": "pending"}))
            .await
            .unwrap();
        upsert_order(&pool, "alice", "o1", &serde_json::json!({"status": "completed"}))
            .await
            .unwrap();

        let orders = list_orders(&pool, "alice").await.unwrap();
        assert_eq!(orders.len(), 1);
        assert!(orders[0].doc.contains("completed"));
    }

    #[tokio::test]
    async fn same_order_id_stays_separate_per_account() {
        let pool = setup().await;
        upsert_order(&pool, "alice", "o1", &serde_json::json!({"item": "alice pass"}))
            .await
            .unwrap();
        upsert_order(&pool, "bob", "o1", &serde_json::json!({"item": "bob pass"}))
            .await
            .unwrap();

        let alice = list_orders(&pool, "alice").await.unwrap();
        let bob = list_orders(&pool, "bob").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert!(alice[0].doc.contains("alice pass"));
        assert_eq!(bob.len(), 1);
        assert!(bob[0].doc.contains("bob pass"));
    }

    #[tokio::test]
    async fn site_status_round_trip() {
        let pool = setup().await;
        assert_eq!(get_site_status(&pool).await.unwrap(), SiteStatus::default());

        let status = SiteStatus {
            maintenance: true,
            scheduled_start_ms: Some(1_700_000_000_000),
            message: Some("patch day".to_string()),
        };
        set_site_status(&pool, &status).await.unwrap();
        assert_eq!(get_site_status(&pool).await.unwrap(), status);
    }
}
