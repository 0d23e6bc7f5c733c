//! Wallet ledger: the only way balances change.
//!
//! Every mutation pairs the balance update with its balance-history row
//! inside one database transaction (see [`db::apply_ledger_entry`]) and then
//! notifies live history views through the [`ChangeFeed`].

use sqlx::SqlitePool;
use tracing::info;

use crate::db::{self, EntryRequest};
use crate::errors::{Result, StoreError};
use crate::feed::{ChangeFeed, Subscription, Topic};
use crate::models::{EntryKind, LedgerEntry};

#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
    feed: ChangeFeed,
}

impl Ledger {
    pub fn new(pool: SqlitePool, feed: ChangeFeed) -> Self {
        Self { pool, feed }
    }

    pub async fn balance(&self, account_id: &str) -> Result<i64> {
        Ok(db::get_account(&self.pool, account_id).await?.balance)
    }

    pub async fn debit(
        &self,
        account_id: &str,
        amount: i64,
        reason: &str,
        actor: &str,
    ) -> Result<LedgerEntry> {
        self.apply(account_id, EntryKind::Deduction, amount, reason, actor, false)
            .await
    }

    pub async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        reason: &str,
        actor: &str,
    ) -> Result<LedgerEntry> {
        self.apply(account_id, EntryKind::Credit, amount, reason, actor, false)
            .await
    }

    pub async fn top_up(
        &self,
        account_id: &str,
        amount: i64,
        reason: &str,
        actor: &str,
    ) -> Result<LedgerEntry> {
        self.apply(account_id, EntryKind::TopUp, amount, reason, actor, false)
            .await
    }

    pub async fn refund(
        &self,
        account_id: &str,
        amount: i64,
        reason: &str,
        actor: &str,
    ) -> Result<LedgerEntry> {
        self.apply(account_id, EntryKind::Refund, amount, reason, actor, false)
            .await
    }

    /// Debit the price of a collage unlock and count the usage.
    pub async fn charge_collage(&self, account_id: &str, price: i64) -> Result<LedgerEntry> {
        self.apply(
            account_id,
            EntryKind::Deduction,
            price,
            "collage unlock",
            account_id,
            true,
        )
        .await
    }

    /// Dispatch on a kind chosen at runtime (admin adjustments).
    pub async fn record(
        &self,
        account_id: &str,
        kind: EntryKind,
        amount: i64,
        reason: &str,
        actor: &str,
    ) -> Result<LedgerEntry> {
        self.apply(account_id, kind, amount, reason, actor, false)
            .await
    }

    pub async fn entries(&self, account_id: &str) -> Result<Vec<LedgerEntry>> {
        db::list_ledger(&self.pool, account_id).await
    }

    /// Live history of one account, newest entry first.
    pub fn history(&self, account_id: &str) -> HistoryStream {
        HistoryStream {
            ledger: self.clone(),
            account_id: account_id.to_string(),
            sub: self.feed.subscribe(Topic::Ledger(account_id.to_string())),
        }
    }

    async fn apply(
        &self,
        account_id: &str,
        kind: EntryKind,
        amount: i64,
        reason: &str,
        actor: &str,
        bump_usage: bool,
    ) -> Result<LedgerEntry> {
        if amount <= 0 {
            return Err(StoreError::Validation(format!(
                "amount must be positive, got {amount}"
            )));
        }

        let entry = db::apply_ledger_entry(
            &self.pool,
            &EntryRequest {
                account_id,
                kind,
                amount,
                reason,
                actor,
                bump_usage,
            },
        )
        .await?;

        info!(
            "Ledger {} {} {} for {} → balance {}",
            entry.id,
            kind.as_str(),
            amount,
            account_id,
            entry.balance_after
        );
        self.feed.publish(Topic::Ledger(account_id.to_string()));
        Ok(entry)
    }
}

/// Snapshots of an account's balance history, re-read on every change.
#[derive(Debug)]
pub struct HistoryStream {
    ledger: Ledger,
    account_id: String,
    sub: Subscription,
}

impl HistoryStream {
    /// Next snapshot, or `None` once the stream has been released.
    pub async fn next(&mut self) -> Option<Result<Vec<LedgerEntry>>> {
        if !self.sub.next_change().await {
            return None;
        }
        Some(self.ledger.entries(&self.account_id).await)
    }

    pub fn restart(&mut self) {
        self.sub.restart();
    }

    pub fn subscription(&self) -> &Subscription {
        &self.sub
    }
}
