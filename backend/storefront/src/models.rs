//! Records shared by the ledger, collage and history layers.
//!
//! Amounts and balances are whole currency units (`i64`). Timestamps are
//! Unix epoch milliseconds, assigned by the server when a row is written.

use serde::{Deserialize, Serialize};

/// Kind of a balance-history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Manual credit by an administrator.
    Credit,
    /// Spend, e.g. unlocking a collage.
    Deduction,
    /// Wallet top-up confirmed by the payment backend.
    TopUp,
    /// Money returned for a failed order.
    Refund,
}

impl EntryKind {
    /// Parse the stored identifier back into an [`EntryKind`].
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "credit" => Some(Self::Credit),
            "deduction" => Some(Self::Deduction),
            "top_up" => Some(Self::TopUp),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }

    /// Return a short identifier string suitable for storage in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Deduction => "deduction",
            Self::TopUp => "top_up",
            Self::Refund => "refund",
        }
    }

    pub fn is_debit(&self) -> bool {
        matches!(self, Self::Deduction)
    }
}

/// A wallet account as stored in `users`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    pub role: String,
    pub balance: i64,
    /// Number of paid collage unlocks.
    pub usage_count: i64,
    pub last_active_at: Option<i64>,
    pub last_saved_at: Option<i64>,
    pub created_at: i64,
}

impl Account {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// One immutable balance-history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: String,
    pub kind: String,
    pub amount: i64,
    pub reason: String,
    /// Who caused the entry (the account itself, an admin, or a backend).
    pub actor: String,
    /// Balance immediately after this entry was applied.
    pub balance_after: i64,
    pub created_at: i64,
}

/// A catalog item that can be placed on a collage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Skin {
    pub id: String,
    pub name: String,
    pub image_url: String,
    /// Sort key used by the weight sort modes.
    #[serde(default)]
    pub weight: i64,
    /// Categorical grouping key.
    #[serde(default)]
    pub family: String,
}

/// An order document exactly as the payment backend delivered it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOrder {
    pub id: String,
    pub doc: String,
    pub received_at: i64,
}
