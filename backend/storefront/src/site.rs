//! Maintenance switch for the whole storefront.
//!
//! A single row holds a manual `maintenance` flag and an optional scheduled
//! start. Once the scheduled start has passed the site counts as under
//! maintenance even if the flag was never flipped.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SiteStatus {
    pub maintenance: bool,
    /// Epoch millis at which maintenance begins.
    pub scheduled_start_ms: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum Phase {
    Live,
    /// Maintenance is announced but has not started yet.
    Scheduled { starts_in_ms: i64 },
    Maintenance,
}

impl SiteStatus {
    pub fn phase(&self, now_ms: i64) -> Phase {
        if self.maintenance {
            return Phase::Maintenance;
        }
        match self.scheduled_start_ms {
            Some(start) if start <= now_ms => Phase::Maintenance,
            Some(start) => Phase::Scheduled {
                starts_in_ms: start - now_ms,
            },
            None => Phase::Live,
        }
    }

    pub fn in_maintenance(&self, now_ms: i64) -> bool {
        self.phase(now_ms) == Phase::Maintenance
    }
}
