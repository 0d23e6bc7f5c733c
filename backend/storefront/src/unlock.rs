//! Payment-unlock gate for collages.
//!
//! A collage session moves through
//!
//! ```text
//! Unpaid ──► Debiting ──► Uploading ──► Persisted
//!    ▲           │            │
//!    └───────────┴────────────┘  (any failure)
//! ```
//!
//! Only an `Unpaid` session can start an unlock and only a `Persisted` one
//! can be downloaded. The debit itself is atomic with its ledger row, but a
//! failed render or upload after the debit is not refunded: the session falls
//! back to `Unpaid` and unlocking again charges again. Once confirmed, an
//! unlock runs on its own task and finishes even if the caller goes away.
//!
//! Sessions live in memory. Idle ones expire after the session TTL and each
//! account keeps at most [`MAX_SESSIONS_PER_OWNER`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::assets::AssetStore;
use crate::collage::layout::{self, OUTPUT_SCALE};
use crate::collage::render::{self, Sources};
use crate::collage::{CollageRequest, CompositionPlan};
use crate::db;
use crate::errors::{Result, StoreError};
use crate::feed::{ChangeFeed, Topic};
use crate::ledger::Ledger;
use crate::models::Skin;
use crate::pricing::{self, SelectionWarning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unpaid,
    Debiting,
    Uploading,
    Persisted,
}

#[derive(Debug, Clone)]
struct Session {
    owner: String,
    request: CollageRequest,
    warning: Option<SelectionWarning>,
    state: SessionState,
    asset_url: Option<String>,
    opened_at: Instant,
    /// Open order, for evicting the oldest first.
    seq: u64,
}

impl Session {
    fn in_flight(&self) -> bool {
        matches!(self.state, SessionState::Debiting | SessionState::Uploading)
    }
}

pub const MAX_SESSIONS_PER_OWNER: usize = 20;
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: String,
    pub state: SessionState,
    pub item_count: usize,
    pub price: i64,
    pub warning: Option<SelectionWarning>,
    pub asset_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub item_count: usize,
    pub price: i64,
    pub warning: Option<SelectionWarning>,
}

#[derive(Clone)]
pub struct UnlockGate {
    pool: SqlitePool,
    ledger: Ledger,
    assets: Arc<dyn AssetStore>,
    feed: ChangeFeed,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    next_seq: Arc<AtomicU64>,
    max_items: usize,
    asset_list_cap: usize,
    session_ttl: Duration,
}

impl UnlockGate {
    pub fn new(
        pool: SqlitePool,
        ledger: Ledger,
        assets: Arc<dyn AssetStore>,
        feed: ChangeFeed,
        max_items: usize,
        asset_list_cap: usize,
    ) -> Self {
        Self {
            pool,
            ledger,
            assets,
            feed,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
            max_items,
            asset_list_cap,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Price of a selection after applying the item cap.
    pub fn quote(&self, request: &CollageRequest) -> Quote {
        let selection = pricing::cap_selection(request.items.clone(), self.max_items);
        Quote {
            item_count: selection.ids.len(),
            price: pricing::price_for(selection.ids.len()),
            warning: selection.warning,
        }
    }

    pub async fn open(&self, caller: Option<&str>, request: CollageRequest) -> Result<SessionView> {
        let owner = caller.ok_or(StoreError::NotAuthenticated)?;
        db::get_account(&self.pool, owner).await?;
        let (request, warning) = self.prepare(request).await?;

        let id = hex::encode(rand::random::<[u8; 16]>());
        let session = Session {
            owner: owner.to_string(),
            request,
            warning,
            state: SessionState::Unpaid,
            asset_url: None,
            opened_at: Instant::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let view = view_of(&id, &session);
        let mut sessions = self.sessions.lock().await;
        evict(&mut sessions, owner, self.session_ttl);
        sessions.insert(id.clone(), session);
        drop(sessions);
        info!("Collage session {id} opened by {owner}");
        Ok(view)
    }

    /// Replace the selection of a session that has not been paid for yet.
    pub async fn update(
        &self,
        caller: Option<&str>,
        session_id: &str,
        request: CollageRequest,
    ) -> Result<SessionView> {
        let owner = caller.ok_or(StoreError::NotAuthenticated)?;
        let (request, warning) = self.prepare(request).await?;

        let mut sessions = self.sessions.lock().await;
        let session = owned_session(&mut sessions, session_id, owner)?;
        if session.state != SessionState::Unpaid {
            return Err(StoreError::Conflict(format!(
                "session {session_id} can no longer be edited"
            )));
        }
        session.request = request;
        session.warning = warning;
        Ok(view_of(session_id, session))
    }

    pub async fn view(&self, caller: Option<&str>, session_id: &str) -> Result<SessionView> {
        let owner = caller.ok_or(StoreError::NotAuthenticated)?;
        let mut sessions = self.sessions.lock().await;
        let session = owned_session(&mut sessions, session_id, owner)?;
        Ok(view_of(session_id, session))
    }

    /// Blurred, display-resolution PNG of the current selection.
    pub async fn preview(&self, caller: Option<&str>, session_id: &str) -> Result<Vec<u8>> {
        let owner = caller.ok_or(StoreError::NotAuthenticated)?;
        let request = {
            let mut sessions = self.sessions.lock().await;
            owned_session(&mut sessions, session_id, owner)?.request.clone()
        };

        let plan = self.plan(&request, 1).await?;
        let sources = render::load_sources(self.assets.as_ref(), &plan).await?;
        let filter = request.layout.filter;
        tokio::task::spawn_blocking(move || {
            render::render_preview(&plan, &sources, filter).and_then(|img| render::encode_png(&img))
        })
        .await
        .map_err(|e| StoreError::Validation(format!("preview render aborted: {e}")))?
    }

    /// Charge the account, render the collage and save it.
    ///
    /// `confirmed_price` is what the customer agreed to; it must match the
    /// price of the session's current selection.
    pub async fn unlock(
        &self,
        caller: Option<&str>,
        session_id: &str,
        confirmed_price: i64,
    ) -> Result<SessionView> {
        let owner = caller.ok_or(StoreError::NotAuthenticated)?;

        if db::get_site_status(&self.pool)
            .await?
            .in_maintenance(db::now_millis())
        {
            return Err(StoreError::Maintenance);
        }

        let (request, price) = {
            let mut sessions = self.sessions.lock().await;
            let session = owned_session(&mut sessions, session_id, owner)?;
            match session.state {
                SessionState::Unpaid => {}
                SessionState::Persisted => {
                    return Err(StoreError::Conflict(format!(
                        "session {session_id} is already unlocked"
                    )))
                }
                SessionState::Debiting | SessionState::Uploading => {
                    return Err(StoreError::Conflict(format!(
                        "session {session_id} is being unlocked"
                    )))
                }
            }

            let price = pricing::price_for(session.request.items.len());
            if price != confirmed_price {
                return Err(StoreError::Validation(format!(
                    "price is {price}, confirmation was for {confirmed_price}"
                )));
            }
            session.state = SessionState::Debiting;
            (session.request.clone(), price)
        };

        let gate = self.clone();
        let session_id = session_id.to_string();
        let owner = owner.to_string();
        tokio::spawn(async move { gate.finish_unlock(&session_id, &owner, &request, price).await })
            .await
            .map_err(|e| StoreError::UploadFailed(format!("unlock aborted: {e}")))?
    }

    /// PNG bytes of an unlocked collage.
    pub async fn download(&self, caller: Option<&str>, session_id: &str) -> Result<Vec<u8>> {
        let owner = caller.ok_or(StoreError::NotAuthenticated)?;
        let url = {
            let mut sessions = self.sessions.lock().await;
            let session = owned_session(&mut sessions, session_id, owner)?;
            match (&session.state, &session.asset_url) {
                (SessionState::Persisted, Some(url)) => url.clone(),
                _ => return Err(StoreError::NotUnlocked),
            }
        };
        self.assets.fetch(&url).await
    }

    /// Saved collage URLs, most recent first.
    pub async fn saved_collages(&self, account_id: &str) -> Result<Vec<String>> {
        let mut urls = db::saved_collages(&self.pool, account_id, self.asset_list_cap).await?;
        urls.reverse();
        Ok(urls)
    }

    pub async fn remove_collage(&self, account_id: &str, url: &str) -> Result<bool> {
        let removed = db::remove_collage(&self.pool, account_id, url).await?;
        if removed {
            self.feed.publish(Topic::Collages(account_id.to_string()));
        }
        Ok(removed)
    }

    async fn finish_unlock(
        &self,
        session_id: &str,
        owner: &str,
        request: &CollageRequest,
        price: i64,
    ) -> Result<SessionView> {
        match self.run_unlock(session_id, owner, request, price).await {
            Ok(url) => {
                let mut sessions = self.sessions.lock().await;
                let session = owned_session(&mut sessions, session_id, owner)?;
                session.state = SessionState::Persisted;
                session.asset_url = Some(url);
                info!("Collage session {session_id} unlocked for {price}");
                Ok(view_of(session_id, session))
            }
            Err(e) => {
                error!("Unlocking collage session {session_id} failed: {e}");
                self.set_state(session_id, SessionState::Unpaid).await;
                Err(e)
            }
        }
    }

    async fn run_unlock(
        &self,
        session_id: &str,
        owner: &str,
        request: &CollageRequest,
        price: i64,
    ) -> Result<String> {
        // Decode everything first so a broken source never gets charged for.
        let plan = self.plan(request, OUTPUT_SCALE).await?;
        let sources = render::load_sources(self.assets.as_ref(), &plan).await?;

        self.ledger.charge_collage(owner, price).await?;
        self.set_state(session_id, SessionState::Uploading).await;

        let png = render_final(plan, sources, request.layout.filter).await?;
        let url = self
            .assets
            .upload(png, &format!("collage-{session_id}.png"))
            .await
            .map_err(|e| match e {
                StoreError::UploadFailed(_) => e,
                other => StoreError::UploadFailed(other.to_string()),
            })?;

        db::append_collage(&self.pool, owner, &url)
            .await
            .map_err(|e| StoreError::PersistFailed(e.to_string()))?;
        self.feed.publish(Topic::Collages(owner.to_string()));
        Ok(url)
    }

    async fn prepare(
        &self,
        request: CollageRequest,
    ) -> Result<(CollageRequest, Option<SelectionWarning>)> {
        request.layout.validate()?;
        let selection = pricing::cap_selection(request.items, self.max_items);
        if selection.ids.is_empty() {
            return Err(StoreError::Validation(
                "select at least one item".to_string(),
            ));
        }
        let request = CollageRequest {
            items: selection.ids,
            layout: request.layout,
        };
        // Resolves every id and checks the canvas fits before anything is charged.
        self.plan(&request, OUTPUT_SCALE).await?;
        Ok((request, selection.warning))
    }

    async fn plan(&self, request: &CollageRequest, scale: u32) -> Result<CompositionPlan> {
        let catalog: HashMap<String, Skin> = db::list_skins(&self.pool)
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let skins = request
            .items
            .iter()
            .map(|id| catalog_item(&catalog, id).cloned())
            .collect::<Result<Vec<_>>>()?;
        let hero = request
            .layout
            .hero
            .as_deref()
            .map(|id| catalog_item(&catalog, id))
            .transpose()?;

        let ordered = layout::order_items(&skins, request.layout.sort, request.layout.group_by_family);
        layout::plan(&ordered, hero, &request.layout, scale)
    }

    async fn set_state(&self, session_id: &str, state: SessionState) {
        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.state = state;
        }
    }
}

async fn render_final(
    plan: CompositionPlan,
    sources: Sources,
    filter: crate::collage::VisualFilter,
) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        render::render(&plan, &sources, filter).and_then(|img| render::encode_png(&img))
    })
    .await
    .map_err(|e| StoreError::UploadFailed(format!("render aborted: {e}")))?
    .map_err(|e| StoreError::UploadFailed(format!("render failed: {e}")))
}

fn catalog_item<'a>(catalog: &'a HashMap<String, Skin>, id: &str) -> Result<&'a Skin> {
    catalog
        .get(id)
        .ok_or_else(|| StoreError::Validation(format!("unknown item {id}")))
}

/// Drop expired sessions, then the owner's oldest beyond the per-owner cap so
/// one more fits. Sessions with an unlock in flight are never dropped.
fn evict(sessions: &mut HashMap<String, Session>, owner: &str, ttl: Duration) {
    sessions.retain(|_, s| s.in_flight() || s.opened_at.elapsed() < ttl);

    let mut idle: Vec<(u64, String)> = sessions
        .iter()
        .filter(|(_, s)| s.owner == owner && !s.in_flight())
        .map(|(id, s)| (s.seq, id.clone()))
        .collect();
    if idle.len() < MAX_SESSIONS_PER_OWNER {
        return;
    }
    idle.sort();
    let excess = idle.len() + 1 - MAX_SESSIONS_PER_OWNER;
    for (_, id) in idle.into_iter().take(excess) {
        sessions.remove(&id);
    }
}

/// Sessions of other accounts look like missing ones.
fn owned_session<'a>(
    sessions: &'a mut HashMap<String, Session>,
    session_id: &str,
    owner: &str,
) -> Result<&'a mut Session> {
    sessions
        .get_mut(session_id)
        .filter(|s| s.owner == owner)
        .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
}

fn view_of(id: &str, session: &Session) -> SessionView {
    SessionView {
        id: id.to_string(),
        state: session.state,
        item_count: session.request.items.len(),
        price: pricing::price_for(session.request.items.len()),
        warning: session.warning.clone(),
        asset_url: session.asset_url.clone(),
    }
}
