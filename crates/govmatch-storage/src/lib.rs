//! Opportunity store contract plus in-memory and Postgres backends.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use govmatch_core::{
    Capability, CapabilityUpdate, JobOutcome, MatchRecord, NewCapability, NewMatch, Opportunity,
    OpportunityDraft, Statistics, SyncState, ValidationError, HIGH_MATCH_THRESHOLD,
};
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "govmatch-storage";

pub const SYNC_LEASE: &str = "sync";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("sync state version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filter for opportunity scans and counts. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpportunityFilter {
    pub naics_code: Option<String>,
    pub agency_contains: Option<String>,
    pub set_aside: Option<String>,
    pub posted_since: Option<NaiveDate>,
}

impl OpportunityFilter {
    pub fn matches(&self, opp: &Opportunity) -> bool {
        if let Some(code) = &self.naics_code {
            if opp.naics_code.as_deref() != Some(code.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.agency_contains {
            let needle = needle.to_lowercase();
            match &opp.agency {
                Some(agency) if agency.to_lowercase().contains(&needle) => {}
                _ => return false,
            }
        }
        if let Some(set_aside) = &self.set_aside {
            if opp.set_aside.as_deref() != Some(set_aside.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.posted_since {
            match opp.posted_date {
                Some(posted) if posted >= since => {}
                _ => return false,
            }
        }
        true
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_opportunity(&self, draft: &OpportunityDraft) -> StoreResult<Uuid>;

    async fn bulk_upsert_opportunities(&self, drafts: &[OpportunityDraft]) -> StoreResult<usize>;

    async fn find_opportunity(&self, id: Uuid) -> StoreResult<Option<Opportunity>>;

    async fn find_opportunity_by_url(&self, url: &str) -> StoreResult<Option<Opportunity>>;

    async fn scan_opportunities(
        &self,
        filter: &OpportunityFilter,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<Opportunity>>;

    async fn count_opportunities(&self, filter: &OpportunityFilter) -> StoreResult<u64>;

    async fn create_capability(&self, new: &NewCapability) -> StoreResult<Uuid>;

    async fn update_capability(&self, id: Uuid, update: &CapabilityUpdate) -> StoreResult<bool>;

    async fn find_capability(&self, id: Uuid) -> StoreResult<Option<Capability>>;

    async fn list_capabilities(&self, active_only: bool) -> StoreResult<Vec<Capability>>;

    async fn insert_match(&self, new: &NewMatch) -> StoreResult<Uuid>;

    async fn matches_for_opportunity(&self, opportunity_id: Uuid) -> StoreResult<Vec<MatchRecord>>;

    async fn high_matches(&self, threshold: f64, limit: usize) -> StoreResult<Vec<MatchRecord>>;

    async fn count_matches(&self, min_percentage: Option<f64>) -> StoreResult<u64>;

    async fn load_sync_state(&self) -> StoreResult<SyncState>;

    /// Compare-and-swap on `state.version`; the returned state carries the bumped version.
    async fn save_sync_state(&self, state: &SyncState) -> StoreResult<SyncState>;

    async fn try_acquire_lease(&self, name: &str, holder: Uuid, ttl: Duration) -> StoreResult<bool>;

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()>;

    async fn record_job_outcome(&self, outcome: &JobOutcome) -> StoreResult<()>;

    async fn job_history(&self, limit: usize) -> StoreResult<Vec<JobOutcome>>;

    async fn statistics(&self, now: DateTime<Utc>) -> StoreResult<Statistics> {
        let all = OpportunityFilter::default();
        let today = OpportunityFilter {
            posted_since: Some(now.date_naive()),
            ..Default::default()
        };
        Ok(Statistics {
            total_opportunities: self.count_opportunities(&all).await?,
            total_capabilities: self.list_capabilities(false).await?.len() as u64,
            active_capabilities: self.list_capabilities(true).await?.len() as u64,
            total_matches: self.count_matches(None).await?,
            high_matches: self.count_matches(Some(HIGH_MATCH_THRESHOLD)).await?,
            recent_opportunities: self.count_opportunities(&today).await?,
        })
    }
}

/// Load, mutate and save the sync cursor guarded by the version that was read.
pub async fn read_state_then_update<F>(store: &dyn Store, mutate: F) -> StoreResult<SyncState>
where
    F: FnOnce(&mut SyncState) + Send,
{
    let current = store.load_sync_state().await?;
    let mut next = current.clone();
    mutate(&mut next);
    next.version = current.version;
    store.save_sync_state(&next).await
}

// Posted date descending (undated last), then newest first.
pub(crate) fn scan_order(a: &Opportunity, b: &Opportunity) -> std::cmp::Ordering {
    b.posted_date
        .cmp(&a.posted_date)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}
