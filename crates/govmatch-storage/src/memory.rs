//! In-memory [`Store`] for tests and offline runs.
//!
//! All collections live behind one `tokio::sync::RwLock`, so every trait
//! method (including bulk upserts and the sync-state compare-and-swap) is
//! atomic with respect to the others.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govmatch_core::{
    Capability, CapabilityUpdate, JobOutcome, MatchRecord, NewCapability, NewMatch, Opportunity,
    OpportunityDraft, SyncState,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{scan_order, OpportunityFilter, Store, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Lease {
    holder: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    opportunities: Vec<Opportunity>,
    by_url: HashMap<String, usize>,
    capabilities: Vec<Capability>,
    matches: Vec<MatchRecord>,
    sync_state: Option<SyncState>,
    leases: HashMap<String, Lease>,
    jobs: Vec<JobOutcome>,
    match_write_failures: HashSet<Uuid>,
}

impl Inner {
    fn upsert(&mut self, draft: &OpportunityDraft, now: DateTime<Utc>) -> Uuid {
        if let Some(&idx) = self.by_url.get(&draft.url) {
            let existing = &mut self.opportunities[idx];
            existing.refresh_from(draft, now);
            return existing.id;
        }
        let id = Uuid::new_v4();
        self.by_url
            .insert(draft.url.clone(), self.opportunities.len());
        self.opportunities
            .push(Opportunity::from_draft(id, draft, now));
        id
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    fail_opportunity_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent opportunity writes fail with [`StoreError::Unavailable`].
    pub fn fail_opportunity_writes(&self, fail: bool) {
        self.fail_opportunity_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_opportunity_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "opportunity writes disabled".into(),
            ));
        }
        Ok(())
    }

    /// Make match inserts for `opportunity_id` fail with [`StoreError::Unavailable`].
    pub async fn fail_match_writes_for(&self, opportunity_id: Uuid) {
        self.inner
            .write()
            .await
            .match_write_failures
            .insert(opportunity_id);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_opportunity(&self, draft: &OpportunityDraft) -> StoreResult<Uuid> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        Ok(inner.upsert(draft, Utc::now()))
    }

    async fn bulk_upsert_opportunities(&self, drafts: &[OpportunityDraft]) -> StoreResult<usize> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        for draft in drafts {
            inner.upsert(draft, now);
        }
        Ok(drafts.len())
    }

    async fn find_opportunity(&self, id: Uuid) -> StoreResult<Option<Opportunity>> {
        let inner = self.inner.read().await;
        Ok(inner.opportunities.iter().find(|o| o.id == id).cloned())
    }

    async fn find_opportunity_by_url(&self, url: &str) -> StoreResult<Option<Opportunity>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_url
            .get(url)
            .map(|&idx| inner.opportunities[idx].clone()))
    }

    async fn scan_opportunities(
        &self,
        filter: &OpportunityFilter,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<Opportunity>> {
        let inner = self.inner.read().await;
        let mut rows = inner
            .opportunities
            .iter()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(scan_order);
        Ok(rows.into_iter().skip(skip).take(limit).collect())
    }

    async fn count_opportunities(&self, filter: &OpportunityFilter) -> StoreResult<u64> {
        let inner = self.inner.read().await;
        Ok(inner.opportunities.iter().filter(|o| filter.matches(o)).count() as u64)
    }

    async fn create_capability(&self, new: &NewCapability) -> StoreResult<Uuid> {
        new.validate()?;
        let mut inner = self.inner.write().await;
        let name = new.name.trim();
        if inner.capabilities.iter().any(|c| c.name == name) {
            return Err(StoreError::Conflict(format!(
                "capability name {name:?} already exists"
            )));
        }
        let id = Uuid::new_v4();
        inner
            .capabilities
            .push(new.clone().into_capability(id, Utc::now()));
        Ok(id)
    }

    async fn update_capability(&self, id: Uuid, update: &CapabilityUpdate) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(idx) = inner.capabilities.iter().position(|c| c.id == id) else {
            return Ok(false);
        };
        let next = update.applied_to(&inner.capabilities[idx], Utc::now())?;
        if inner
            .capabilities
            .iter()
            .any(|c| c.id != id && c.name == next.name)
        {
            return Err(StoreError::Conflict(format!(
                "capability name {:?} already exists",
                next.name
            )));
        }
        inner.capabilities[idx] = next;
        Ok(true)
    }

    async fn find_capability(&self, id: Uuid) -> StoreResult<Option<Capability>> {
        let inner = self.inner.read().await;
        Ok(inner.capabilities.iter().find(|c| c.id == id).cloned())
    }

    async fn list_capabilities(&self, active_only: bool) -> StoreResult<Vec<Capability>> {
        let inner = self.inner.read().await;
        let mut rows = inner
            .capabilities
            .iter()
            .filter(|c| !active_only || c.active)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn insert_match(&self, new: &NewMatch) -> StoreResult<Uuid> {
        let mut inner = self.inner.write().await;
        if inner.match_write_failures.contains(&new.opportunity_id) {
            return Err(StoreError::Unavailable("match writes disabled".into()));
        }
        if !inner.opportunities.iter().any(|o| o.id == new.opportunity_id) {
            return Err(StoreError::NotFound {
                entity: "opportunity",
                id: new.opportunity_id.to_string(),
            });
        }
        if !inner.capabilities.iter().any(|c| c.id == new.capability_id) {
            return Err(StoreError::NotFound {
                entity: "capability",
                id: new.capability_id.to_string(),
            });
        }
        let id = Uuid::new_v4();
        inner.matches.push(MatchRecord::from_new(id, new, Utc::now()));
        Ok(id)
    }

    async fn matches_for_opportunity(&self, opportunity_id: Uuid) -> StoreResult<Vec<MatchRecord>> {
        let inner = self.inner.read().await;
        let mut rows = inner
            .matches
            .iter()
            .filter(|m| m.opportunity_id == opportunity_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.match_percentage.total_cmp(&a.match_percentage));
        Ok(rows)
    }

    async fn high_matches(&self, threshold: f64, limit: usize) -> StoreResult<Vec<MatchRecord>> {
        let inner = self.inner.read().await;
        let mut rows = inner
            .matches
            .iter()
            .enumerate()
            .filter(|(_, m)| m.match_percentage >= threshold)
            .collect::<Vec<_>>();
        // Insertion index breaks created_at ties so "latest" stays well-defined.
        rows.sort_by(|(ia, a), (ib, b)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| ib.cmp(ia))
        });
        let mut seen = HashSet::new();
        Ok(rows
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| seen.insert(m.opportunity_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_matches(&self, min_percentage: Option<f64>) -> StoreResult<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .matches
            .iter()
            .filter(|m| min_percentage.map_or(true, |min| m.match_percentage >= min))
            .count() as u64)
    }

    async fn load_sync_state(&self) -> StoreResult<SyncState> {
        let inner = self.inner.read().await;
        Ok(inner.sync_state.clone().unwrap_or_default())
    }

    async fn save_sync_state(&self, state: &SyncState) -> StoreResult<SyncState> {
        let mut inner = self.inner.write().await;
        let found = inner.sync_state.as_ref().map_or(0, |s| s.version);
        if found != state.version {
            return Err(StoreError::VersionConflict {
                expected: state.version,
                found,
            });
        }
        let mut stored = state.clone();
        stored.version = found + 1;
        inner.sync_state = Some(stored.clone());
        Ok(stored)
    }

    async fn try_acquire_lease(&self, name: &str, holder: Uuid, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        if let Some(lease) = inner.leases.get(name) {
            if lease.holder != holder && lease.expires_at > now {
                return Ok(false);
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        inner.leases.insert(
            name.to_string(),
            Lease {
                holder,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.leases.get(name).is_some_and(|l| l.holder == holder) {
            inner.leases.remove(name);
        }
        Ok(())
    }

    async fn record_job_outcome(&self, outcome: &JobOutcome) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.jobs.push(outcome.clone());
        Ok(())
    }

    async fn job_history(&self, limit: usize) -> StoreResult<Vec<JobOutcome>> {
        let inner = self.inner.read().await;
        let mut rows = inner.jobs.iter().enumerate().collect::<Vec<_>>();
        rows.sort_by(|(ia, a), (ib, b)| b.executed_at.cmp(&a.executed_at).then_with(|| ib.cmp(ia)));
        Ok(rows.into_iter().take(limit).map(|(_, j)| j.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_state_then_update;
    use chrono::TimeZone;
    use govmatch_core::{JobStatus, MatchDetails};

    fn draft(url: &str, title: &str) -> OpportunityDraft {
        OpportunityDraft {
            url: url.to_string(),
            title: title.to_string(),
            agency: Some("GSA".into()),
            naics_code: Some("541512".into()),
            set_aside: None,
            posted_date: None,
            due_date: None,
            description: None,
            category_description: None,
            raw_payload: serde_json::json!({ "title": title }),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn bulk_upsert_is_idempotent_by_url_and_last_write_wins() {
        let store = InMemoryStore::new();
        store
            .bulk_upsert_opportunities(&[draft("https://x/1", "first"), draft("https://x/2", "other")])
            .await
            .unwrap();
        let first_id = store
            .find_opportunity_by_url("https://x/1")
            .await
            .unwrap()
            .unwrap()
            .id;

        store
            .bulk_upsert_opportunities(&[draft("https://x/1", "second")])
            .await
            .unwrap();

        let all = store
            .count_opportunities(&OpportunityFilter::default())
            .await
            .unwrap();
        assert_eq!(all, 2);
        let stored = store.find_opportunity_by_url("https://x/1").await.unwrap().unwrap();
        assert_eq!(stored.id, first_id);
        assert_eq!(stored.title, "second");
    }

    #[tokio::test]
    async fn failing_writes_leave_store_untouched() {
        let store = InMemoryStore::new();
        store.fail_opportunity_writes(true);
        let err = store
            .bulk_upsert_opportunities(&[draft("https://x/1", "first")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.find_opportunity_by_url("https://x/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn capability_names_are_unique() {
        let store = InMemoryStore::new();
        store.create_capability(&NewCapability::named("Cloud")).await.unwrap();
        let err = store
            .create_capability(&NewCapability::named("Cloud"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_capability_reports_missing_ids() {
        let store = InMemoryStore::new();
        let id = store.create_capability(&NewCapability::named("Cloud")).await.unwrap();
        let update = CapabilityUpdate {
            active: Some(false),
            ..Default::default()
        };
        assert!(store.update_capability(id, &update).await.unwrap());
        assert!(!store.update_capability(Uuid::new_v4(), &update).await.unwrap());
        assert!(store.list_capabilities(true).await.unwrap().is_empty());
        assert_eq!(store.list_capabilities(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sync_state_cas_rejects_stale_versions() {
        let store = InMemoryStore::new();
        let first = read_state_then_update(&store, |s| s.total_synced += 3)
            .await
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.total_synced, 3);

        let stale = SyncState::default();
        let err = store.save_sync_state(&stale).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 0, found: 1 }
        ));
        assert_eq!(store.load_sync_state().await.unwrap().total_synced, 3);
    }

    #[tokio::test]
    async fn leases_exclude_other_holders_until_released() {
        let store = InMemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ttl = Duration::from_secs(60);
        assert!(store.try_acquire_lease("sync", a, ttl).await.unwrap());
        assert!(!store.try_acquire_lease("sync", b, ttl).await.unwrap());
        assert!(store.try_acquire_lease("sync", a, ttl).await.unwrap());
        store.release_lease("sync", a).await.unwrap();
        assert!(store.try_acquire_lease("sync", b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_leases_can_be_taken_over() {
        let store = InMemoryStore::new();
        let a = Uuid::new_v4();
        assert!(store
            .try_acquire_lease("sync", a, Duration::from_millis(0))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store
            .try_acquire_lease("sync", Uuid::new_v4(), Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn matches_are_appended_and_high_matches_keep_latest_per_opportunity() {
        let store = InMemoryStore::new();
        let opp_id = store.upsert_opportunity(&draft("https://x/1", "t")).await.unwrap();
        let cap_id = store.create_capability(&NewCapability::named("Cloud")).await.unwrap();
        for pct in [80.0, 90.0] {
            store
                .insert_match(&NewMatch {
                    opportunity_id: opp_id,
                    capability_id: cap_id,
                    match_percentage: pct,
                    match_details: MatchDetails::default(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.matches_for_opportunity(opp_id).await.unwrap().len(), 2);
        let high = store.high_matches(70.0, 10).await.unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].match_percentage, 90.0);
        assert_eq!(store.count_matches(Some(85.0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_match_requires_known_rows() {
        let store = InMemoryStore::new();
        let err = store
            .insert_match(&NewMatch {
                opportunity_id: Uuid::new_v4(),
                capability_id: Uuid::new_v4(),
                match_percentage: 10.0,
                match_details: MatchDetails::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "opportunity", .. }));
    }

    #[tokio::test]
    async fn statistics_and_job_history() {
        let store = InMemoryStore::new();
        store.upsert_opportunity(&draft("https://x/1", "t")).await.unwrap();
        store.create_capability(&NewCapability::named("Cloud")).await.unwrap();
        for status in [JobStatus::Success, JobStatus::Failed] {
            store
                .record_job_outcome(&JobOutcome {
                    id: Uuid::new_v4(),
                    executed_at: Utc::now(),
                    status,
                    result: None,
                    error: None,
                })
                .await
                .unwrap();
        }

        let stats = store.statistics(Utc::now()).await.unwrap();
        assert_eq!(stats.total_opportunities, 1);
        assert_eq!(stats.active_capabilities, 1);
        assert_eq!(stats.recent_opportunities, 0);

        let history = store.job_history(1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Failed);
    }
}
