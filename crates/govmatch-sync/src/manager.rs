use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use govmatch_adapters::SourceClient;
use govmatch_core::{CategoryCode, OpportunityDraft};
use govmatch_storage::{read_state_then_update, OpportunityFilter, Store};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::clock::{Clock, Sleeper, StopSignal, SystemClock, TokioSleeper};
use crate::config::{CategoryRegistry, ThrottleConfig};
use crate::SyncError;

/// Lookback used when no cursor has been recorded yet.
pub const INITIAL_LOOKBACK_DAYS: i64 = 30;

/// Per-code page cap of a full run, as a multiple of the batch size.
pub const FULL_SYNC_BATCH_CAP: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalSyncReport {
    pub run_id: Uuid,
    pub new_opportunities: usize,
    pub from_date: DateTime<Utc>,
    pub to_date: DateTime<Utc>,
    pub total_synced: u64,
    pub failed_categories: Vec<String>,
    pub stopped_early: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySyncCount {
    pub code: String,
    pub records: usize,
    pub pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSyncReport {
    pub run_id: Uuid,
    /// Records upserted by this run, overlap with earlier runs included.
    pub upserted: usize,
    pub per_category: Vec<CategorySyncCount>,
    pub from_date: DateTime<Utc>,
    pub to_date: DateTime<Utc>,
    pub total_synced: u64,
    pub failed_categories: Vec<String>,
    pub stopped_early: bool,
}

pub struct SyncManager {
    store: Arc<dyn Store>,
    source: Arc<dyn SourceClient>,
    categories: Vec<CategoryCode>,
    throttle: ThrottleConfig,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    stop: StopSignal,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn SourceClient>,
        registry: CategoryRegistry,
    ) -> Self {
        Self {
            store,
            source,
            categories: registry.categories,
            throttle: ThrottleConfig::default(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
            stop: StopSignal::new(),
        }
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn categories(&self) -> &[CategoryCode] {
        &self.categories
    }

    /// Fetch notices posted since the cursor, keep the ones whose url is not
    /// stored yet and advance the cursor when anything new was found.
    pub async fn incremental_sync(
        &self,
        max_opportunities: usize,
    ) -> Result<IncrementalSyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, mode = "incremental");
        self.incremental_inner(run_id, max_opportunities)
            .instrument(span)
            .await
    }

    async fn incremental_inner(
        &self,
        run_id: Uuid,
        max_opportunities: usize,
    ) -> Result<IncrementalSyncReport, SyncError> {
        if self.categories.is_empty() {
            return Err(SyncError::Validation("no category codes configured".into()));
        }
        let per_code = max_opportunities / self.categories.len();
        if per_code == 0 {
            return Err(SyncError::Validation(format!(
                "max_opportunities {max_opportunities} is less than one per category code ({})",
                self.categories.len()
            )));
        }

        let state = self.store.load_sync_state().await?;
        let to = self.clock.now();
        let from = match state.last_sync_date {
            Some(last) => last + ChronoDuration::days(1),
            None => to - ChronoDuration::days(INITIAL_LOOKBACK_DAYS),
        };
        info!(%from, %to, per_code, "starting incremental sync");

        let mut seen = HashSet::new();
        let mut new_records: Vec<OpportunityDraft> = Vec::new();
        let mut failed_categories = Vec::new();
        let mut stopped_early = false;

        for category in &self.categories {
            if self.stop.is_stopped() {
                warn!(next_code = %category.code, "stop requested; ending run early");
                stopped_early = true;
                break;
            }

            match self.source.search(&category.code, from, to, per_code, 0).await {
                Ok(drafts) => {
                    let fetched = drafts.len();
                    let before = new_records.len();
                    for mut draft in drafts {
                        if !seen.insert(draft.url.clone()) {
                            continue;
                        }
                        if self.store.find_opportunity_by_url(&draft.url).await?.is_some() {
                            continue;
                        }
                        tag_category(&mut draft, category);
                        new_records.push(draft);
                    }
                    info!(
                        code = %category.code,
                        fetched,
                        new = new_records.len() - before,
                        "fetched category"
                    );
                }
                Err(err) => {
                    warn!(code = %category.code, error = %err, "category fetch failed");
                    failed_categories.push(category.code.clone());
                }
            }

            self.sleeper.sleep(self.throttle.incremental).await;
        }

        let new_count = new_records.len();
        let total_synced = if new_records.is_empty() {
            info!("no new opportunities found");
            state.total_synced
        } else {
            let written = self.store.bulk_upsert_opportunities(&new_records).await?;
            let finished_at = self.clock.now();
            let saved = read_state_then_update(self.store.as_ref(), |s| {
                if !stopped_early {
                    s.advance_cursor(to);
                }
                s.total_synced += new_count as u64;
                s.last_sync_timestamp = Some(finished_at);
            })
            .await?;
            info!(written, total_synced = saved.total_synced, "stored new opportunities");
            saved.total_synced
        };

        Ok(IncrementalSyncReport {
            run_id,
            new_opportunities: new_count,
            from_date: from,
            to_date: to,
            total_synced,
            failed_categories,
            stopped_early,
        })
    }

    /// Page through every category code over the last `days_back` days and
    /// upsert everything returned.
    pub async fn full_sync(
        &self,
        days_back: u32,
        batch_size: usize,
    ) -> Result<FullSyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, mode = "full");
        self.full_inner(run_id, days_back, batch_size)
            .instrument(span)
            .await
    }

    async fn full_inner(
        &self,
        run_id: Uuid,
        days_back: u32,
        batch_size: usize,
    ) -> Result<FullSyncReport, SyncError> {
        if self.categories.is_empty() {
            return Err(SyncError::Validation("no category codes configured".into()));
        }
        if batch_size == 0 {
            return Err(SyncError::Validation("batch_size must be positive".into()));
        }

        let to = self.clock.now();
        let from = ChronoDuration::try_days(i64::from(days_back))
            .and_then(|back| to.checked_sub_signed(back))
            .ok_or_else(|| {
                SyncError::Validation(format!("days_back {days_back} reaches past the calendar"))
            })?;
        let cap = batch_size.saturating_mul(FULL_SYNC_BATCH_CAP);
        info!(%from, %to, batch_size, "starting full sync");

        let mut per_category = Vec::with_capacity(self.categories.len());
        let mut failed_categories = Vec::new();
        let mut stopped_early = false;

        for category in &self.categories {
            if self.stop.is_stopped() {
                warn!(next_code = %category.code, "stop requested; ending run early");
                stopped_early = true;
                break;
            }

            let mut count = CategorySyncCount {
                code: category.code.clone(),
                records: 0,
                pages: 0,
            };
            let mut offset = 0;
            loop {
                let page = match self
                    .source
                    .search(&category.code, from, to, batch_size, offset)
                    .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(code = %category.code, offset, error = %err, "page fetch failed");
                        failed_categories.push(category.code.clone());
                        break;
                    }
                };
                if page.is_empty() {
                    break;
                }

                let mut page = page;
                for draft in &mut page {
                    tag_category(draft, category);
                }
                count.records += self.store.bulk_upsert_opportunities(&page).await?;
                count.pages += 1;
                offset += batch_size;

                self.sleeper.sleep(self.throttle.full_batch).await;

                if count.records >= cap {
                    info!(code = %category.code, records = count.records, "reached per-code cap");
                    break;
                }
            }
            info!(code = %category.code, records = count.records, pages = count.pages, "category done");
            per_category.push(count);
        }

        let upserted = per_category.iter().map(|c| c.records).sum();
        let stored = self
            .store
            .count_opportunities(&OpportunityFilter::default())
            .await?;
        let finished_at = self.clock.now();
        let saved = read_state_then_update(self.store.as_ref(), |s| {
            if !stopped_early {
                s.advance_cursor(to);
            }
            s.total_synced = stored;
            s.last_sync_timestamp = Some(finished_at);
        })
        .await?;

        Ok(FullSyncReport {
            run_id,
            upserted,
            per_category,
            from_date: from,
            to_date: to,
            total_synced: saved.total_synced,
            failed_categories,
            stopped_early,
        })
    }
}

fn tag_category(draft: &mut OpportunityDraft, category: &CategoryCode) {
    if draft.category_description.is_none() && !category.description.is_empty() {
        draft.category_description = Some(category.description.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use govmatch_core::{NewCapability, SyncState};
    use govmatch_matcher::CapabilityMatcher;
    use govmatch_storage::{InMemoryStore, StoreError};

    use crate::testing::{draft, drafts, now, registry, FixedClock, RecordingSleeper, ScriptedSource};

    struct Harness {
        store: Arc<InMemoryStore>,
        source: Arc<ScriptedSource>,
        sleeper: Arc<RecordingSleeper>,
        manager: SyncManager,
    }

    fn harness(codes: &[&str], source: ScriptedSource) -> Harness {
        harness_with_store(Arc::new(InMemoryStore::new()), codes, source)
    }

    fn harness_with_store(
        store: Arc<InMemoryStore>,
        codes: &[&str],
        source: ScriptedSource,
    ) -> Harness {
        let source = Arc::new(source);
        let sleeper = Arc::new(RecordingSleeper::default());
        let manager = SyncManager::new(store.clone(), source.clone(), registry(codes))
            .with_sleeper(sleeper.clone())
            .with_clock(Arc::new(FixedClock(now())));
        Harness {
            store,
            source,
            sleeper,
            manager,
        }
    }

    async fn set_cursor(store: &InMemoryStore, last: DateTime<Utc>, total: u64) {
        store
            .save_sync_state(&SyncState {
                last_sync_date: Some(last),
                total_synced: total,
                last_sync_timestamp: Some(last),
                version: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_run_looks_back_thirty_days_and_sets_cursor() {
        let h = harness(&["541512"], ScriptedSource::default().with("541512", drafts("a", 3)));

        let report = h.manager.incremental_sync(90).await.unwrap();
        assert_eq!(report.new_opportunities, 3);
        assert_eq!(report.from_date, now() - ChronoDuration::days(30));
        assert_eq!(report.to_date, now());
        assert_eq!(report.total_synced, 3);

        let state = h.store.load_sync_state().await.unwrap();
        assert_eq!(state.last_sync_date, Some(now()));
        assert_eq!(state.last_sync_timestamp, Some(now()));
        assert_eq!(state.total_synced, 3);

        let stored = h
            .store
            .find_opportunity_by_url("https://x/a/0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.category_description.as_deref(), Some("Category 541512"));
    }

    #[tokio::test]
    async fn later_runs_start_the_day_after_the_cursor() {
        let store = Arc::new(InMemoryStore::new());
        let last = now() - ChronoDuration::days(5);
        set_cursor(&store, last, 10).await;
        let h = harness_with_store(store, &["541512"], ScriptedSource::default());

        let report = h.manager.incremental_sync(90).await.unwrap();
        assert_eq!(report.from_date, last + ChronoDuration::days(1));
        assert_eq!(report.total_synced, 10);
    }

    #[tokio::test]
    async fn known_urls_do_not_grow_total_synced() {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_opportunity(&draft("https://x/1", "Old", "541512"))
            .await
            .unwrap();
        set_cursor(&store, now() - ChronoDuration::days(2), 1).await;
        let source = ScriptedSource::default().with(
            "541512",
            vec![draft("https://x/1", "Old", "541512"), draft("https://x/2", "New", "541512")],
        );
        let h = harness_with_store(store, &["541512"], source);

        let report = h.manager.incremental_sync(90).await.unwrap();
        assert_eq!(report.new_opportunities, 1);
        assert_eq!(report.total_synced, 2);
    }

    #[tokio::test]
    async fn rerun_of_same_results_adds_nothing_and_keeps_state() {
        let h = harness(&["541512"], ScriptedSource::default().with("541512", drafts("a", 2)));
        h.manager.incremental_sync(90).await.unwrap();
        let before = h.store.load_sync_state().await.unwrap();

        let report = h.manager.incremental_sync(90).await.unwrap();
        assert_eq!(report.new_opportunities, 0);
        assert_eq!(h.store.load_sync_state().await.unwrap(), before);
    }

    #[tokio::test]
    async fn url_seen_under_two_codes_counts_once() {
        let shared = draft("https://x/shared", "Shared", "541512");
        let source = ScriptedSource::default()
            .with("541511", vec![shared.clone()])
            .with("541512", vec![shared]);
        let h = harness(&["541511", "541512"], source);

        let report = h.manager.incremental_sync(90).await.unwrap();
        assert_eq!(report.new_opportunities, 1);
        assert_eq!(h.store.load_sync_state().await.unwrap().total_synced, 1);
    }

    #[tokio::test]
    async fn budget_is_split_evenly_with_one_request_per_code() {
        let h = harness(&["a", "b"], ScriptedSource::default());
        h.manager.incremental_sync(5).await.unwrap();
        assert_eq!(
            h.source.calls(),
            vec![("a".to_string(), 2, 0), ("b".to_string(), 2, 0)]
        );
    }

    #[tokio::test]
    async fn budget_below_code_count_is_rejected() {
        let h = harness(&["a", "b", "c"], ScriptedSource::default());
        let err = h.manager.incremental_sync(2).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(h.source.calls().is_empty());
    }

    #[tokio::test]
    async fn sleeps_once_per_code_even_when_a_fetch_fails() {
        let source = ScriptedSource::default()
            .with("a", drafts("a", 1))
            .failing("b")
            .with("c", drafts("c", 1));
        let h = harness(&["a", "b", "c"], source);

        let report = h.manager.incremental_sync(90).await.unwrap();
        assert_eq!(h.sleeper.sleeps(), vec![Duration::from_secs(2); 3]);
        assert_eq!(report.failed_categories, vec!["b".to_string()]);
        assert_eq!(report.new_opportunities, 2);
    }

    #[tokio::test]
    async fn store_failure_aborts_without_moving_cursor() {
        let store = Arc::new(InMemoryStore::new());
        let last = now() - ChronoDuration::days(3);
        set_cursor(&store, last, 4).await;
        store.fail_opportunity_writes(true);
        let h = harness_with_store(
            store,
            &["541512"],
            ScriptedSource::default().with("541512", drafts("a", 2)),
        );

        let err = h.manager.incremental_sync(90).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Unavailable(_))));
        let state = h.store.load_sync_state().await.unwrap();
        assert_eq!(state.last_sync_date, Some(last));
        assert_eq!(state.total_synced, 4);
    }

    #[tokio::test]
    async fn cursor_and_total_never_decrease() {
        let store = Arc::new(InMemoryStore::new());
        let future = now() + ChronoDuration::days(10);
        set_cursor(&store, future, 7).await;
        let h = harness_with_store(
            store,
            &["541512"],
            ScriptedSource::default().with("541512", drafts("a", 1)),
        );

        h.manager.incremental_sync(90).await.unwrap();
        let state = h.store.load_sync_state().await.unwrap();
        assert_eq!(state.last_sync_date, Some(future));
        assert_eq!(state.total_synced, 8);
    }

    #[tokio::test]
    async fn stop_keeps_fetched_records_but_not_the_window() {
        let stop = StopSignal::new();
        let source = ScriptedSource {
            stop_on_first_call: Some(stop.clone()),
            ..ScriptedSource::default()
        }
        .with("a", drafts("a", 2))
        .with("b", drafts("b", 2));
        let h = harness(&["a", "b"], source);
        let manager = h.manager.with_stop_signal(stop);

        let report = manager.incremental_sync(90).await.unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.new_opportunities, 2);
        assert_eq!(h.source.calls().len(), 1);

        let state = h.store.load_sync_state().await.unwrap();
        assert_eq!(state.last_sync_date, None);
        assert_eq!(state.total_synced, 2);
    }

    #[tokio::test]
    async fn full_sync_pages_until_empty_with_batch_throttle() {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_opportunity(&draft("https://x/a/0", "Old title", "a"))
            .await
            .unwrap();
        let h = harness_with_store(
            store,
            &["a"],
            ScriptedSource::default().with("a", drafts("a", 5)),
        );

        let report = h.manager.full_sync(7, 2).await.unwrap();
        assert_eq!(
            h.source.calls(),
            vec![
                ("a".to_string(), 2, 0),
                ("a".to_string(), 2, 2),
                ("a".to_string(), 2, 4),
                ("a".to_string(), 2, 6),
            ]
        );
        assert_eq!(h.sleeper.sleeps(), vec![Duration::from_secs(3); 3]);
        assert_eq!(report.upserted, 5);
        assert_eq!(report.from_date, now() - ChronoDuration::days(7));
        assert_eq!(report.total_synced, 5);

        let refreshed = h
            .store
            .find_opportunity_by_url("https://x/a/0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.title, "Notice");
        assert_eq!(
            h.store.load_sync_state().await.unwrap().last_sync_date,
            Some(now())
        );
    }

    #[tokio::test]
    async fn full_sync_caps_each_code_at_three_batches() {
        let source = ScriptedSource::default()
            .with("a", drafts("a", 10))
            .failing("b")
            .with("c", drafts("c", 1));
        let h = harness(&["a", "b", "c"], source);

        let report = h.manager.full_sync(7, 2).await.unwrap();
        assert_eq!(
            report.per_category,
            vec![
                CategorySyncCount { code: "a".into(), records: 6, pages: 3 },
                CategorySyncCount { code: "b".into(), records: 0, pages: 0 },
                CategorySyncCount { code: "c".into(), records: 1, pages: 1 },
            ]
        );
        assert_eq!(report.failed_categories, vec!["b".to_string()]);
        assert_eq!(report.total_synced, 7);
    }

    #[tokio::test]
    async fn full_sync_rejects_zero_batch() {
        let h = harness(&["a"], ScriptedSource::default());
        assert!(matches!(
            h.manager.full_sync(7, 0).await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn full_sync_rejects_window_past_the_calendar() {
        let h = harness(&["541512"], ScriptedSource::default().with("541512", drafts("a", 1)));
        assert!(matches!(
            h.manager.full_sync(u32::MAX, 10).await,
            Err(SyncError::Validation(_))
        ));
        assert!(h.source.calls().is_empty());
        assert_eq!(h.store.load_sync_state().await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn synced_notice_scores_seventy_against_cloud_capability() {
        let source = ScriptedSource::default().with(
            "541512",
            vec![draft("u1", "Cloud Migration Support", "541512")],
        );
        let h = harness(&["541512"], source);
        let mut cloud = NewCapability::named("Cloud Services");
        cloud.keywords = vec!["cloud".into(), "migration".into()];
        cloud.naics_codes = vec!["541512".into()];
        h.store.create_capability(&cloud).await.unwrap();

        h.manager.incremental_sync(90).await.unwrap();
        let opp = h.store.find_opportunity_by_url("u1").await.unwrap().unwrap();
        let results = CapabilityMatcher::new(h.store.clone())
            .analyze_opportunity(&opp)
            .await
            .unwrap();

        assert_eq!(h.store.count_opportunities(&OpportunityFilter::default()).await.unwrap(), 1);
        let matches = h.store.matches_for_opportunity(opp.id).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].match_percentage, 70.0);
        assert_eq!(results[0].match_percentage, 70.0);
    }
}
