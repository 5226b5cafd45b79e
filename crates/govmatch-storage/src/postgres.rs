//! Postgres-backed [`Store`] via `sqlx`.
//!
//! Schema lives in the workspace `migrations/` directory and is applied by
//! [`PgStore::migrate`]. Upserts rely on the unique index on
//! `opportunities.url`; the sync cursor is a single row keyed `main` whose
//! `version` column backs the compare-and-swap in
//! [`Store::save_sync_state`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use govmatch_core::{
    Capability, CapabilityUpdate, JobOutcome, JobStatus, MatchDetails, MatchRecord, NewCapability,
    NewMatch, Opportunity, OpportunityDraft, SyncState, SYNC_STATE_KEY,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::{OpportunityFilter, Store, StoreError, StoreResult};

const OPPORTUNITY_COLUMNS: &str = "id, url, title, agency, naics_code, set_aside, posted_date, \
     due_date, description, category_description, raw_payload, fetched_at, created_at, last_updated";

const CAPABILITY_COLUMNS: &str = "id, name, description, keywords, naics_codes, \
     preferred_agencies, preferred_set_asides, min_value, max_value, active, created_at, updated_at";

const MATCH_COLUMNS: &str =
    "id, opportunity_id, capability_id, match_percentage, match_details, created_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn opportunity_from_row(row: &PgRow) -> StoreResult<Opportunity> {
    Ok(Opportunity {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        agency: row.try_get("agency")?,
        naics_code: row.try_get("naics_code")?,
        set_aside: row.try_get("set_aside")?,
        posted_date: row.try_get("posted_date")?,
        due_date: row.try_get("due_date")?,
        description: row.try_get("description")?,
        category_description: row.try_get("category_description")?,
        raw_payload: row.try_get::<JsonValue, _>("raw_payload")?,
        fetched_at: row.try_get("fetched_at")?,
        created_at: row.try_get("created_at")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn capability_from_row(row: &PgRow) -> StoreResult<Capability> {
    Ok(Capability {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        keywords: row.try_get("keywords")?,
        naics_codes: row.try_get("naics_codes")?,
        preferred_agencies: row.try_get("preferred_agencies")?,
        preferred_set_asides: row.try_get("preferred_set_asides")?,
        min_value: row.try_get("min_value")?,
        max_value: row.try_get("max_value")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn match_from_row(row: &PgRow) -> StoreResult<MatchRecord> {
    let details: Json<MatchDetails> = row.try_get("match_details")?;
    Ok(MatchRecord {
        id: row.try_get("id")?,
        opportunity_id: row.try_get("opportunity_id")?,
        capability_id: row.try_get("capability_id")?,
        match_percentage: row.try_get("match_percentage")?,
        match_details: details.0,
        created_at: row.try_get("created_at")?,
    })
}

fn job_from_row(row: &PgRow) -> StoreResult<JobOutcome> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status).ok_or_else(|| {
        StoreError::Unavailable(format!("unknown job status {status:?} in sync_jobs"))
    })?;
    Ok(JobOutcome {
        id: row.try_get("id")?,
        executed_at: row.try_get("executed_at")?,
        status,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
    })
}

fn map_unique_violation(err: sqlx::Error, what: String) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what),
        _ => StoreError::Database(err),
    }
}

fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &OpportunityFilter) {
    qb.push(" WHERE TRUE");
    if let Some(code) = &filter.naics_code {
        qb.push(" AND naics_code = ").push_bind(code.clone());
    }
    if let Some(agency) = &filter.agency_contains {
        qb.push(" AND agency ILIKE ")
            .push_bind(format!("%{}%", escape_like(agency)));
    }
    if let Some(set_aside) = &filter.set_aside {
        qb.push(" AND set_aside = ").push_bind(set_aside.clone());
    }
    if let Some(since) = filter.posted_since {
        qb.push(" AND posted_date >= ").push_bind(since);
    }
}

async fn upsert_one(conn: &mut PgConnection, draft: &OpportunityDraft) -> StoreResult<Uuid> {
    let now = Utc::now();
    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO opportunities (id, url, title, agency, naics_code, set_aside, posted_date,
                                   due_date, description, category_description, raw_payload,
                                   fetched_at, created_at, last_updated)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
        ON CONFLICT (url) DO UPDATE SET
            title = EXCLUDED.title,
            agency = EXCLUDED.agency,
            naics_code = EXCLUDED.naics_code,
            set_aside = EXCLUDED.set_aside,
            posted_date = EXCLUDED.posted_date,
            due_date = EXCLUDED.due_date,
            description = EXCLUDED.description,
            category_description = EXCLUDED.category_description,
            raw_payload = EXCLUDED.raw_payload,
            fetched_at = EXCLUDED.fetched_at,
            last_updated = EXCLUDED.last_updated
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&draft.url)
    .bind(&draft.title)
    .bind(&draft.agency)
    .bind(&draft.naics_code)
    .bind(&draft.set_aside)
    .bind(draft.posted_date)
    .bind(draft.due_date)
    .bind(&draft.description)
    .bind(&draft.category_description)
    .bind(&draft.raw_payload)
    .bind(draft.fetched_at)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_opportunity(&self, draft: &OpportunityDraft) -> StoreResult<Uuid> {
        let mut conn = self.pool.acquire().await?;
        upsert_one(&mut conn, draft).await
    }

    async fn bulk_upsert_opportunities(&self, drafts: &[OpportunityDraft]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        for draft in drafts {
            upsert_one(&mut tx, draft).await?;
        }
        tx.commit().await?;
        Ok(drafts.len())
    }

    async fn find_opportunity(&self, id: Uuid) -> StoreResult<Option<Opportunity>> {
        let row = sqlx::query(&format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(opportunity_from_row).transpose()
    }

    async fn find_opportunity_by_url(&self, url: &str) -> StoreResult<Option<Opportunity>> {
        let row = sqlx::query(&format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE url = $1"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(opportunity_from_row).transpose()
    }

    async fn scan_opportunities(
        &self,
        filter: &OpportunityFilter,
        skip: usize,
        limit: usize,
    ) -> StoreResult<Vec<Opportunity>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities"
        ));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY posted_date DESC NULLS LAST, created_at DESC, id ASC OFFSET ")
            .push_bind(skip as i64)
            .push(" LIMIT ")
            .push_bind(limit as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    async fn count_opportunities(&self, filter: &OpportunityFilter) -> StoreResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM opportunities");
        push_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn create_capability(&self, new: &NewCapability) -> StoreResult<Uuid> {
        new.validate()?;
        let cap = new.clone().into_capability(Uuid::new_v4(), Utc::now());
        sqlx::query(
            r#"
            INSERT INTO capabilities (id, name, description, keywords, naics_codes,
                                      preferred_agencies, preferred_set_asides, min_value,
                                      max_value, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(cap.id)
        .bind(&cap.name)
        .bind(&cap.description)
        .bind(&cap.keywords)
        .bind(&cap.naics_codes)
        .bind(&cap.preferred_agencies)
        .bind(&cap.preferred_set_asides)
        .bind(cap.min_value)
        .bind(cap.max_value)
        .bind(cap.active)
        .bind(cap.created_at)
        .bind(cap.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, format!("capability name {:?} already exists", cap.name)))?;
        Ok(cap.id)
    }

    async fn update_capability(&self, id: Uuid, update: &CapabilityUpdate) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {CAPABILITY_COLUMNS} FROM capabilities WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let next = update.applied_to(&capability_from_row(&row)?, Utc::now())?;
        sqlx::query(
            r#"
            UPDATE capabilities
               SET name = $2, description = $3, keywords = $4, naics_codes = $5,
                   preferred_agencies = $6, preferred_set_asides = $7, min_value = $8,
                   max_value = $9, active = $10, updated_at = $11
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&next.name)
        .bind(&next.description)
        .bind(&next.keywords)
        .bind(&next.naics_codes)
        .bind(&next.preferred_agencies)
        .bind(&next.preferred_set_asides)
        .bind(next.min_value)
        .bind(next.max_value)
        .bind(next.active)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, format!("capability name {:?} already exists", next.name)))?;
        tx.commit().await?;
        Ok(true)
    }

    async fn find_capability(&self, id: Uuid) -> StoreResult<Option<Capability>> {
        let row = sqlx::query(&format!(
            "SELECT {CAPABILITY_COLUMNS} FROM capabilities WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(capability_from_row).transpose()
    }

    async fn list_capabilities(&self, active_only: bool) -> StoreResult<Vec<Capability>> {
        let rows = sqlx::query(&format!(
            "SELECT {CAPABILITY_COLUMNS} FROM capabilities \
             WHERE ($1 = FALSE OR active) ORDER BY created_at ASC, id ASC"
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(capability_from_row).collect()
    }

    async fn insert_match(&self, new: &NewMatch) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO matches (id, opportunity_id, capability_id, match_percentage,
                                 match_details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(new.opportunity_id)
        .bind(new.capability_id)
        .bind(new.match_percentage)
        .bind(Json(&new.match_details))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::NotFound {
                entity: "opportunity or capability",
                id: format!("{}/{}", new.opportunity_id, new.capability_id),
            },
            _ => StoreError::Database(err),
        })?;
        Ok(id)
    }

    async fn matches_for_opportunity(&self, opportunity_id: Uuid) -> StoreResult<Vec<MatchRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE opportunity_id = $1 \
             ORDER BY match_percentage DESC, created_at DESC"
        ))
        .bind(opportunity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(match_from_row).collect()
    }

    async fn high_matches(&self, threshold: f64, limit: usize) -> StoreResult<Vec<MatchRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MATCH_COLUMNS} FROM (
                SELECT DISTINCT ON (opportunity_id) {MATCH_COLUMNS}
                  FROM matches
                 WHERE match_percentage >= $1
                 ORDER BY opportunity_id, created_at DESC, match_percentage DESC
            ) latest
            ORDER BY created_at DESC, match_percentage DESC
            LIMIT $2
            "#
        ))
        .bind(threshold)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(match_from_row).collect()
    }

    async fn count_matches(&self, min_percentage: Option<f64>) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM matches WHERE ($1::DOUBLE PRECISION IS NULL OR match_percentage >= $1)",
        )
        .bind(min_percentage)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn load_sync_state(&self) -> StoreResult<SyncState> {
        let row = sqlx::query(
            "SELECT last_sync_date, total_synced, last_sync_timestamp, version \
             FROM sync_state WHERE key = $1",
        )
        .bind(SYNC_STATE_KEY)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(SyncState::default());
        };
        let total: i64 = row.try_get("total_synced")?;
        let version: i64 = row.try_get("version")?;
        Ok(SyncState {
            last_sync_date: row.try_get("last_sync_date")?,
            total_synced: total.max(0) as u64,
            last_sync_timestamp: row.try_get("last_sync_timestamp")?,
            version: version.max(0) as u64,
        })
    }

    async fn save_sync_state(&self, state: &SyncState) -> StoreResult<SyncState> {
        let next_version = state.version + 1;
        let written = if state.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO sync_state (key, last_sync_date, total_synced, last_sync_timestamp, version)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(SYNC_STATE_KEY)
            .bind(state.last_sync_date)
            .bind(state.total_synced as i64)
            .bind(state.last_sync_timestamp)
            .bind(next_version as i64)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE sync_state
                   SET last_sync_date = $2, total_synced = $3, last_sync_timestamp = $4, version = $5
                 WHERE key = $1 AND version = $6
                "#,
            )
            .bind(SYNC_STATE_KEY)
            .bind(state.last_sync_date)
            .bind(state.total_synced as i64)
            .bind(state.last_sync_timestamp)
            .bind(next_version as i64)
            .bind(state.version as i64)
            .execute(&self.pool)
            .await?
        };

        if written.rows_affected() == 0 {
            let found = self.load_sync_state().await?.version;
            return Err(StoreError::VersionConflict {
                expected: state.version,
                found,
            });
        }

        let mut stored = state.clone();
        stored.version = next_version;
        Ok(stored)
    }

    async fn try_acquire_lease(&self, name: &str, holder: Uuid, ttl: Duration) -> StoreResult<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        let row = sqlx::query(
            r#"
            INSERT INTO sync_leases (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
               SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
             WHERE sync_leases.expires_at <= $4 OR sync_leases.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_job_outcome(&self, outcome: &JobOutcome) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO sync_jobs (id, executed_at, status, result, error) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(outcome.id)
        .bind(outcome.executed_at)
        .bind(outcome.status.as_str())
        .bind(&outcome.result)
        .bind(&outcome.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_history(&self, limit: usize) -> StoreResult<Vec<JobOutcome>> {
        let rows = sqlx::query(
            "SELECT id, executed_at, status, result, error FROM sync_jobs \
             ORDER BY executed_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[test]
    fn filter_sql_binds_every_field() {
        let filter = OpportunityFilter {
            naics_code: Some("541512".into()),
            agency_contains: Some("defense".into()),
            set_aside: Some("SBA".into()),
            posted_since: chrono::NaiveDate::from_ymd_opt(2026, 1, 1),
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM opportunities");
        push_filter(&mut qb, &filter);
        assert_eq!(
            qb.sql(),
            "SELECT COUNT(*) FROM opportunities WHERE TRUE AND naics_code = $1 \
             AND agency ILIKE $2 AND set_aside = $3 AND posted_date >= $4"
        );
    }
}
