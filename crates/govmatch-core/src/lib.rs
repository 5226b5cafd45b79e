//! Core domain model for govmatch: procurement notices, capability profiles,
//! scored matches and the persisted sync cursor.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "govmatch-core";

pub const SYNC_STATE_KEY: &str = "main";

/// Matches at or above this percentage count as "high" in statistics.
pub const HIGH_MATCH_THRESHOLD: f64 = 70.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCode {
    pub code: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDraft {
    pub url: String,
    pub title: String,
    pub agency: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub due_date: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub category_description: Option<String>,
    pub raw_payload: JsonValue,
    pub fetched_at: DateTime<Utc>,
}

/// Persisted opportunity. `url` is the natural key; `id` is store-assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub agency: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub due_date: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub category_description: Option<String>,
    pub raw_payload: JsonValue,
    pub fetched_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Opportunity {
    pub fn from_draft(id: Uuid, draft: &OpportunityDraft, now: DateTime<Utc>) -> Self {
        Self {
            id,
            url: draft.url.clone(),
            title: draft.title.clone(),
            agency: draft.agency.clone(),
            naics_code: draft.naics_code.clone(),
            set_aside: draft.set_aside.clone(),
            posted_date: draft.posted_date,
            due_date: draft.due_date,
            description: draft.description.clone(),
            category_description: draft.category_description.clone(),
            raw_payload: draft.raw_payload.clone(),
            fetched_at: draft.fetched_at,
            created_at: now,
            last_updated: now,
        }
    }

    /// Overwrite the mutable fields from a fresher draft, keeping `id` and `created_at`.
    pub fn refresh_from(&mut self, draft: &OpportunityDraft, now: DateTime<Utc>) {
        let id = self.id;
        let created_at = self.created_at;
        *self = Self::from_draft(id, draft, now);
        self.created_at = created_at;
    }

    /// Lowercased `title + description`, the text keywords are matched against.
    pub fn searchable_text(&self) -> String {
        format!(
            "{} {}",
            self.title,
            self.description.as_deref().unwrap_or_default()
        )
        .to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub naics_codes: Vec<String>,
    #[serde(default)]
    pub preferred_agencies: Vec<String>,
    #[serde(default)]
    pub preferred_set_asides: Vec<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCapability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub naics_codes: Vec<String>,
    #[serde(default)]
    pub preferred_agencies: Vec<String>,
    #[serde(default)]
    pub preferred_set_asides: Vec<String>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl NewCapability {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            keywords: Vec::new(),
            naics_codes: Vec::new(),
            preferred_agencies: Vec::new(),
            preferred_set_asides: Vec::new(),
            min_value: None,
            max_value: None,
            active: true,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError("capability name is required".into()));
        }
        validate_profile(
            &self.keywords,
            &self.preferred_agencies,
            self.min_value,
            self.max_value,
        )
    }

    pub fn into_capability(self, id: Uuid, now: DateTime<Utc>) -> Capability {
        Capability {
            id,
            name: self.name.trim().to_string(),
            description: self.description,
            keywords: self.keywords,
            naics_codes: self.naics_codes,
            preferred_agencies: self.preferred_agencies,
            preferred_set_asides: self.preferred_set_asides,
            min_value: self.min_value,
            max_value: self.max_value,
            active: self.active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a capability; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub naics_codes: Option<Vec<String>>,
    pub preferred_agencies: Option<Vec<String>>,
    pub preferred_set_asides: Option<Vec<String>>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub active: Option<bool>,
}

impl CapabilityUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply onto a copy of `current` and validate the result.
    pub fn applied_to(
        &self,
        current: &Capability,
        now: DateTime<Utc>,
    ) -> Result<Capability, ValidationError> {
        let mut next = current.clone();
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ValidationError("capability name is required".into()));
            }
            next.name = name.trim().to_string();
        }
        if let Some(v) = &self.description {
            next.description = v.clone();
        }
        if let Some(v) = &self.keywords {
            next.keywords = v.clone();
        }
        if let Some(v) = &self.naics_codes {
            next.naics_codes = v.clone();
        }
        if let Some(v) = &self.preferred_agencies {
            next.preferred_agencies = v.clone();
        }
        if let Some(v) = &self.preferred_set_asides {
            next.preferred_set_asides = v.clone();
        }
        if self.min_value.is_some() {
            next.min_value = self.min_value;
        }
        if self.max_value.is_some() {
            next.max_value = self.max_value;
        }
        if let Some(active) = self.active {
            next.active = active;
        }
        validate_profile(
            &next.keywords,
            &next.preferred_agencies,
            next.min_value,
            next.max_value,
        )?;
        next.updated_at = now;
        Ok(next)
    }
}

// Blank keywords and agencies would match every notice as substrings.
fn validate_profile(
    keywords: &[String],
    preferred_agencies: &[String],
    min_value: Option<f64>,
    max_value: Option<f64>,
) -> Result<(), ValidationError> {
    if keywords.iter().any(|k| k.trim().is_empty()) {
        return Err(ValidationError("keywords must not be blank".into()));
    }
    if preferred_agencies.iter().any(|a| a.trim().is_empty()) {
        return Err(ValidationError("preferred agencies must not be blank".into()));
    }
    if let (Some(min), Some(max)) = (min_value, max_value) {
        if min > max {
            return Err(ValidationError(format!(
                "min_value {min} exceeds max_value {max}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchDetails {
    pub keyword_matches: Vec<String>,
    pub naics_match: bool,
    pub agency_match: bool,
    pub set_aside_match: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub capability_id: Uuid,
    pub capability_name: String,
    pub match_percentage: f64,
    pub match_details: MatchDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMatch {
    pub opportunity_id: Uuid,
    pub capability_id: Uuid,
    pub match_percentage: f64,
    pub match_details: MatchDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub capability_id: Uuid,
    pub match_percentage: f64,
    pub match_details: MatchDetails,
    pub created_at: DateTime<Utc>,
}

impl MatchRecord {
    pub fn from_new(id: Uuid, new: &NewMatch, now: DateTime<Utc>) -> Self {
        Self {
            id,
            opportunity_id: new.opportunity_id,
            capability_id: new.capability_id,
            match_percentage: new.match_percentage,
            match_details: new.match_details.clone(),
            created_at: now,
        }
    }
}

/// Singleton sync cursor. `version` guards read-modify-write cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_sync_date: Option<DateTime<Utc>>,
    pub total_synced: u64,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub version: u64,
}

impl SyncState {
    pub fn advance_cursor(&mut self, to: DateTime<Utc>) {
        self.last_sync_date = Some(match self.last_sync_date {
            Some(prev) if prev > to => prev,
            _ => to,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            "skipped" => Some(JobStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub status: JobStatus,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_opportunities: u64,
    pub total_capabilities: u64,
    pub active_capabilities: u64,
    pub total_matches: u64,
    pub high_matches: u64,
    pub recent_opportunities: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut state = SyncState::default();
        state.advance_cursor(ts(10));
        state.advance_cursor(ts(4));
        assert_eq!(state.last_sync_date, Some(ts(10)));
        state.advance_cursor(ts(11));
        assert_eq!(state.last_sync_date, Some(ts(11)));
    }

    #[test]
    fn capability_validation_rejects_inverted_value_range() {
        let mut cap = NewCapability::named("Cloud");
        cap.min_value = Some(10.0);
        cap.max_value = Some(5.0);
        assert!(cap.validate().is_err());

        cap.max_value = Some(50.0);
        assert!(cap.validate().is_ok());
    }

    #[test]
    fn capability_validation_rejects_blank_name_and_keywords() {
        assert!(NewCapability::named("  ").validate().is_err());
        let mut cap = NewCapability::named("Cloud");
        cap.keywords = vec!["cloud".into(), " ".into()];
        assert!(cap.validate().is_err());
    }

    #[test]
    fn update_keeps_untouched_fields() {
        let mut new = NewCapability::named("Cloud");
        new.keywords = vec!["cloud".into()];
        let cap = new.into_capability(Uuid::new_v4(), ts(1));
        let update = CapabilityUpdate {
            active: Some(false),
            ..Default::default()
        };
        let next = update.applied_to(&cap, ts(2)).unwrap();
        assert!(!next.active);
        assert_eq!(next.keywords, vec!["cloud".to_string()]);
        assert_eq!(next.created_at, ts(1));
        assert_eq!(next.updated_at, ts(2));
        assert!(CapabilityUpdate::default().is_empty());
    }

    #[test]
    fn job_status_round_trips_through_str() {
        for status in [JobStatus::Success, JobStatus::Failed, JobStatus::Skipped] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }
}
