//! Capability matcher: weighted scoring of opportunities against capability
//! profiles, with every positive score appended to the match history.

use std::sync::Arc;

use govmatch_core::{Capability, MatchDetails, MatchResult, NewMatch, Opportunity};
use govmatch_storage::{OpportunityFilter, Store, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "govmatch-matcher";

pub const KEYWORD_WEIGHT: f64 = 40.0;
pub const NAICS_WEIGHT: f64 = 30.0;
pub const AGENCY_WEIGHT: f64 = 20.0;
pub const SET_ASIDE_WEIGHT: f64 = 10.0;
pub const MAX_SCORE: f64 = 100.0;

/// Opportunities scanned by a batch run when no ids are given.
pub const DEFAULT_BATCH_SCAN_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Score one opportunity against one capability. Pure and deterministic.
pub fn calculate_match(opportunity: &Opportunity, capability: &Capability) -> MatchResult {
    let mut details = MatchDetails::default();
    let mut score = 0.0;

    if !capability.keywords.is_empty() {
        let text = opportunity.searchable_text();
        details.keyword_matches = capability
            .keywords
            .iter()
            .filter(|keyword| text.contains(&keyword.to_lowercase()))
            .cloned()
            .collect();
        let proportion = details.keyword_matches.len() as f64 / capability.keywords.len() as f64;
        score += KEYWORD_WEIGHT * proportion;
    }

    if let Some(code) = &opportunity.naics_code {
        if capability.naics_codes.iter().any(|c| c == code) {
            details.naics_match = true;
            score += NAICS_WEIGHT;
        }
    }

    if let Some(agency) = &opportunity.agency {
        let agency = agency.to_lowercase();
        if capability
            .preferred_agencies
            .iter()
            .any(|preferred| agency.contains(&preferred.to_lowercase()))
        {
            details.agency_match = true;
            score += AGENCY_WEIGHT;
        }
    }

    if let Some(set_aside) = &opportunity.set_aside {
        if capability.preferred_set_asides.iter().any(|s| s == set_aside) {
            details.set_aside_match = true;
            score += SET_ASIDE_WEIGHT;
        }
    }

    MatchResult {
        capability_id: capability.id,
        capability_name: capability.name.clone(),
        match_percentage: score.min(MAX_SCORE),
        match_details: details,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub opportunity_id: Uuid,
    pub error: String,
}

/// Outcome of a batch run. A failing opportunity is recorded and skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchAnalysis {
    pub analyzed: usize,
    pub failed: Vec<BatchFailure>,
    /// Requested ids that did not resolve to an opportunity.
    pub missing: Vec<Uuid>,
}

#[derive(Clone)]
pub struct CapabilityMatcher {
    store: Arc<dyn Store>,
}

impl CapabilityMatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Score `opportunity` against every active capability, append a match
    /// row for each positive score and return those results, best first.
    pub async fn analyze_opportunity(
        &self,
        opportunity: &Opportunity,
    ) -> Result<Vec<MatchResult>, MatchError> {
        let mut capabilities = self.store.list_capabilities(true).await?;
        capabilities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut results = Vec::new();
        for capability in &capabilities {
            let result = calculate_match(opportunity, capability);
            if result.match_percentage <= 0.0 {
                continue;
            }
            self.store
                .insert_match(&NewMatch {
                    opportunity_id: opportunity.id,
                    capability_id: capability.id,
                    match_percentage: result.match_percentage,
                    match_details: result.match_details.clone(),
                })
                .await?;
            results.push(result);
        }

        // Stable: ties keep capability order.
        results.sort_by(|a, b| b.match_percentage.total_cmp(&a.match_percentage));
        debug!(
            opportunity_id = %opportunity.id,
            capabilities = capabilities.len(),
            matched = results.len(),
            "analyzed opportunity"
        );
        Ok(results)
    }

    /// Analyze the given opportunities, or the most recent ones when `ids`
    /// is `None` or empty.
    pub async fn batch_analyze(&self, ids: Option<&[Uuid]>) -> Result<BatchAnalysis, MatchError> {
        let mut report = BatchAnalysis::default();

        let opportunities = match ids {
            Some(ids) if !ids.is_empty() => {
                let mut found = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.store.find_opportunity(*id).await? {
                        Some(opp) => found.push(opp),
                        None => report.missing.push(*id),
                    }
                }
                found
            }
            _ => {
                self.store
                    .scan_opportunities(&OpportunityFilter::default(), 0, DEFAULT_BATCH_SCAN_LIMIT)
                    .await?
            }
        };

        for opportunity in &opportunities {
            match self.analyze_opportunity(opportunity).await {
                Ok(_) => {
                    report.analyzed += 1;
                    if report.analyzed % 10 == 0 {
                        info!(analyzed = report.analyzed, "batch analysis progress");
                    }
                }
                Err(err) => {
                    warn!(opportunity_id = %opportunity.id, error = %err, "analysis failed");
                    report.failed.push(BatchFailure {
                        opportunity_id: opportunity.id,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            analyzed = report.analyzed,
            failed = report.failed.len(),
            missing = report.missing.len(),
            "batch analysis complete"
        );
        Ok(report)
    }
}
