//! Test doubles shared by the sync and scheduler tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use govmatch_adapters::{SourceClient, SourceError};
use govmatch_core::{CategoryCode, OpportunityDraft};

use crate::clock::{Clock, Sleeper, StopSignal};
use crate::config::CategoryRegistry;

pub(crate) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).single().unwrap()
}

pub(crate) fn draft(url: &str, title: &str, naics: &str) -> OpportunityDraft {
    OpportunityDraft {
        url: url.to_string(),
        title: title.to_string(),
        agency: None,
        naics_code: Some(naics.to_string()),
        set_aside: None,
        posted_date: None,
        due_date: None,
        description: None,
        category_description: None,
        raw_payload: serde_json::json!({ "uiLink": url }),
        fetched_at: now(),
    }
}

pub(crate) fn drafts(prefix: &str, n: usize) -> Vec<OpportunityDraft> {
    (0..n)
        .map(|i| draft(&format!("https://x/{prefix}/{i}"), "Notice", prefix))
        .collect()
}

#[derive(Default)]
pub(crate) struct ScriptedSource {
    pub(crate) pages: HashMap<String, Vec<OpportunityDraft>>,
    pub(crate) failing: HashSet<String>,
    pub(crate) stop_on_first_call: Option<StopSignal>,
    pub(crate) calls: Mutex<Vec<(String, usize, usize)>>,
}

impl ScriptedSource {
    pub(crate) fn with(mut self, code: &str, records: Vec<OpportunityDraft>) -> Self {
        self.pages.insert(code.to_string(), records);
        self
    }

    pub(crate) fn failing(mut self, code: &str) -> Self {
        self.failing.insert(code.to_string());
        self
    }

    pub(crate) fn calls(&self) -> Vec<(String, usize, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn search(
        &self,
        category_code: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OpportunityDraft>, SourceError> {
        self.calls
            .lock()
            .unwrap()
            .push((category_code.to_string(), limit, offset));
        if let Some(stop) = &self.stop_on_first_call {
            stop.stop();
        }
        if self.failing.contains(category_code) {
            return Err(SourceError::HttpStatus {
                status: 503,
                url: "https://source.test/search".into(),
            });
        }
        Ok(self
            .pages
            .get(category_code)
            .map(|all| all.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub(crate) struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub(crate) fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

pub(crate) struct FixedClock(pub(crate) DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub(crate) fn registry(codes: &[&str]) -> CategoryRegistry {
    CategoryRegistry::new(
        codes
            .iter()
            .map(|code| CategoryCode {
                code: code.to_string(),
                description: format!("Category {code}"),
            })
            .collect(),
    )
    .unwrap()
}
