//! Opportunity source contract + SAM.gov and fixture-backed implementations.

pub mod http;

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use govmatch_core::OpportunityDraft;
use reqwest::Url;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub use http::{BackoffPolicy, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "govmatch-adapters";

pub const DEFAULT_SAM_API_URL: &str = "https://api.sam.gov/opportunities/v2/search";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("fixture {path}: {message}")]
    Fixture { path: String, message: String },
}

/// Paged search over one external procurement listing service.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Notices posted in `[from, to]` under `category_code`. An empty page
    /// means the listing is exhausted.
    async fn search(
        &self,
        category_code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OpportunityDraft>, SourceError>;
}

/// Map a search response body (`{"opportunitiesData": [...]}`) to drafts.
/// Entries without a link are dropped; nothing else is required.
pub fn parse_search_response(
    body: &JsonValue,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<OpportunityDraft>, String> {
    let entries = match body.get("opportunitiesData") {
        Some(JsonValue::Array(entries)) => entries,
        Some(JsonValue::Null) | None => return Ok(Vec::new()),
        Some(_) => return Err("opportunitiesData is not an array".to_string()),
    };

    let mut drafts = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry_to_draft(entry, fetched_at) {
            Some(draft) => drafts.push(draft),
            None => warn!(
                notice_id = json_str(entry, "noticeId").unwrap_or("unknown"),
                "dropping notice without a link"
            ),
        }
    }
    Ok(drafts)
}

fn entry_to_draft(entry: &JsonValue, fetched_at: DateTime<Utc>) -> Option<OpportunityDraft> {
    let url = json_str(entry, "uiLink")?.to_string();
    Some(OpportunityDraft {
        url,
        title: json_str(entry, "title").unwrap_or_default().to_string(),
        agency: json_str(entry, "fullParentPathName")
            .or_else(|| json_str(entry, "department"))
            .map(ToString::to_string),
        naics_code: json_str(entry, "naicsCode").map(ToString::to_string),
        set_aside: json_str(entry, "typeOfSetAside").map(ToString::to_string),
        posted_date: json_str(entry, "postedDate").and_then(parse_date),
        due_date: json_str(entry, "responseDeadLine").and_then(parse_deadline),
        description: json_str(entry, "description").map(ToString::to_string),
        category_description: None,
        raw_payload: entry.clone(),
        fetched_at,
    })
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%m/%d/%Y"))
        .ok()
        .or_else(|| parse_deadline(value).map(|dt| dt.date_naive()))
}

fn parse_deadline(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
}

/// The listing service expects `MM/DD/YYYY` window bounds.
pub fn format_query_date(value: DateTime<Utc>) -> String {
    value.format("%m/%d/%Y").to_string()
}

#[derive(Debug, Clone)]
pub struct SamClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub http: HttpClientConfig,
}

#[derive(Debug)]
pub struct SamGovClient {
    base_url: Url,
    api_key: String,
    http: HttpFetcher,
}

impl SamGovClient {
    pub fn new(config: SamClientConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.api_key.trim().is_empty(), "SAM api key is empty");
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing SAM api url {}", config.base_url))?;
        Ok(Self {
            base_url,
            api_key: config.api_key,
            http: HttpFetcher::new(config.http)?,
        })
    }

    pub fn search_url(
        &self,
        category_code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("api_key", &self.api_key)
            .append_pair("postedFrom", &format_query_date(from))
            .append_pair("postedTo", &format_query_date(to))
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string())
            .append_pair("ncode", category_code);
        url
    }
}

#[async_trait]
impl SourceClient for SamGovClient {
    fn source_id(&self) -> &'static str {
        "sam"
    }

    async fn search(
        &self,
        category_code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OpportunityDraft>, SourceError> {
        let url = self.search_url(category_code, from, to, limit, offset);
        let printable = http::redact_url(&url);
        let body = self.http.get_json(self.source_id(), url).await?;
        let drafts = parse_search_response(&body, Utc::now())
            .map_err(|message| SourceError::Decode { url: printable, message })?;
        debug!(category_code, offset, returned = drafts.len(), "sam search page");
        Ok(drafts)
    }
}

/// Serves recorded search responses from `<dir>/<code>.json`.
#[derive(Debug, Clone)]
pub struct FixtureSourceClient {
    dir: PathBuf,
}

impl FixtureSourceClient {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn fixture_path(&self, category_code: &str) -> PathBuf {
        self.dir.join(format!("{category_code}.json"))
    }
}

#[async_trait]
impl SourceClient for FixtureSourceClient {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn search(
        &self,
        category_code: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OpportunityDraft>, SourceError> {
        let path = self.fixture_path(category_code);
        let fixture_err = |message: String| SourceError::Fixture {
            path: path.display().to_string(),
            message,
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(category_code, "no fixture recorded");
                return Ok(Vec::new());
            }
            Err(err) => return Err(fixture_err(err.to_string())),
        };
        let body: JsonValue =
            serde_json::from_slice(&bytes).map_err(|err| fixture_err(err.to_string()))?;
        let drafts = parse_search_response(&body, Utc::now()).map_err(fixture_err)?;
        Ok(drafts.into_iter().skip(offset).take(limit).collect())
    }
}
