//! Enrichment pipeline orchestration: seed extraction, snapshot polling,
//! sheet merging, and lead scoring.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use leadflow_adapters::{
    CellWrite, CompletionService, ScrapeJobService, StoreError, TabularStore,
};
use leadflow_core::{
    company_urls_from_cell, format_value, split_full_name, CompanyRecord, EntityKind, EntityStub,
    ProfileRecord, SnapshotStatus,
};
use leadflow_storage::{BackoffPolicy, PayloadCache, SnapshotStateStore, StatePhase};
use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadflow-sync";

/// Explicit pipeline configuration, passed to each component at
/// construction.
#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub state_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub leads_worksheet: String,
    pub similar_leads_worksheet: String,
    pub similar_companies_worksheet: String,
    pub link_column: String,
    pub company_column: String,
    pub score_column: String,
    pub profile_dataset_id: String,
    pub company_dataset_id: String,
    pub lookback_days: i64,
    pub poll_interval: Duration,
    pub rate_limit_delay: Duration,
    pub write_batch_size: usize,
    pub quota_wait: Duration,
    pub submit_chunk_size: usize,
    pub submit_backoff: BackoffPolicy,
    pub inter_chunk_delay: Duration,
    pub scoring_fields: Vec<ScoringField>,
    pub scoring_prompt_template: String,
    pub scoring_system_prompt: String,
}

/// Maps one `{placeholder}` in the scoring prompt template to a sheet
/// column header.
#[derive(Debug, Clone)]
pub struct ScoringField {
    pub placeholder: String,
    pub column: String,
}

const DEFAULT_SCORING_PROMPT: &str = "Analyze the following company information and determine if the company is likely to require multilingual translation services.\nAnd if the person is the right person to approach for cold email. Score from 0-10, 10 being highest match.\n\nUse the following fields to make your assessment:\n- Position: {position}\n- About: {about}\n- Website: {website}\n- Country Codes: {country_codes}\n- Company About: {company_about}\n- Crunchbase URL: {crunchbase_url}\n\nReturn ONLY a single number between 0-10 as your response, nothing else.";

const DEFAULT_SCORING_SYSTEM_PROMPT: &str = "You are a lead scoring assistant. Use only the information provided in the prompt; never fabricate or infer missing details. Reply with a single number between 0 and 10 and nothing else.";

fn default_scoring_fields() -> Vec<ScoringField> {
    [
        ("position", "position"),
        ("about", "about"),
        ("website", "enriched_website"),
        ("country_codes", "enriched_country_codes"),
        ("company_about", "enriched_unformatted_about"),
        ("crunchbase_url", "enriched_crunchbase_url"),
    ]
    .into_iter()
    .map(|(placeholder, column)| ScoringField {
        placeholder: placeholder.to_string(),
        column: column.to_string(),
    })
    .collect()
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./state"),
            snapshots_dir: PathBuf::from("./snapshots_downloaded"),
            leads_worksheet: "Leads".to_string(),
            similar_leads_worksheet: "Similar Leads".to_string(),
            similar_companies_worksheet: "Similar Companies".to_string(),
            link_column: "linkedin_person_url".to_string(),
            company_column: "current_company".to_string(),
            score_column: "lead_score".to_string(),
            profile_dataset_id: String::new(),
            company_dataset_id: String::new(),
            lookback_days: 1,
            poll_interval: Duration::from_secs(30),
            rate_limit_delay: Duration::from_millis(1100),
            write_batch_size: 50,
            quota_wait: Duration::from_secs(60),
            submit_chunk_size: 20,
            submit_backoff: BackoffPolicy::default(),
            inter_chunk_delay: Duration::from_secs(5),
            scoring_fields: default_scoring_fields(),
            scoring_prompt_template: DEFAULT_SCORING_PROMPT.to_string(),
            scoring_system_prompt: DEFAULT_SCORING_SYSTEM_PROMPT.to_string(),
        }
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(value) = std::env::var(key) {
        *target = value;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

impl EnrichConfig {
    /// Every scalar knob has a `LEADFLOW_*` override; the scoring prompt,
    /// its field mapping and the system prompt are code-configured only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("LEADFLOW_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LEADFLOW_SNAPSHOTS_DIR") {
            config.snapshots_dir = PathBuf::from(dir);
        }
        env_string("LEADFLOW_WORKSHEET", &mut config.leads_worksheet);
        env_string(
            "LEADFLOW_SIMILAR_LEADS_WORKSHEET",
            &mut config.similar_leads_worksheet,
        );
        env_string(
            "LEADFLOW_SIMILAR_COMPANIES_WORKSHEET",
            &mut config.similar_companies_worksheet,
        );
        env_string("LEADFLOW_LINK_COLUMN", &mut config.link_column);
        env_string("LEADFLOW_COMPANY_COLUMN", &mut config.company_column);
        env_string("LEADFLOW_SCORE_COLUMN", &mut config.score_column);
        env_string("LEADFLOW_PROFILE_DATASET_ID", &mut config.profile_dataset_id);
        env_string("LEADFLOW_COMPANY_DATASET_ID", &mut config.company_dataset_id);
        if let Some(days) = env_parse("LEADFLOW_LOOKBACK_DAYS") {
            config.lookback_days = days;
        }
        if let Some(secs) = env_parse("LEADFLOW_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(millis) = env_parse("LEADFLOW_RATE_LIMIT_DELAY_MS") {
            config.rate_limit_delay = Duration::from_millis(millis);
        }
        if let Some(size) = env_parse("LEADFLOW_WRITE_BATCH_SIZE") {
            config.write_batch_size = size;
        }
        if let Some(secs) = env_parse("LEADFLOW_QUOTA_WAIT_SECS") {
            config.quota_wait = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse("LEADFLOW_SUBMIT_CHUNK_SIZE") {
            config.submit_chunk_size = size;
        }
        if let Some(retries) = env_parse("LEADFLOW_SUBMIT_MAX_RETRIES") {
            config.submit_backoff.max_retries = retries;
        }
        if let Some(secs) = env_parse("LEADFLOW_SUBMIT_BASE_DELAY_SECS") {
            config.submit_backoff.base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("LEADFLOW_INTER_CHUNK_DELAY_SECS") {
            config.inter_chunk_delay = Duration::from_secs(secs);
        }
        config
    }

    fn dataset_id(&self, kind: EntityKind) -> Result<&str> {
        let id = match kind {
            EntityKind::Profile => self.profile_dataset_id.as_str(),
            EntityKind::Company => self.company_dataset_id.as_str(),
        };
        if id.is_empty() {
            bail!("dataset id for {kind} scraping is not configured");
        }
        Ok(id)
    }
}

/// Preferred ordering for well-known fields; anchors early columns in a
/// stable, human-curated layout. Unlisted fields append after all known
/// columns in encounter order.
fn field_priority(field: &str) -> Option<u32> {
    let priority = match field {
        "name" => 1,
        "position" => 2,
        "city" => 3,
        "country_code" => 4,
        "current_company_company_id" => 5,
        "current_company" => 6,
        "about" => 7,
        "experience" => 8,
        "company" => 100,
        "company_size" => 101,
        "company_industry" => 102,
        "company_website" => 103,
        "company_description" => 104,
        "company_founded" => 105,
        "company_specialties" => 106,
        "headline" => 200,
        "summary" => 201,
        "skills" => 202,
        "education" => 203,
        "languages" => 204,
        "certifications" => 205,
        "volunteer_experience" => 206,
        "recommendations" => 207,
        "connections" => 208,
        "email" => 300,
        "phone" => 301,
        "twitter" => 302,
        "website" => 303,
        _ => return None,
    };
    Some(priority)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldUpdate {
    name: String,
    value: String,
    priority: Option<u32>,
}

fn order_field_updates(mut updates: Vec<FieldUpdate>) -> Vec<FieldUpdate> {
    // Stable sort: prioritized fields ascending, the rest keep encounter order.
    updates.sort_by_key(|update| update.priority.unwrap_or(u32::MAX));
    updates
}

/// Header-row cache for the leads worksheet. Re-derived from row 1 at load;
/// once a column is created for a field its index never changes within a
/// run, and new fields are always appended, never inserted.
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    headers: Vec<String>,
}

impl ColumnSchema {
    pub async fn load(store: &dyn TabularStore, worksheet: &str) -> Result<Self> {
        let grid = store
            .read_all(worksheet)
            .await
            .with_context(|| format!("reading headers of worksheet {worksheet}"))?;
        Ok(Self {
            headers: grid.into_iter().next().unwrap_or_default(),
        })
    }

    pub fn column_of(&self, field: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|header| header == field)
            .map(|idx| idx + 1)
    }

    /// Resolve a field to its column, appending a new header cell at the end
    /// of the sheet when absent. Column creation is a remote write and is
    /// followed by the rate-limit delay.
    pub async fn resolve_column(
        &mut self,
        store: &dyn TabularStore,
        worksheet: &str,
        field: &str,
        rate_limit_delay: Duration,
    ) -> Result<usize> {
        if let Some(col) = self.column_of(field) {
            return Ok(col);
        }
        let col = self.headers.len() + 1;
        store
            .write_cell(worksheet, 1, col, field)
            .await
            .with_context(|| format!("creating column for field {field}"))?;
        self.headers.push(field.to_string());
        sleep(rate_limit_delay).await;
        Ok(col)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchMode {
    ProfileUrl,
    CompanySegments,
}

/// Row lookup over one linkage column, fetched once per merge call.
#[derive(Debug, Clone)]
pub struct RowIndex {
    values: Vec<String>,
    mode: MatchMode,
}

impl RowIndex {
    pub async fn for_profiles(
        store: &dyn TabularStore,
        worksheet: &str,
        link_col: usize,
    ) -> Result<Self> {
        let values = store
            .read_column(worksheet, link_col)
            .await
            .context("reading profile link column")?;
        Ok(Self {
            values,
            mode: MatchMode::ProfileUrl,
        })
    }

    pub async fn for_companies(
        store: &dyn TabularStore,
        worksheet: &str,
        company_col: usize,
    ) -> Result<Self> {
        let values = store
            .read_column(worksheet, company_col)
            .await
            .context("reading current_company column")?;
        Ok(Self {
            values,
            mode: MatchMode::CompanySegments,
        })
    }

    /// 1-based row of the record's linkage URL, or None when no row matches.
    pub fn find(&self, url: &str) -> Option<usize> {
        match self.mode {
            MatchMode::ProfileUrl => self
                .values
                .iter()
                .position(|value| value == url)
                .map(|idx| idx + 1),
            MatchMode::CompanySegments => {
                let target = leadflow_core::normalize_linkedin_url(url);
                self.values
                    .iter()
                    .position(|cell| {
                        !cell.is_empty()
                            && company_urls_from_cell(cell).iter().any(|u| *u == target)
                    })
                    .map(|idx| idx + 1)
            }
        }
    }
}

/// Seed profile URLs from the configured link column, deduplicated in sheet
/// order. A missing column is an unrecoverable precondition.
pub fn collect_profile_links(grid: &[Vec<String>], link_column: &str) -> Result<Vec<String>> {
    let headers = grid.first().context("seed worksheet has no header row")?;
    let col = headers
        .iter()
        .position(|header| header == link_column)
        .with_context(|| format!("column '{link_column}' not found in sheet"))?;
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for row in grid.iter().skip(1) {
        if let Some(value) = row.get(col) {
            let value = value.trim();
            if !value.is_empty() && seen.insert(value.to_string()) {
                links.push(value.to_string());
            }
        }
    }
    Ok(links)
}

/// Seed company URLs parsed out of `current_company` cells, deduplicated and
/// sorted. The column only exists after a profile merge pass, so its absence
/// yields an empty list rather than an error.
pub fn collect_company_links(grid: &[Vec<String>], company_column: &str) -> Vec<String> {
    let Some(headers) = grid.first() else {
        return Vec::new();
    };
    let Some(col) = headers.iter().position(|header| header == company_column) else {
        return Vec::new();
    };
    let mut links = BTreeSet::new();
    for row in grid.iter().skip(1) {
        if let Some(cell) = row.get(col) {
            for url in company_urls_from_cell(cell) {
                links.insert(url);
            }
        }
    }
    links.into_iter().collect()
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SubmitSummary {
    pub submitted: usize,
    pub abandoned: usize,
}

/// Submit seed URLs in chunks with bounded exponential backoff per chunk.
/// A chunk that exhausts its retries is abandoned with a warning and the
/// run continues with the next chunk.
pub async fn submit_urls(
    service: &dyn ScrapeJobService,
    dataset_id: &str,
    urls: &[String],
    config: &EnrichConfig,
) -> Result<SubmitSummary> {
    if dataset_id.is_empty() {
        bail!("dataset id is not configured");
    }
    let mut seen = HashSet::new();
    let clean: Vec<String> = urls
        .iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty() && seen.insert(url.clone()))
        .collect();
    info!(total = urls.len(), clean = clean.len(), "submitting seed URLs");

    let mut summary = SubmitSummary::default();
    for (chunk_no, chunk) in clean.chunks(config.submit_chunk_size.max(1)).enumerate() {
        let mut attempt = 0;
        loop {
            match service.submit(dataset_id, chunk).await {
                Ok(()) => {
                    info!(chunk = chunk_no + 1, urls = chunk.len(), "chunk submitted");
                    summary.submitted += chunk.len();
                    break;
                }
                Err(err) if attempt < config.submit_backoff.max_retries => {
                    let delay = config.submit_backoff.delay_for_attempt(attempt);
                    warn!(
                        %err,
                        chunk = chunk_no + 1,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs(),
                        "chunk submission failed, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(%err, chunk = chunk_no + 1, "abandoning chunk after retries");
                    summary.abandoned += chunk.len();
                    break;
                }
            }
        }
        sleep(config.inter_chunk_delay).await;
    }
    Ok(summary)
}

const PROFILE_SKIP_FIELDS: &[&str] = &[
    "input_url",
    "url",
    "similar_profiles",
    "people_also_viewed",
    "name",
];
const COMPANY_SKIP_FIELDS: &[&str] = &["input", "url", "similar"];

fn profile_field_updates(record: &ProfileRecord) -> Vec<FieldUpdate> {
    let (first_name, last_name) = split_full_name(record.name.as_deref().unwrap_or(""));
    let mut updates = vec![
        FieldUpdate {
            name: "first_name".to_string(),
            value: first_name,
            priority: Some(1),
        },
        FieldUpdate {
            name: "last_name".to_string(),
            value: last_name,
            priority: Some(2),
        },
    ];
    for (key, value) in &record.fields {
        if PROFILE_SKIP_FIELDS.contains(&key.as_str()) {
            continue;
        }
        updates.push(FieldUpdate {
            name: key.clone(),
            value: format_value(value),
            priority: field_priority(key),
        });
    }
    order_field_updates(updates)
}

fn company_field_updates(record: &CompanyRecord) -> Vec<FieldUpdate> {
    let mut updates = Vec::new();
    for (key, value) in &record.fields {
        if COMPANY_SKIP_FIELDS.contains(&key.as_str()) {
            continue;
        }
        // Company-derived columns stay visually distinct from profile
        // columns in the shared sheet.
        let name = format!("enriched_{key}");
        updates.push(FieldUpdate {
            priority: field_priority(&name),
            value: format_value(value),
            name,
        });
    }
    order_field_updates(updates)
}

fn lead_stub_row(stub: &EntityStub) -> Vec<String> {
    vec![
        stub.url.clone().unwrap_or_default(),
        stub.name.clone().unwrap_or_default(),
    ]
}

fn company_stub_row(stub: &EntityStub) -> Vec<String> {
    vec![
        stub.url.clone().unwrap_or_default(),
        stub.name.clone().unwrap_or_default(),
        stub.industry.clone().unwrap_or_default(),
        stub.location.clone().unwrap_or_default(),
    ]
}

fn is_quota_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StoreError>(),
            Some(StoreError::QuotaExceeded)
        )
    })
}

/// Merges downloaded snapshot payloads into the leads worksheet and the
/// satellite discovered-entity sheets. Idempotent per job id via the
/// `updated` state set.
pub struct SheetMerger<'a> {
    store: &'a dyn TabularStore,
    state: &'a SnapshotStateStore,
    config: &'a EnrichConfig,
}

impl<'a> SheetMerger<'a> {
    pub fn new(
        store: &'a dyn TabularStore,
        state: &'a SnapshotStateStore,
        config: &'a EnrichConfig,
    ) -> Self {
        Self {
            store,
            state,
            config,
        }
    }

    /// Merge one payload. A quota-exceeded failure waits `quota_wait` and
    /// retries the whole pass exactly once; the id only enters `updated`
    /// after an error-free pass.
    pub async fn merge(&self, kind: EntityKind, job_id: &str, payload: &[Value]) -> Result<()> {
        let updated = self.state.load(kind, StatePhase::Updated).await?;
        if updated.contains(job_id) {
            info!(job_id, %kind, "snapshot already merged into sheet, skipping");
            return Ok(());
        }

        let mut quota_retries_left = 1;
        loop {
            match self.merge_pass(kind, payload).await {
                Ok(()) => break,
                Err(err) if is_quota_error(&err) && quota_retries_left > 0 => {
                    quota_retries_left -= 1;
                    warn!(
                        job_id,
                        wait_secs = self.config.quota_wait.as_secs(),
                        "sheet write quota exceeded, waiting before one retry"
                    );
                    sleep(self.config.quota_wait).await;
                }
                Err(err) => return Err(err),
            }
        }

        self.state.record(kind, StatePhase::Updated, job_id).await?;
        info!(job_id, %kind, "snapshot merged into sheet");
        Ok(())
    }

    async fn merge_pass(&self, kind: EntityKind, payload: &[Value]) -> Result<()> {
        let mut schema = ColumnSchema::load(self.store, &self.config.leads_worksheet).await?;
        match kind {
            EntityKind::Profile => self.merge_profiles(&mut schema, payload).await,
            EntityKind::Company => self.merge_companies(&mut schema, payload).await,
        }
    }

    async fn merge_profiles(&self, schema: &mut ColumnSchema, payload: &[Value]) -> Result<()> {
        let link_col = schema.column_of(&self.config.link_column).with_context(|| {
            format!("column '{}' not found in sheet", self.config.link_column)
        })?;
        let index =
            RowIndex::for_profiles(self.store, &self.config.leads_worksheet, link_col).await?;

        let mut stubs = Vec::new();
        for raw in payload {
            let mut record: ProfileRecord = match serde_json::from_value(raw.clone()) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%err, "skipping malformed profile record");
                    continue;
                }
            };
            let Some(input_url) = record.input_url.as_deref() else {
                continue;
            };
            // Discovered entities are kept even when the seed row is gone.
            stubs.append(&mut record.similar_profiles);
            stubs.append(&mut record.people_also_viewed);
            let Some(row) = index.find(input_url) else {
                warn!(url = input_url, "no matching row for profile, skipping");
                continue;
            };
            self.write_row_updates(schema, row, profile_field_updates(&record))
                .await?;
            info!(url = input_url, row, "merged profile record");
        }

        self.append_discovered(
            &self.config.similar_leads_worksheet,
            &["linkedin_person_url", "name"],
            &stubs,
            lead_stub_row,
        )
        .await
    }

    async fn merge_companies(&self, schema: &mut ColumnSchema, payload: &[Value]) -> Result<()> {
        let company_col = schema
            .column_of(&self.config.company_column)
            .with_context(|| {
                format!("column '{}' not found in sheet", self.config.company_column)
            })?;
        let index =
            RowIndex::for_companies(self.store, &self.config.leads_worksheet, company_col).await?;

        let mut stubs = Vec::new();
        for raw in payload {
            let mut record: CompanyRecord = match serde_json::from_value(raw.clone()) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%err, "skipping malformed company record");
                    continue;
                }
            };
            let Some(input_url) = record.input.as_ref().and_then(|input| input.url.as_deref())
            else {
                continue;
            };
            // Discovered entities are kept even when the seed row is gone.
            stubs.append(&mut record.similar);
            let Some(row) = index.find(input_url) else {
                warn!(url = input_url, "no matching row for company, skipping");
                continue;
            };
            self.write_row_updates(schema, row, company_field_updates(&record))
                .await?;
            info!(url = input_url, row, "merged company record");
        }

        self.append_discovered(
            &self.config.similar_companies_worksheet,
            &["linkedin_company_url", "name", "industry", "location"],
            &stubs,
            company_stub_row,
        )
        .await
    }

    async fn write_row_updates(
        &self,
        schema: &mut ColumnSchema,
        row: usize,
        updates: Vec<FieldUpdate>,
    ) -> Result<()> {
        let worksheet = &self.config.leads_worksheet;
        let mut writes = Vec::with_capacity(updates.len());
        for update in updates {
            let col = schema
                .resolve_column(self.store, worksheet, &update.name, self.config.rate_limit_delay)
                .await?;
            writes.push(CellWrite {
                row,
                col,
                value: update.value,
            });
        }
        for batch in writes.chunks(self.config.write_batch_size.max(1)) {
            self.store
                .batch_write(worksheet, batch)
                .await
                .context("writing cell batch")?;
            sleep(self.config.rate_limit_delay).await;
        }
        Ok(())
    }

    async fn append_discovered(
        &self,
        worksheet: &str,
        headers: &[&str],
        stubs: &[EntityStub],
        to_row: fn(&EntityStub) -> Vec<String>,
    ) -> Result<()> {
        if stubs.is_empty() {
            return Ok(());
        }
        self.store
            .ensure_worksheet(worksheet)
            .await
            .with_context(|| format!("ensuring worksheet {worksheet}"))?;

        let grid = self
            .store
            .read_all(worksheet)
            .await
            .with_context(|| format!("reading worksheet {worksheet}"))?;
        let has_headers = grid
            .first()
            .and_then(|row| row.first())
            .map(|cell| cell == headers[0])
            .unwrap_or(false);
        if !has_headers {
            let header_writes: Vec<CellWrite> = headers
                .iter()
                .enumerate()
                .map(|(idx, header)| CellWrite {
                    row: 1,
                    col: idx + 1,
                    value: header.to_string(),
                })
                .collect();
            self.store
                .batch_write(worksheet, &header_writes)
                .await
                .with_context(|| format!("writing headers of worksheet {worksheet}"))?;
        }

        // Dedup against both the sheet and stubs seen earlier in this batch.
        let existing: HashSet<String> = self
            .store
            .read_column(worksheet, 1)
            .await
            .with_context(|| format!("reading existing URLs of worksheet {worksheet}"))?
            .into_iter()
            .skip(1)
            .filter(|value| !value.is_empty())
            .collect();
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for stub in stubs {
            let Some(url) = stub.url.as_deref() else {
                continue;
            };
            if existing.contains(url) || !seen.insert(url.to_string()) {
                continue;
            }
            rows.push(to_row(stub));
        }

        if rows.is_empty() {
            info!(worksheet, "no new discovered entities to append");
            return Ok(());
        }
        self.store
            .append_rows(worksheet, &rows)
            .await
            .context("appending discovered entities")?;
        info!(worksheet, added = rows.len(), "appended discovered entities");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PollSummary {
    pub downloaded: usize,
}

/// Drives the snapshot lifecycle: sweep pending merges, then poll the job
/// service until every listed job is drained.
pub struct SnapshotPoller<'a> {
    jobs: &'a dyn ScrapeJobService,
    state: &'a SnapshotStateStore,
    cache: &'a PayloadCache,
    merger: SheetMerger<'a>,
    config: &'a EnrichConfig,
}

impl<'a> SnapshotPoller<'a> {
    pub fn new(
        jobs: &'a dyn ScrapeJobService,
        store: &'a dyn TabularStore,
        state: &'a SnapshotStateStore,
        cache: &'a PayloadCache,
        config: &'a EnrichConfig,
    ) -> Self {
        Self {
            jobs,
            state,
            cache,
            merger: SheetMerger::new(store, state, config),
            config,
        }
    }

    pub async fn run(&self, kind: EntityKind) -> Result<PollSummary> {
        self.sweep_pending(kind).await?;

        let dataset_id = self.config.dataset_id(kind)?;
        let from = self.lookback_threshold();
        info!(%kind, %from, "polling for snapshots created after threshold");

        let mut summary = PollSummary::default();
        loop {
            let listed = self
                .jobs
                .list(dataset_id, from, None)
                .await
                .context("listing snapshots")?;
            if listed.is_empty() {
                info!(%kind, "no snapshots listed yet, waiting");
                sleep(self.config.poll_interval).await;
                continue;
            }

            let running = listed
                .iter()
                .filter(|job| job.status == SnapshotStatus::Running)
                .count();
            if running > 0 {
                info!(%kind, running, "snapshots still running");
            }

            let processed = self.state.load(kind, StatePhase::Processed).await?;
            for job in listed
                .iter()
                .filter(|job| job.status == SnapshotStatus::Ready)
            {
                if processed.contains(&job.id) {
                    continue;
                }
                info!(id = %job.id, %kind, "downloading snapshot");
                let payload = match self.jobs.fetch(&job.id).await {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%err, id = %job.id, "failed to download snapshot");
                        continue;
                    }
                };
                self.cache.store(kind, &job.id, &payload).await?;
                self.state
                    .record(kind, StatePhase::Processed, &job.id)
                    .await?;
                summary.downloaded += 1;
                if let Err(err) = self.merger.merge(kind, &job.id, &payload).await {
                    warn!(%err, id = %job.id, "merge failed; snapshot stays pending for the next sweep");
                }
            }

            if running == 0 {
                let processed = self.state.load(kind, StatePhase::Processed).await?;
                let drained = listed
                    .iter()
                    .filter(|job| job.status == SnapshotStatus::Ready)
                    .all(|job| processed.contains(&job.id));
                if drained {
                    info!(%kind, downloaded = summary.downloaded, "all snapshots processed");
                    return Ok(summary);
                }
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Re-merge cached payloads that were downloaded but never fully merged
    /// (crash between download and merge), without re-downloading.
    async fn sweep_pending(&self, kind: EntityKind) -> Result<()> {
        let processed = self.state.load(kind, StatePhase::Processed).await?;
        let updated = self.state.load(kind, StatePhase::Updated).await?;
        for id in self.cache.cached_ids(kind).await? {
            if !processed.contains(&id) || updated.contains(&id) {
                continue;
            }
            info!(id, %kind, "re-merging snapshot pending sheet update");
            let payload = self.cache.load(kind, &id).await?;
            if let Err(err) = self.merger.merge(kind, &id, &payload).await {
                warn!(%err, id, "pending merge failed; will retry on the next run");
            }
        }
        Ok(())
    }

    fn lookback_threshold(&self) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::days(self.config.lookback_days)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScoreSummary {
    pub scored: usize,
}

fn parse_score(reply: &str) -> f64 {
    match reply.trim().parse::<f64>() {
        Ok(score) if score.is_finite() => score.clamp(0.0, 10.0),
        _ => {
            warn!(reply, "completion reply was not a finite number, defaulting to 0");
            0.0
        }
    }
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 {
        format!("{}", score as i64)
    } else {
        score.to_string()
    }
}

/// Scores every row lacking a score via the completion service.
pub struct LeadScorer<'a> {
    store: &'a dyn TabularStore,
    completions: &'a dyn CompletionService,
    config: &'a EnrichConfig,
}

impl<'a> LeadScorer<'a> {
    pub fn new(
        store: &'a dyn TabularStore,
        completions: &'a dyn CompletionService,
        config: &'a EnrichConfig,
    ) -> Self {
        Self {
            store,
            completions,
            config,
        }
    }

    pub async fn score_all(&self) -> Result<ScoreSummary> {
        let worksheet = &self.config.leads_worksheet;
        let grid = self
            .store
            .read_all(worksheet)
            .await
            .context("reading leads worksheet")?;
        let headers = grid.first().context("leads worksheet has no header row")?;

        // The score column lives at column 2. A column found elsewhere is
        // relocated by delete-old/insert-new, not moved in place.
        let score_col = 2;
        match headers
            .iter()
            .position(|header| header == &self.config.score_column)
        {
            Some(1) => {}
            Some(idx) => {
                self.store
                    .delete_column(worksheet, idx + 1)
                    .await
                    .context("deleting misplaced score column")?;
                self.store
                    .insert_column(worksheet, score_col, &self.config.score_column)
                    .await
                    .context("inserting score column")?;
            }
            None => {
                self.store
                    .insert_column(worksheet, score_col, &self.config.score_column)
                    .await
                    .context("inserting score column")?;
            }
        }

        // Column positions may have shifted; re-read before scoring.
        let grid = self
            .store
            .read_all(worksheet)
            .await
            .context("re-reading leads worksheet")?;
        let headers = grid.first().cloned().unwrap_or_default();

        let mut summary = ScoreSummary::default();
        for (idx, row) in grid.iter().enumerate().skip(1) {
            let row_number = idx + 1;
            let current = row
                .get(score_col - 1)
                .map(String::as_str)
                .unwrap_or_default();
            if !current.trim().is_empty() {
                continue;
            }

            let prompt = self.build_prompt(&headers, row);
            let score = match self
                .completions
                .complete(&self.config.scoring_system_prompt, &prompt)
                .await
            {
                Ok(reply) => parse_score(&reply),
                Err(err) => {
                    warn!(%err, row = row_number, "completion call failed, scoring 0");
                    0.0
                }
            };

            match self
                .store
                .write_cell(worksheet, row_number, score_col, &format_score(score))
                .await
            {
                Ok(()) => summary.scored += 1,
                Err(err) => warn!(%err, row = row_number, "failed to write score"),
            }
            sleep(self.config.rate_limit_delay).await;
        }
        Ok(summary)
    }

    fn build_prompt(&self, headers: &[String], row: &[String]) -> String {
        let mut prompt = self.config.scoring_prompt_template.clone();
        for field in &self.config.scoring_fields {
            let value = headers
                .iter()
                .position(|header| header == &field.column)
                .and_then(|idx| row.get(idx))
                .map(String::as_str)
                .unwrap_or_default();
            prompt = prompt.replace(&format!("{{{}}}", field.placeholder), value);
        }
        prompt
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub profiles: SubmitSummary,
    pub profiles_downloaded: usize,
    pub companies: SubmitSummary,
    pub companies_downloaded: usize,
    pub rows_scored: usize,
}

/// Full enrichment run: profile submit + poll, company submit + poll, score.
pub struct EnrichmentPipeline<'a> {
    store: &'a dyn TabularStore,
    jobs: &'a dyn ScrapeJobService,
    completions: &'a dyn CompletionService,
    config: EnrichConfig,
    state: SnapshotStateStore,
    cache: PayloadCache,
}

impl<'a> EnrichmentPipeline<'a> {
    pub fn new(
        store: &'a dyn TabularStore,
        jobs: &'a dyn ScrapeJobService,
        completions: &'a dyn CompletionService,
        config: EnrichConfig,
    ) -> Self {
        let state = SnapshotStateStore::new(&config.state_dir);
        let cache = PayloadCache::new(&config.snapshots_dir);
        Self {
            store,
            jobs,
            completions,
            config,
            state,
            cache,
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting enrichment run");

        let grid = self
            .store
            .read_all(&self.config.leads_worksheet)
            .await
            .context("reading seed worksheet")?;
        let profile_links = collect_profile_links(&grid, &self.config.link_column)?;
        info!(count = profile_links.len(), "collected profile links");

        let poller =
            SnapshotPoller::new(self.jobs, self.store, &self.state, &self.cache, &self.config);

        let profiles = submit_urls(
            self.jobs,
            self.config.dataset_id(EntityKind::Profile)?,
            &profile_links,
            &self.config,
        )
        .await?;
        let profile_poll = poller.run(EntityKind::Profile).await?;

        // The current_company column only carries data after profile merges.
        let grid = self
            .store
            .read_all(&self.config.leads_worksheet)
            .await
            .context("re-reading worksheet for company links")?;
        let company_links = collect_company_links(&grid, &self.config.company_column);
        info!(count = company_links.len(), "collected company links");

        let (companies, company_poll) = if company_links.is_empty() {
            info!("no company links found yet, skipping company enrichment");
            (SubmitSummary::default(), PollSummary::default())
        } else {
            let companies = submit_urls(
                self.jobs,
                self.config.dataset_id(EntityKind::Company)?,
                &company_links,
                &self.config,
            )
            .await?;
            let company_poll = poller.run(EntityKind::Company).await?;
            (companies, company_poll)
        };

        let scorer = LeadScorer::new(self.store, self.completions, &self.config);
        let scores = scorer.score_all().await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            profiles,
            profiles_downloaded: profile_poll.downloaded,
            companies,
            companies_downloaded: company_poll.downloaded,
            rows_scored: scores.scored,
        };
        info!(
            %run_id,
            profiles = summary.profiles_downloaded,
            companies = summary.companies_downloaded,
            scored = summary.rows_scored,
            "enrichment run finished"
        );
        Ok(summary)
    }
}
