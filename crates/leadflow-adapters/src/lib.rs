//! External collaborator seams: the tabular store, the scraping job service,
//! and the completion service, plus reqwest-backed and fixture-first
//! implementations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use leadflow_core::{JobRecord, SnapshotStatus};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "leadflow-adapters";

/// One pending cell update. Addressing is 1-based; row 1 holds headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellWrite {
    pub row: usize,
    pub col: usize,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The remote store rejected a write for quota reasons; callers wait and
    /// retry the whole operation once.
    #[error("write quota exceeded")]
    QuotaExceeded,
    #[error("{0}")]
    Other(String),
}

/// Generic tabular key-value store with row/column addressing.
#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn read_all(&self, worksheet: &str) -> Result<Vec<Vec<String>>, StoreError>;
    async fn read_column(&self, worksheet: &str, col: usize) -> Result<Vec<String>, StoreError>;
    async fn write_cell(
        &self,
        worksheet: &str,
        row: usize,
        col: usize,
        value: &str,
    ) -> Result<(), StoreError>;
    async fn batch_write(&self, worksheet: &str, writes: &[CellWrite]) -> Result<(), StoreError>;
    async fn append_rows(&self, worksheet: &str, rows: &[Vec<String>]) -> Result<(), StoreError>;
    async fn insert_column(
        &self,
        worksheet: &str,
        col: usize,
        header: &str,
    ) -> Result<(), StoreError>;
    async fn delete_column(&self, worksheet: &str, col: usize) -> Result<(), StoreError>;
    async fn ensure_worksheet(&self, worksheet: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum JobServiceError {
    #[error("http status {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Asynchronous scraping job service: submit seed URLs, list job statuses,
/// fetch result payloads.
#[async_trait]
pub trait ScrapeJobService: Send + Sync {
    async fn submit(&self, dataset_id: &str, urls: &[String]) -> Result<(), JobServiceError>;
    async fn list(
        &self,
        dataset_id: &str,
        from: DateTime<Utc>,
        status: Option<SnapshotStatus>,
    ) -> Result<Vec<JobRecord>, JobServiceError>;
    async fn fetch(&self, job_id: &str) -> Result<Vec<Value>, JobServiceError>;
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("http status {0} from completion endpoint")]
    HttpStatus(u16),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed completion response: {0}")]
    MalformedResponse(String),
}

/// External text-completion service used for lead scoring.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, CompletionError>;
}

#[derive(Debug, Clone)]
pub struct HttpJobServiceConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout: Duration,
}

impl Default for HttpJobServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.brightdata.com/datasets/v3".to_string(),
            api_token: String::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Bearer-authenticated client for the provider's dataset API.
#[derive(Debug)]
pub struct HttpJobService {
    client: reqwest::Client,
    config: HttpJobServiceConfig,
}

impl HttpJobService {
    pub fn new(config: HttpJobServiceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building job service client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ScrapeJobService for HttpJobService {
    async fn submit(&self, dataset_id: &str, urls: &[String]) -> Result<(), JobServiceError> {
        let endpoint = format!("{}/trigger", self.config.base_url);
        let body: Vec<Value> = urls
            .iter()
            .map(|url| serde_json::json!({ "url": url }))
            .collect();
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.config.api_token)
            .query(&[("dataset_id", dataset_id), ("include_errors", "true")])
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(JobServiceError::HttpStatus {
                status: status.as_u16(),
                endpoint,
            });
        }
        debug!(dataset_id, urls = urls.len(), "submitted scrape batch");
        Ok(())
    }

    async fn list(
        &self,
        dataset_id: &str,
        from: DateTime<Utc>,
        status: Option<SnapshotStatus>,
    ) -> Result<Vec<JobRecord>, JobServiceError> {
        let endpoint = format!("{}/snapshots", self.config.base_url);
        let mut query = vec![
            ("dataset_id", dataset_id.to_string()),
            (
                "from_date",
                from.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ];
        if let Some(status) = status {
            query.push(("status", status.as_str().to_string()));
        }
        let response = self
            .client
            .get(&endpoint)
            .bearer_auth(&self.config.api_token)
            .query(&query)
            .send()
            .await?;
        let http_status = response.status();
        if !http_status.is_success() {
            return Err(JobServiceError::HttpStatus {
                status: http_status.as_u16(),
                endpoint,
            });
        }
        Ok(response.json::<Vec<JobRecord>>().await?)
    }

    async fn fetch(&self, job_id: &str) -> Result<Vec<Value>, JobServiceError> {
        let endpoint = format!("{}/snapshot/{job_id}", self.config.base_url);
        let response = self
            .client
            .get(&endpoint)
            .bearer_auth(&self.config.api_token)
            .query(&[("format", "json")])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(JobServiceError::HttpStatus {
                status: status.as_u16(),
                endpoint,
            });
        }
        Ok(response.json::<Vec<Value>>().await?)
    }
}

#[derive(Debug, Clone)]
pub struct HttpCompletionConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for HttpCompletionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Chat-completions client for the scoring model.
#[derive(Debug)]
pub struct HttpCompletionService {
    client: reqwest::Client,
    config: HttpCompletionConfig,
}

impl HttpCompletionService {
    pub fn new(config: HttpCompletionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building completion client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, CompletionError> {
        let endpoint = format!("{}/chat/completions", self.config.base_url);
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CompletionError::HttpStatus(status.as_u16()));
        }
        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| CompletionError::MalformedResponse("no choices in reply".to_string()))
    }
}

type Grid = Vec<Vec<String>>;

fn grid_write_cell(grid: &mut Grid, row: usize, col: usize, value: &str) {
    while grid.len() < row {
        grid.push(Vec::new());
    }
    let cells = &mut grid[row - 1];
    if cells.len() < col {
        cells.resize(col, String::new());
    }
    cells[col - 1] = value.to_string();
}

fn grid_read_column(grid: &Grid, col: usize) -> Vec<String> {
    grid.iter()
        .map(|row| row.get(col - 1).cloned().unwrap_or_default())
        .collect()
}

fn grid_insert_column(grid: &mut Grid, col: usize, header: &str) {
    if grid.is_empty() {
        grid.push(Vec::new());
    }
    for (i, row) in grid.iter_mut().enumerate() {
        if i == 0 && row.len() < col - 1 {
            row.resize(col - 1, String::new());
        }
        let idx = (col - 1).min(row.len());
        let value = if i == 0 { header.to_string() } else { String::new() };
        row.insert(idx, value);
    }
}

fn grid_delete_column(grid: &mut Grid, col: usize) {
    for row in grid.iter_mut() {
        if row.len() >= col {
            row.remove(col - 1);
        }
    }
}

/// Fixture-first tabular store backed by in-memory grids, used by pipeline
/// tests in place of the remote spreadsheet.
#[derive(Debug, Default)]
pub struct InMemorySheet {
    worksheets: Mutex<HashMap<String, Grid>>,
}

impl InMemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(worksheet: &str, rows: Grid) -> Self {
        let mut worksheets = HashMap::new();
        worksheets.insert(worksheet.to_string(), rows);
        Self {
            worksheets: Mutex::new(worksheets),
        }
    }

    /// Snapshot of one worksheet for assertions.
    pub async fn rows(&self, worksheet: &str) -> Grid {
        self.worksheets
            .lock()
            .await
            .get(worksheet)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TabularStore for InMemorySheet {
    async fn read_all(&self, worksheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
        Ok(self
            .worksheets
            .lock()
            .await
            .get(worksheet)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_column(&self, worksheet: &str, col: usize) -> Result<Vec<String>, StoreError> {
        let sheets = self.worksheets.lock().await;
        Ok(sheets
            .get(worksheet)
            .map(|grid| grid_read_column(grid, col))
            .unwrap_or_default())
    }

    async fn write_cell(
        &self,
        worksheet: &str,
        row: usize,
        col: usize,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut sheets = self.worksheets.lock().await;
        let grid = sheets.entry(worksheet.to_string()).or_default();
        grid_write_cell(grid, row, col, value);
        Ok(())
    }

    async fn batch_write(&self, worksheet: &str, writes: &[CellWrite]) -> Result<(), StoreError> {
        let mut sheets = self.worksheets.lock().await;
        let grid = sheets.entry(worksheet.to_string()).or_default();
        for write in writes {
            grid_write_cell(grid, write.row, write.col, &write.value);
        }
        Ok(())
    }

    async fn append_rows(&self, worksheet: &str, rows: &[Vec<String>]) -> Result<(), StoreError> {
        let mut sheets = self.worksheets.lock().await;
        let grid = sheets.entry(worksheet.to_string()).or_default();
        grid.extend(rows.iter().cloned());
        Ok(())
    }

    async fn insert_column(
        &self,
        worksheet: &str,
        col: usize,
        header: &str,
    ) -> Result<(), StoreError> {
        let mut sheets = self.worksheets.lock().await;
        let grid = sheets.entry(worksheet.to_string()).or_default();
        grid_insert_column(grid, col, header);
        Ok(())
    }

    async fn delete_column(&self, worksheet: &str, col: usize) -> Result<(), StoreError> {
        let mut sheets = self.worksheets.lock().await;
        if let Some(grid) = sheets.get_mut(worksheet) {
            grid_delete_column(grid, col);
        }
        Ok(())
    }

    async fn ensure_worksheet(&self, worksheet: &str) -> Result<(), StoreError> {
        self.worksheets
            .lock()
            .await
            .entry(worksheet.to_string())
            .or_default();
        Ok(())
    }
}

/// Tabular store persisted to a single local JSON file, for runs without a
/// remote spreadsheet. Every mutation rewrites the file.
#[derive(Debug)]
pub struct JsonFileSheet {
    path: PathBuf,
    worksheets: Mutex<HashMap<String, Grid>>,
}

impl JsonFileSheet {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let worksheets = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking sheet file {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading sheet file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing sheet file {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            worksheets: Mutex::new(worksheets),
        })
    }

    async fn mutate<F>(&self, worksheet: &str, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Grid),
    {
        let snapshot = {
            let mut sheets = self.worksheets.lock().await;
            let grid = sheets.entry(worksheet.to_string()).or_default();
            apply(grid);
            sheets.clone()
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| StoreError::Other(err.to_string()))?;
        fs::write(&self.path, bytes)
            .await
            .map_err(|err| StoreError::Other(format!("writing {}: {err}", self.path.display())))
    }
}

#[async_trait]
impl TabularStore for JsonFileSheet {
    async fn read_all(&self, worksheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
        Ok(self
            .worksheets
            .lock()
            .await
            .get(worksheet)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_column(&self, worksheet: &str, col: usize) -> Result<Vec<String>, StoreError> {
        let sheets = self.worksheets.lock().await;
        Ok(sheets
            .get(worksheet)
            .map(|grid| grid_read_column(grid, col))
            .unwrap_or_default())
    }

    async fn write_cell(
        &self,
        worksheet: &str,
        row: usize,
        col: usize,
        value: &str,
    ) -> Result<(), StoreError> {
        self.mutate(worksheet, |grid| grid_write_cell(grid, row, col, value))
            .await
    }

    async fn batch_write(&self, worksheet: &str, writes: &[CellWrite]) -> Result<(), StoreError> {
        self.mutate(worksheet, |grid| {
            for write in writes {
                grid_write_cell(grid, write.row, write.col, &write.value);
            }
        })
        .await
    }

    async fn append_rows(&self, worksheet: &str, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.mutate(worksheet, |grid| grid.extend(rows.iter().cloned()))
            .await
    }

    async fn insert_column(
        &self,
        worksheet: &str,
        col: usize,
        header: &str,
    ) -> Result<(), StoreError> {
        self.mutate(worksheet, |grid| grid_insert_column(grid, col, header))
            .await
    }

    async fn delete_column(&self, worksheet: &str, col: usize) -> Result<(), StoreError> {
        self.mutate(worksheet, |grid| grid_delete_column(grid, col))
            .await
    }

    async fn ensure_worksheet(&self, worksheet: &str) -> Result<(), StoreError> {
        self.mutate(worksheet, |_grid| ()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn in_memory_sheet_grows_on_out_of_range_writes() {
        let sheet = InMemorySheet::new();
        sheet.write_cell("Leads", 3, 4, "x").await.expect("write");
        let rows = sheet.rows("Leads").await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2][3], "x");
        assert_eq!(rows[0].len(), 0);
    }

    #[tokio::test]
    async fn read_column_pads_short_rows() {
        let sheet = InMemorySheet::with_rows(
            "Leads",
            vec![
                vec!["url".into(), "name".into()],
                vec!["https://a".into()],
                vec!["https://b".into(), "Bob".into()],
            ],
        );
        assert_eq!(
            sheet.read_column("Leads", 2).await.expect("read"),
            vec!["name".to_string(), String::new(), "Bob".to_string()]
        );
    }

    #[tokio::test]
    async fn insert_and_delete_column_shift_cells() {
        let sheet = InMemorySheet::with_rows(
            "Leads",
            vec![
                vec!["url".into(), "name".into()],
                vec!["https://a".into(), "Ann".into()],
            ],
        );
        sheet
            .insert_column("Leads", 2, "lead_score")
            .await
            .expect("insert");
        let rows = sheet.rows("Leads").await;
        assert_eq!(rows[0], vec!["url", "lead_score", "name"]);
        assert_eq!(rows[1], vec!["https://a", "", "Ann"]);

        sheet.delete_column("Leads", 2).await.expect("delete");
        let rows = sheet.rows("Leads").await;
        assert_eq!(rows[0], vec!["url", "name"]);
        assert_eq!(rows[1], vec!["https://a", "Ann"]);
    }

    #[tokio::test]
    async fn json_file_sheet_persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sheet.json");

        let sheet = JsonFileSheet::open(&path).await.expect("open");
        sheet
            .append_rows(
                "Leads",
                &[vec!["url".to_string()], vec!["https://a".to_string()]],
            )
            .await
            .expect("append");
        sheet.write_cell("Leads", 2, 2, "Ann").await.expect("write");
        drop(sheet);

        let reopened = JsonFileSheet::open(&path).await.expect("reopen");
        let rows = reopened.read_all("Leads").await.expect("read");
        assert_eq!(rows[1], vec!["https://a".to_string(), "Ann".to_string()]);
    }
}
