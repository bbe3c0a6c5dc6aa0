//! Material store + HTTP fetch utilities for the registry reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use emreg_core::{LocalSnapshot, MaterialId, MaterialRecord, NewMaterial};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "emreg-storage";

/// Table holding the local copy of the registry.
pub const MATERIAL_TABLE: &str = "extremist_material";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(300),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Single GET with no retry. Any transport failure or non-2xx status is an error.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async {
            let request_error = |source| FetchError::Request {
                url: url.to_string(),
                source,
            };

            let resp = self.client.get(url).send().await.map_err(request_error)?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await.map_err(request_error)?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("material already exists: {0}")]
    Duplicate(String),
}

/// Read-all / insert-batch / delete-batch view of the registry table.
#[async_trait]
pub trait MaterialStore: Send + Sync {
    /// Reads the whole table in one call; the diff needs a complete view.
    async fn load_snapshot(&self) -> Result<LocalSnapshot, StoreError>;

    /// Inserts every record as a single batch. Returns the number of rows written.
    async fn insert_batch(&self, records: &[NewMaterial]) -> Result<u64, StoreError>;

    /// Deletes every row whose id is listed, in one call. Returns the number of rows removed.
    async fn delete_batch(&self, ids: &[MaterialId]) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl StoreConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

#[derive(Debug, Clone)]
pub struct PgMaterialStore {
    pool: PgPool,
    table: String,
}

impl PgMaterialStore {
    /// Builds a lazily connecting pool; connectivity problems surface on first use.
    pub fn new(config: &StoreConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy_with(config.connect_options());
        Self::with_pool(pool)
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            table: MATERIAL_TABLE.to_string(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }
}

#[async_trait]
impl MaterialStore for PgMaterialStore {
    async fn load_snapshot(&self) -> Result<LocalSnapshot, StoreError> {
        let sql = format!("SELECT id, material FROM {}", self.table);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut snapshot = LocalSnapshot::with_capacity(rows.len());
        for row in rows {
            let id: MaterialId = row.try_get("id")?;
            let name: String = row.try_get("material")?;
            snapshot.insert(name, id);
        }
        Ok(snapshot)
    }

    async fn insert_batch(&self, records: &[NewMaterial]) -> Result<u64, StoreError> {
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        let dates: Vec<Option<NaiveDate>> = records.iter().map(|r| r.inclusion_date).collect();

        // One statement regardless of batch size; UNNEST avoids the bind parameter limit.
        let sql = format!(
            r#"
            INSERT INTO {} (material, inclusion_date)
            SELECT * FROM UNNEST($1::text[], $2::date[])
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(names)
            .bind(dates)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_batch(&self, ids: &[MaterialId]) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = ANY($1)", self.table);
        let result = sqlx::query(&sql).bind(ids).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<MaterialId, MaterialRecord>,
    next_id: MaterialId,
    unavailable: bool,
    insert_calls: Vec<Vec<NewMaterial>>,
    delete_calls: Vec<Vec<MaterialId>>,
}

/// In-process store that records every write call. Used for dry local runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryMaterialStore {
    state: Mutex<MemoryState>,
}

impl InMemoryMaterialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = MaterialRecord>) -> Self {
        let mut state = MemoryState::default();
        for record in records {
            state.next_id = state.next_id.max(record.id);
            state.rows.insert(record.id, record);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Makes every subsequent call fail as if the database were unreachable.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn records(&self) -> Vec<MaterialRecord> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn insert_calls(&self) -> Vec<Vec<NewMaterial>> {
        self.state.lock().await.insert_calls.clone()
    }

    pub async fn delete_calls(&self) -> Vec<Vec<MaterialId>> {
        self.state.lock().await.delete_calls.clone()
    }
}

fn ensure_available(state: &MemoryState) -> Result<(), StoreError> {
    if state.unavailable {
        return Err(StoreError::Unavailable("in-memory store marked offline".into()));
    }
    Ok(())
}

#[async_trait]
impl MaterialStore for InMemoryMaterialStore {
    async fn load_snapshot(&self) -> Result<LocalSnapshot, StoreError> {
        let state = self.state.lock().await;
        ensure_available(&state)?;
        Ok(state
            .rows
            .values()
            .map(|r| (r.name.clone(), r.id))
            .collect())
    }

    async fn insert_batch(&self, records: &[NewMaterial]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;
        state.insert_calls.push(records.to_vec());

        // All-or-nothing, like a single INSERT against a unique column.
        if let Some(dup) = records
            .iter()
            .find(|r| state.rows.values().any(|row| row.name == r.name))
        {
            return Err(StoreError::Duplicate(dup.name.clone()));
        }

        for record in records {
            state.next_id += 1;
            let id = state.next_id;
            state.rows.insert(
                id,
                MaterialRecord {
                    id,
                    name: record.name.clone(),
                    inclusion_date: record.inclusion_date,
                },
            );
        }
        Ok(records.len() as u64)
    }

    async fn delete_batch(&self, ids: &[MaterialId]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;
        state.delete_calls.push(ids.to_vec());
        let removed = ids.iter().filter(|id| state.rows.remove(*id).is_some()).count();
        Ok(removed as u64)
    }
}
