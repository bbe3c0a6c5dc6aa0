//! Remote registry adapter: listing page link discovery, CSV decoding and parsing.

use async_trait::async_trait;
use emreg_core::{RemoteEntry, RemoteSnapshot};
use emreg_storage::{sha256_hex, FetchError, HttpFetcher};
use encoding_rs::WINDOWS_1251;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "emreg-adapters";

const FIELD_DELIMITER: char = ';';
const NAME_COLUMN: usize = 1;
const DATE_COLUMN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Origin the listing path and the discovered CSV href are appended to.
    pub base_url: String,
    pub listing_path: String,
    /// Drop the first CSV row before parsing.
    #[serde(default)]
    pub skip_header: bool,
}

impl SourceConfig {
    pub fn listing_url(&self) -> String {
        format!("{}{}", self.base_url, self.listing_path)
    }

    /// Plain concatenation: hrefs are expected to be root-relative.
    /// An absolute href ends up with the origin twice.
    pub fn resolve_href(&self, href: &str) -> String {
        format!("{}{}", self.base_url, href)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no .csv link found on {page_url}")]
    LinkNotFound { page_url: String },
    #[error("invalid selector: {0}")]
    Selector(String),
}

/// Decodes a Windows-1251 payload. Every byte value maps to a code point,
/// so decoding cannot fail.
pub fn decode_windows_1251(bytes: &[u8]) -> String {
    let (text, _had_errors) = WINDOWS_1251.decode_without_bom_handling(bytes);
    text.into_owned()
}

/// Returns the first `<a href>` in document order whose href contains `.csv`.
pub fn find_csv_link(html: &str) -> Result<Option<String>, SourceError> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").map_err(|e| SourceError::Selector(e.to_string()))?;
    Ok(document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| href.contains(".csv"))
        .map(ToString::to_string))
}

/// Upstream quoting is inconsistent, so every double quote in a name becomes a single quote.
pub fn normalize_name(raw: &str) -> String {
    raw.replace('"', "'")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCsv {
    pub entries: Vec<RemoteEntry>,
    pub skipped_rows: usize,
}

impl ParsedCsv {
    /// Folds rows into a snapshot; a repeated name keeps the later row.
    pub fn into_snapshot(self) -> RemoteSnapshot {
        self.entries
            .into_iter()
            .map(|entry| (entry.name, entry.inclusion_date))
            .collect()
    }
}

/// Splits `;` delimited text into records with lazy quoting.
///
/// A field that opens with `"` is quoted: `""` is an escaped quote and a `"`
/// followed by anything but `;` or the line end is kept as a literal. Quoted
/// fields may span lines. A field that does not open with `"` is taken as is.
/// Blank lines yield no record.
pub struct LazyRecords<'a> {
    lines: std::str::SplitInclusive<'a, char>,
}

impl<'a> LazyRecords<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            lines: text.split_inclusive('\n'),
        }
    }
}

fn strip_line_end(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

impl Iterator for LazyRecords<'_> {
    type Item = Vec<String>;

    fn next(&mut self) -> Option<Vec<String>> {
        let mut line = loop {
            let line = self.lines.next()?;
            if !strip_line_end(line).is_empty() {
                break line;
            }
        };

        let mut fields = Vec::new();
        loop {
            let Some(quoted) = line.strip_prefix('"') else {
                match line.find(FIELD_DELIMITER) {
                    Some(end) => {
                        fields.push(line[..end].to_string());
                        line = &line[end + 1..];
                        continue;
                    }
                    None => {
                        fields.push(strip_line_end(line).to_string());
                        return Some(fields);
                    }
                }
            };

            line = quoted;
            let mut field = String::new();
            loop {
                if let Some(quote) = line.find('"') {
                    field.push_str(&line[..quote]);
                    line = &line[quote + 1..];
                    if let Some(rest) = line.strip_prefix('"') {
                        field.push('"');
                        line = rest;
                    } else if let Some(rest) = line.strip_prefix(FIELD_DELIMITER) {
                        line = rest;
                        break;
                    } else if strip_line_end(line).is_empty() {
                        fields.push(field);
                        return Some(fields);
                    } else {
                        field.push('"');
                    }
                } else if !line.is_empty() {
                    field.push_str(line);
                    match self.lines.next() {
                        Some(next) => line = next,
                        None => {
                            fields.push(field);
                            return Some(fields);
                        }
                    }
                } else {
                    fields.push(field);
                    return Some(fields);
                }
            }
            fields.push(field);
        }
    }
}

/// Parses `id;name;date` rows. Stray quotes are kept literally and rows that
/// lack a name/date column are skipped. The name is kept byte for byte apart
/// from the quote replacement.
pub fn parse_registry_csv(text: &str, skip_header: bool) -> ParsedCsv {
    let mut parsed = ParsedCsv::default();
    let records = LazyRecords::new(text).skip(usize::from(skip_header));

    for (index, record) in records.enumerate() {
        let (Some(name), Some(date)) = (record.get(NAME_COLUMN), record.get(DATE_COLUMN)) else {
            parsed.skipped_rows += 1;
            debug!(fields = record.len(), record = index, "skipping short csv row");
            continue;
        };
        if name.is_empty() {
            parsed.skipped_rows += 1;
            continue;
        }

        parsed.entries.push(RemoteEntry {
            name: normalize_name(name),
            inclusion_date: date.clone(),
        });
    }

    parsed
}

/// Result of pulling one full snapshot from the registry.
#[derive(Debug, Clone)]
pub struct RemoteFetch {
    pub csv_url: String,
    pub csv_sha256: String,
    pub skipped_rows: usize,
    pub snapshot: RemoteSnapshot,
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_snapshot(&self, run_id: Uuid) -> Result<RemoteFetch, SourceError>;
}

#[derive(Debug, Clone)]
pub struct RemoteSnapshotFetcher {
    http: HttpFetcher,
    config: SourceConfig,
}

impl RemoteSnapshotFetcher {
    pub fn new(http: HttpFetcher, config: SourceConfig) -> Self {
        Self { http, config }
    }

    async fn discover_csv_url(&self, run_id: Uuid) -> Result<String, SourceError> {
        let page_url = self.config.listing_url();
        info!(%run_id, phase = "fetch", url = %page_url, "fetching listing page");
        let page = self.http.fetch_bytes(run_id, &page_url).await?;
        info!(
            %run_id,
            phase = "fetch",
            status = page.status.as_u16(),
            final_url = %page.final_url,
            bytes = page.body.len(),
            "fetched listing page"
        );

        info!(%run_id, phase = "parse", "searching listing page for csv link");
        let html = String::from_utf8_lossy(&page.body);
        match find_csv_link(&html)? {
            Some(href) => Ok(self.config.resolve_href(&href)),
            None => Err(SourceError::LinkNotFound { page_url }),
        }
    }
}

#[async_trait]
impl RemoteSource for RemoteSnapshotFetcher {
    async fn fetch_snapshot(&self, run_id: Uuid) -> Result<RemoteFetch, SourceError> {
        let csv_url = self.discover_csv_url(run_id).await?;

        info!(%run_id, phase = "fetch", url = %csv_url, "fetching registry csv");
        let csv = self.http.fetch_bytes(run_id, &csv_url).await?;
        let csv_sha256 = sha256_hex(&csv.body);
        info!(
            %run_id,
            phase = "fetch",
            status = csv.status.as_u16(),
            final_url = %csv.final_url,
            bytes = csv.body.len(),
            "fetched registry csv"
        );

        let text = decode_windows_1251(&csv.body);
        let parsed = parse_registry_csv(&text, self.config.skip_header);
        let skipped_rows = parsed.skipped_rows;
        let rows = parsed.entries.len();
        let snapshot = parsed.into_snapshot();
        info!(
            %run_id,
            phase = "parse",
            rows,
            skipped_rows,
            materials = snapshot.len(),
            sha256 = %csv_sha256,
            "parsed registry csv"
        );
        if skipped_rows > 0 {
            warn!(%run_id, skipped_rows, "registry csv contained unreadable rows");
        }

        Ok(RemoteFetch {
            csv_url,
            csv_sha256,
            skipped_rows,
            snapshot,
        })
    }
}
