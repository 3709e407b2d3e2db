//! Opportunity sources: the SAM.gov search adapter and the upload table
//! readers that feed raw rows into the projection pipeline chunk by chunk.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use calamine::{Data, DataType, Range, Reader, Sheets, Xls, Xlsx};
use chrono::{Duration, NaiveDate, Utc};
use fcap_core::{RawCell, RawRow};
use fcap_storage::{ApiRequest, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "fcap-adapters";

pub const SAM_GOV_SOURCE_ID: &str = "sam-gov";
pub const SAM_GOV_SEARCH_PATH: &str = "/opportunities/v2/search";

/// Opportunity type values offered by the search form.
pub const OPPORTUNITY_TYPES: [&str; 4] = [
    "Solicitation",
    "Award Notice",
    "Presolicitation",
    "Sources Sought",
];

pub const SET_ASIDE_TYPES: [&str; 5] = ["Small Business", "8(a)", "HUBZone", "SDVOSB", "WOSB"];

const MIME_CSV: &str = "text/csv";
const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const MIME_XLS: &str = "application/vnd.ms-excel";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source `{source_id}` unavailable ({target}): {detail}")]
    SourceUnavailable {
        source_id: String,
        target: String,
        detail: String,
    },
    #[error("unsupported upload format for `{file_name}` (declared type: {declared}): {detail}")]
    UnsupportedFormat {
        file_name: String,
        declared: String,
        detail: String,
    },
}

impl SourceError {
    fn unsupported(file_name: &str, declared: Option<&str>, detail: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            file_name: file_name.to_string(),
            declared: declared.unwrap_or("none").to_string(),
            detail: detail.into(),
        }
    }

    fn unreadable(file_name: &str, detail: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_id: "upload".to_string(),
            target: file_name.to_string(),
            detail: detail.into(),
        }
    }
}

/// Search form state. Saved per session and replayed against the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub naics: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default = "default_date_range_days")]
    pub date_range_days: u32,
    #[serde(default)]
    pub opportunity_type: Option<String>,
    #[serde(default)]
    pub set_aside: Option<String>,
}

fn default_date_range_days() -> u32 {
    30
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            naics: None,
            agency: None,
            date_range_days: default_date_range_days(),
            opportunity_type: None,
            set_aside: None,
        }
    }
}

impl SearchFilters {
    /// Query parameters for the search endpoint, posted window ending `today`.
    /// The day range is clamped to 1..=365.
    pub fn query_params(&self, today: NaiveDate, limit: u32) -> Vec<(String, String)> {
        let days = self.date_range_days.clamp(1, 365);
        let from = today - Duration::days(i64::from(days));
        let mut params = vec![
            ("postedFrom".to_string(), from.format("%m/%d/%Y").to_string()),
            ("postedTo".to_string(), today.format("%m/%d/%Y").to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(naics) = non_blank(self.naics.as_deref()) {
            params.push(("ncode".to_string(), naics));
        }
        if let Some(agency) = non_blank(self.agency.as_deref()) {
            params.push(("organizationName".to_string(), agency));
        }
        if let Some(kind) = non_blank(self.opportunity_type.as_deref()) {
            params.push(("type".to_string(), kind));
        }
        params
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// One page of API results: rows in response order plus the server's total.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApiPage {
    pub rows: Vec<RawRow>,
    pub total_records: u64,
}

#[async_trait]
pub trait OpportunitySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, filters: &SearchFilters) -> Result<ApiPage, SourceError>;
}

pub struct SamGovSource {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
    limit: u32,
}

impl fmt::Debug for SamGovSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamGovSource")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("limit", &self.limit)
            .finish()
    }
}

impl SamGovSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, api_key: impl Into<String>, limit: u32) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            limit,
        }
    }

    pub fn request_for(&self, filters: &SearchFilters, today: NaiveDate) -> ApiRequest {
        ApiRequest {
            source_id: SAM_GOV_SOURCE_ID.to_string(),
            url: format!("{}{}", self.base_url, SAM_GOV_SEARCH_PATH),
            headers: vec![
                ("X-Api-Key", self.api_key.clone()),
                ("Accept", "application/json".to_string()),
            ],
            query: filters.query_params(today, self.limit),
        }
    }
}

#[async_trait]
impl OpportunitySource for SamGovSource {
    fn source_id(&self) -> &'static str {
        SAM_GOV_SOURCE_ID
    }

    async fn fetch(&self, filters: &SearchFilters) -> Result<ApiPage, SourceError> {
        let request = self.request_for(filters, Utc::now().date_naive());
        let response = self.http.fetch(&request).await.map_err(|err| {
            let target = match &err {
                FetchError::HttpStatus { url, .. } => url.clone(),
                FetchError::Request(_) => request.url.clone(),
            };
            SourceError::SourceUnavailable {
                source_id: SAM_GOV_SOURCE_ID.to_string(),
                target,
                detail: err.to_string(),
            }
        })?;
        parse_search_response(&response.body).map_err(|err| SourceError::SourceUnavailable {
            source_id: SAM_GOV_SOURCE_ID.to_string(),
            target: response.final_url.clone(),
            detail: format!("invalid search response: {err}"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "opportunitiesData")]
    opportunities_data: Option<Vec<JsonValue>>,
    #[serde(rename = "totalRecords", default)]
    total_records: Option<u64>,
}

/// Decode a search response body. A body without `opportunitiesData` is an
/// empty page.
pub fn parse_search_response(body: &[u8]) -> Result<ApiPage, serde_json::Error> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    let Some(items) = response.opportunities_data else {
        return Ok(ApiPage::default());
    };
    let rows = items
        .iter()
        .enumerate()
        .map(|(index, item)| json_row(index, item))
        .collect();
    Ok(ApiPage {
        rows,
        total_records: response.total_records.unwrap_or(0),
    })
}

pub fn load_search_fixture(path: impl AsRef<Path>) -> Result<ApiPage> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_search_response(&data).with_context(|| format!("parsing {}", path.display()))
}

fn json_row(index: usize, item: &JsonValue) -> RawRow {
    let mut row = RawRow::new(index);
    let Some(object) = item.as_object() else {
        warn!(row = index, "search result entry is not an object; projecting defaults");
        return row;
    };
    for (key, value) in object {
        row.insert(key.clone(), json_cell(key, value));
    }
    row
}

fn json_cell(key: &str, value: &JsonValue) -> RawCell {
    match value {
        JsonValue::Null => RawCell::Empty,
        JsonValue::Bool(b) => RawCell::Bool(*b),
        JsonValue::Number(n) => n
            .as_f64()
            .map(RawCell::Number)
            .unwrap_or_else(|| RawCell::Text(n.to_string())),
        JsonValue::String(s) => RawCell::from(s.as_str()),
        JsonValue::Object(obj) if key == "placeOfPerformance" => flatten_place(obj)
            .map(RawCell::Text)
            .unwrap_or(RawCell::Empty),
        other => RawCell::Text(other.to_string()),
    }
}

fn nested_str<'a>(obj: &'a JsonMap<String, JsonValue>, path: &[&str]) -> Option<&'a str> {
    let (first, rest) = path.split_first()?;
    let mut cur = obj.get(*first)?;
    for segment in rest {
        cur = cur.get(*segment)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// `"<state>, <country>"` codes when present, else the city name.
fn flatten_place(obj: &JsonMap<String, JsonValue>) -> Option<String> {
    let codes = [
        nested_str(obj, &["state", "code"]),
        nested_str(obj, &["country", "code"]),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>();
    if !codes.is_empty() {
        return Some(codes.join(", "));
    }
    nested_str(obj, &["city", "name"]).map(ToString::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadFormat {
    Csv,
    Xlsx,
    Xls,
}

impl UploadFormat {
    /// Resolve the upload format from the declared MIME type, falling back to
    /// the file extension when the declared type is absent or generic.
    pub fn detect(declared_type: Option<&str>, file_name: &str) -> Result<Self, SourceError> {
        let declared = declared_type
            .map(|d| d.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty());
        let by_extension = Self::from_extension(file_name);

        let format = match declared.as_deref() {
            None | Some("application/octet-stream") | Some("text/plain") => by_extension,
            Some(MIME_CSV) | Some("application/csv") => Some(Self::Csv),
            Some(MIME_XLSX) => Some(Self::Xlsx),
            // Some platforms declare CSV files with the legacy Excel type.
            Some(MIME_XLS) => match by_extension {
                Some(Self::Csv) => Some(Self::Csv),
                _ => Some(Self::Xls),
            },
            Some(_) => None,
        };
        format.ok_or_else(|| {
            SourceError::unsupported(
                file_name,
                declared_type,
                "expected an Excel (.xlsx/.xls) or CSV file",
            )
        })
    }

    fn from_extension(file_name: &str) -> Option<Self> {
        let ext = Path::new(file_name)
            .extension()?
            .to_string_lossy()
            .to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "xlsx" | "xlsm" => Some(Self::Xlsx),
            "xls" => Some(Self::Xls),
            _ => None,
        }
    }
}

/// A table that yields raw rows in bounded chunks, in source order.
pub trait RowSource: Send {
    fn columns(&self) -> &[String];

    /// Up to `max_rows` further rows, or `None` once the table is exhausted.
    fn next_chunk(&mut self, max_rows: usize) -> Result<Option<Vec<RawRow>>, SourceError>;
}

/// Make header names unique and non-empty: blanks become `Unnamed: <i>`,
/// repeats get a `.1`, `.2`, ... suffix.
pub fn normalize_headers(raw: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    raw.into_iter()
        .enumerate()
        .map(|(i, name)| {
            let name = name.trim().trim_start_matches('\u{feff}').to_string();
            let base = if name.is_empty() {
                format!("Unnamed: {i}")
            } else {
                name
            };
            let count = seen.entry(base.clone()).or_insert(0);
            let unique = if *count == 0 {
                base.clone()
            } else {
                format!("{base}.{count}")
            };
            *count += 1;
            unique
        })
        .collect()
}

pub struct CsvRowSource<R: Read> {
    reader: csv::Reader<R>,
    record: csv::ByteRecord,
    columns: Vec<String>,
    file_name: String,
    next_index: usize,
    done: bool,
}

impl<R: Read> CsvRowSource<R> {
    pub fn new(reader: R, file_name: &str) -> Result<Self, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_reader(reader);
        let headers = reader
            .byte_headers()
            .map_err(|e| SourceError::unreadable(file_name, format!("reading CSV header: {e}")))?;
        let columns = normalize_headers(
            headers
                .iter()
                .map(|h| String::from_utf8_lossy(h).into_owned()),
        );
        Ok(Self {
            reader,
            record: csv::ByteRecord::new(),
            columns,
            file_name: file_name.to_string(),
            next_index: 0,
            done: false,
        })
    }

    fn current_row(&self) -> RawRow {
        let mut row = RawRow::new(self.next_index);
        for (column, field) in self.columns.iter().zip(self.record.iter()) {
            let cell = match std::str::from_utf8(field) {
                Ok(text) => RawCell::from(text),
                Err(e) => RawCell::Error(format!("invalid UTF-8: {e}")),
            };
            row.insert(column.clone(), cell);
        }
        row
    }

    fn failed_row(&self, detail: &str) -> RawRow {
        let mut row = RawRow::new(self.next_index);
        for column in &self.columns {
            row.insert(column.clone(), RawCell::Error(detail.to_string()));
        }
        row
    }
}

impl<R: Read + Send> RowSource for CsvRowSource<R> {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_chunk(&mut self, max_rows: usize) -> Result<Option<Vec<RawRow>>, SourceError> {
        if self.done {
            return Ok(None);
        }
        let mut rows = Vec::with_capacity(max_rows.min(4096));
        while rows.len() < max_rows.max(1) {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => rows.push(self.current_row()),
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(err) if err.is_io_error() => {
                    return Err(SourceError::unreadable(
                        &self.file_name,
                        format!("reading CSV: {err}"),
                    ));
                }
                Err(err) => {
                    warn!(file = %self.file_name, row = self.next_index, error = %err, "malformed CSV record");
                    rows.push(self.failed_row(&err.to_string()));
                }
            }
            self.next_index += 1;
        }
        if self.done && rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows))
    }
}

/// First worksheet of a workbook, first row as header. Fully blank rows are
/// skipped.
pub struct SheetRowSource {
    range: Range<Data>,
    columns: Vec<String>,
    cursor: usize,
    next_index: usize,
}

impl SheetRowSource {
    pub fn open<RS: Read + Seek>(reader: RS, format: UploadFormat, file_name: &str) -> Result<Self, SourceError> {
        let mut sheets: Sheets<RS> = match format {
            UploadFormat::Xlsx => Sheets::Xlsx(
                Xlsx::new(reader)
                    .map_err(|e| SourceError::unsupported(file_name, Some(MIME_XLSX), e.to_string()))?,
            ),
            UploadFormat::Xls => Sheets::Xls(
                Xls::new(reader)
                    .map_err(|e| SourceError::unsupported(file_name, Some(MIME_XLS), e.to_string()))?,
            ),
            UploadFormat::Csv => {
                return Err(SourceError::unsupported(
                    file_name,
                    Some(MIME_CSV),
                    "CSV is not a workbook",
                ))
            }
        };
        let first = sheets
            .sheet_names()
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::unsupported(file_name, None, "workbook has no sheets"))?;
        let range = sheets
            .worksheet_range(&first)
            .map_err(|e| SourceError::unreadable(file_name, format!("reading sheet `{first}`: {e}")))?;
        Ok(Self::from_range(range))
    }

    pub fn from_range(range: Range<Data>) -> Self {
        let width = range.width();
        let columns = if range.height() == 0 {
            Vec::new()
        } else {
            normalize_headers((0..width).map(|col| {
                range
                    .get((0, col))
                    .map(cell_from_data)
                    .and_then(|cell| cell.text().ok().flatten())
                    .unwrap_or_default()
            }))
        };
        Self {
            range,
            columns,
            cursor: 1,
            next_index: 0,
        }
    }
}

impl RowSource for SheetRowSource {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_chunk(&mut self, max_rows: usize) -> Result<Option<Vec<RawRow>>, SourceError> {
        let height = self.range.height();
        let mut rows = Vec::new();
        while rows.len() < max_rows.max(1) && self.cursor < height {
            let mut row = RawRow::new(self.next_index);
            for (col, column) in self.columns.iter().enumerate() {
                let cell = self
                    .range
                    .get((self.cursor, col))
                    .map(cell_from_data)
                    .unwrap_or_default();
                if cell != RawCell::Empty {
                    row.insert(column.clone(), cell);
                }
            }
            self.cursor += 1;
            if row.cells.is_empty() {
                continue;
            }
            self.next_index += 1;
            rows.push(row);
        }
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows))
    }
}

fn cell_from_data(data: &Data) -> RawCell {
    match data {
        Data::Empty => RawCell::Empty,
        Data::String(s) => RawCell::from(s.as_str()),
        Data::Float(f) => RawCell::Number(*f),
        Data::Int(i) => RawCell::Number(*i as f64),
        Data::Bool(b) => RawCell::Bool(*b),
        Data::DateTime(_) => data
            .as_datetime()
            .map(RawCell::DateTime)
            .unwrap_or_else(|| RawCell::Error(format!("unreadable date cell {data}"))),
        Data::DateTimeIso(s) | Data::DurationIso(s) => RawCell::from(s.as_str()),
        Data::Error(e) => RawCell::Error(e.to_string()),
    }
}

/// In-memory rows, served through the same chunked interface.
#[derive(Debug, Clone, Default)]
pub struct MemoryRowSource {
    columns: Vec<String>,
    rows: VecDeque<RawRow>,
}

impl MemoryRowSource {
    pub fn new(columns: Vec<String>, rows: Vec<RawRow>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }

    /// Columns are the union of row keys in first-seen order.
    pub fn from_rows(rows: Vec<RawRow>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.cells.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
        Self::new(columns, rows)
    }
}

impl RowSource for MemoryRowSource {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_chunk(&mut self, max_rows: usize) -> Result<Option<Vec<RawRow>>, SourceError> {
        if self.rows.is_empty() {
            return Ok(None);
        }
        let take = max_rows.max(1).min(self.rows.len());
        Ok(Some(self.rows.drain(..take).collect()))
    }
}

/// Open an uploaded file held in memory. The buffer is read in place, never
/// copied.
pub fn open_upload_bytes<B>(
    bytes: B,
    declared_type: Option<&str>,
    file_name: &str,
) -> Result<Box<dyn RowSource>, SourceError>
where
    B: AsRef<[u8]> + Send + 'static,
{
    match UploadFormat::detect(declared_type, file_name)? {
        UploadFormat::Csv => Ok(Box::new(CsvRowSource::new(Cursor::new(bytes), file_name)?)),
        format => Ok(Box::new(SheetRowSource::open(Cursor::new(bytes), format, file_name)?)),
    }
}

/// Open an uploaded file on disk; CSV is streamed from the file handle.
pub fn open_upload_path(path: &Path, declared_type: Option<&str>) -> Result<Box<dyn RowSource>, SourceError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let format = UploadFormat::detect(declared_type, &file_name)?;
    let file = File::open(path)
        .map_err(|e| SourceError::unreadable(&path.display().to_string(), e.to_string()))?;
    match format {
        UploadFormat::Csv => Ok(Box::new(CsvRowSource::new(file, &file_name)?)),
        format => Ok(Box::new(SheetRowSource::open(BufReader::new(file), format, &file_name)?)),
    }
}
