//! Normalization pipeline: column mapping, record projection, aggregation and
//! export of canonical opportunity records.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use fcap_adapters::{
    ApiPage, CsvRowSource, MemoryRowSource, OpportunitySource, RowSource, SamGovSource,
    SearchFilters, SourceError,
};
use fcap_core::{
    days_remaining, is_known, CanonicalField, CanonicalOpportunity, DaysRemaining, IssueKind,
    RawCell, RawRow, RowIssue, UnknownField, CANONICAL_FIELDS, MAPPABLE_FIELDS, PLACEHOLDER_LINK, UNKNOWN,
};
use fcap_storage::{write_atomic, HttpClientConfig, HttpFetcher};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fcap-pipeline";

pub const DEFAULT_CHUNK_SIZE: usize = 5_000;
pub const SUGGESTION_THRESHOLD: f64 = 0.92;
pub const EXPORT_FILE_NAME: &str = "processed_opportunities.csv";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60;

#[derive(Clone)]
pub struct PipelineConfig {
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub result_limit: u32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub chunk_size: usize,
    pub workspace_root: PathBuf,
    pub credentials_path: PathBuf,
    pub web_port: u16,
    pub max_upload_mb: usize,
    pub session_ttl_secs: u64,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base_url", &self.api_base_url)
            .field("result_limit", &self.result_limit)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("chunk_size", &self.chunk_size)
            .field("workspace_root", &self.workspace_root)
            .field("credentials_path", &self.credentials_path)
            .field("web_port", &self.web_port)
            .field("max_upload_mb", &self.max_upload_mb)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .finish()
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("SAM_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            api_base_url: std::env::var("FCAP_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.sam.gov".to_string()),
            result_limit: std::env::var("FCAP_RESULT_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            user_agent: std::env::var("FCAP_USER_AGENT").unwrap_or_else(|_| "fcap/0.1".to_string()),
            http_timeout_secs: std::env::var("FCAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            chunk_size: std::env::var("FCAP_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            workspace_root: std::env::var("FCAP_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            credentials_path: std::env::var("FCAP_CREDENTIALS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/credentials.json")),
            web_port: std::env::var("FCAP_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            max_upload_mb: std::env::var("FCAP_MAX_UPLOAD_MB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),
            session_ttl_secs: std::env::var("FCAP_SESSION_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &u64| *n > 0)
                .unwrap_or(DEFAULT_SESSION_TTL_SECS),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn sam_gov_source(&self) -> Result<SamGovSource> {
        let Some(api_key) = self.api_key.clone() else {
            bail!("SAM_API_KEY is not set; export an api.sam.gov key to search opportunities");
        };
        let http = HttpFetcher::new(self.http_client_config())?;
        Ok(SamGovSource::new(
            http,
            self.api_base_url.clone(),
            api_key,
            self.result_limit,
        ))
    }

    pub fn load_fallback_rules(&self) -> Result<FallbackRules> {
        FallbackRules::from_workspace_root(&self.workspace_root)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    /// Idle time after which a web session is dropped.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FallbackRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<FallbackRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRule {
    pub field: CanonicalField,
    pub columns: Vec<String>,
}

/// Ordered fallback columns per canonical field, consulted for fields the
/// user leaves unbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRules {
    rules: BTreeMap<CanonicalField, Vec<String>>,
}

impl Default for FallbackRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FallbackRules {
    pub fn builtin() -> Self {
        let rules = [
            (CanonicalField::Title, "APFS Number"),
            (CanonicalField::NaicsCode, "NAICS"),
            (CanonicalField::FullParentPathName, "Component"),
        ]
        .into_iter()
        .map(|(field, column)| (field, vec![column.to_string()]))
        .collect();
        Self { rules }
    }

    pub fn from_rules(rules: Vec<FallbackRule>) -> Result<Self> {
        let mut map: BTreeMap<CanonicalField, Vec<String>> = BTreeMap::new();
        for rule in rules {
            if !rule.field.is_user_mappable() {
                bail!("fallback rule for `{}` is not allowed; the field is not mappable", rule.field);
            }
            let columns = map.entry(rule.field).or_default();
            for column in rule.columns {
                if !column.trim().is_empty() && !columns.contains(&column) {
                    columns.push(column);
                }
            }
        }
        Ok(Self { rules: map })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: FallbackRulesFile = serde_yaml::from_str(text).context("parsing fallback rules")?;
        Self::from_rules(file.rules)
    }

    /// Load `rules/fallbacks.yaml` under `root`, or the built-in table when the
    /// file does not exist.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("fallbacks.yaml");
        if !path.exists() {
            info!(path = %path.display(), "no fallback rule file; using built-in rules");
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn columns_for(&self, field: CanonicalField) -> &[String] {
        self.rules.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// How a canonical field obtains its value when projecting a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Binding {
    /// Column chosen by the user (or the field's own key for pre-shaped rows).
    Column(String),
    /// Column picked from the fallback rule table.
    Fallback(String),
    /// Constant upload date, `YYYY-MM-DD`.
    UploadDate(String),
    Placeholder,
    Unknown,
    Absent,
    Derived,
}

impl Binding {
    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Column(c) | Self::Fallback(c) => Some(c),
            _ => None,
        }
    }
}

pub type UserChoices = BTreeMap<CanonicalField, String>;

/// Parse a `field=column` choice as given on the command line.
pub fn parse_choice(text: &str) -> Result<(CanonicalField, String)> {
    let Some((field, column)) = text.split_once('=') else {
        bail!("expected FIELD=COLUMN, got `{text}`");
    };
    let field: CanonicalField = field.parse()?;
    Ok((field, column.trim().to_string()))
}

/// Collect user choices from `(field key, column)` pairs, skipping empty columns.
pub fn choices_from_pairs<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<UserChoices, UnknownField> {
    let mut choices = UserChoices::new();
    for (key, column) in pairs {
        let field: CanonicalField = key.parse()?;
        let column = column.trim();
        if !column.is_empty() {
            choices.insert(field, column.to_string());
        }
    }
    Ok(choices)
}

/// Total mapping from canonical field to binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMapping {
    bindings: BTreeMap<CanonicalField, Binding>,
}

impl ColumnMapping {
    pub fn build(
        source_columns: &[String],
        choices: &UserChoices,
        rules: &FallbackRules,
        upload_date: NaiveDate,
    ) -> Self {
        let present = |column: &str| source_columns.iter().any(|c| c == column);

        for (field, column) in choices {
            if !field.is_user_mappable() {
                warn!(field = %field, column = %column, "ignoring choice for a field that cannot be mapped");
            } else if !present(column) {
                warn!(field = %field, column = %column, "chosen column not in upload; applying fallback");
            }
        }

        let bindings = CANONICAL_FIELDS
            .into_iter()
            .map(|field| {
                let chosen = choices
                    .get(&field)
                    .filter(|column| field.is_user_mappable() && present(column));
                let binding = match chosen {
                    Some(column) => Binding::Column(column.clone()),
                    None => fallback_binding(field, source_columns, rules, upload_date),
                };
                (field, binding)
            })
            .collect();
        Self { bindings }
    }

    /// Each field read from the column named by its own key.
    pub fn identity() -> Self {
        let bindings = CANONICAL_FIELDS
            .into_iter()
            .map(|field| {
                let binding = match field {
                    CanonicalField::DaysRemaining => Binding::Derived,
                    _ => Binding::Column(field.key().to_string()),
                };
                (field, binding)
            })
            .collect();
        Self { bindings }
    }

    pub fn binding(&self, field: CanonicalField) -> &Binding {
        self.bindings.get(&field).unwrap_or(&Binding::Unknown)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CanonicalField, &Binding)> + '_ {
        self.bindings.iter().map(|(f, b)| (*f, b))
    }

    pub fn is_total(&self) -> bool {
        CANONICAL_FIELDS.iter().all(|f| self.bindings.contains_key(f))
    }
}

fn fallback_binding(
    field: CanonicalField,
    source_columns: &[String],
    rules: &FallbackRules,
    upload_date: NaiveDate,
) -> Binding {
    if let Some(column) = rules
        .columns_for(field)
        .iter()
        .find(|alias| source_columns.contains(alias))
    {
        return Binding::Fallback(column.clone());
    }
    match field {
        CanonicalField::PostedDate => Binding::UploadDate(upload_date.format("%Y-%m-%d").to_string()),
        CanonicalField::UiLink => Binding::Placeholder,
        CanonicalField::DaysRemaining => Binding::Derived,
        CanonicalField::PlaceOfPerformance => Binding::Absent,
        _ => Binding::Unknown,
    }
}

/// Advisory column suggestions for mappable fields, by fuzzy match against
/// each field's key and label.
pub fn suggest_choices(source_columns: &[String]) -> UserChoices {
    let mut suggestions = UserChoices::new();
    for field in MAPPABLE_FIELDS {
        let key = field.key().to_lowercase();
        let label = field.label().to_lowercase();
        let mut best: Option<(f64, &String)> = None;
        for column in source_columns {
            let candidate = column.trim().to_lowercase();
            let score = jaro_winkler(&candidate, &key).max(jaro_winkler(&candidate, &label));
            if score >= SUGGESTION_THRESHOLD && best.map_or(true, |(s, _)| score > s) {
                best = Some((score, column));
            }
        }
        if let Some((_, column)) = best {
            suggestions.insert(field, column.clone());
        }
    }
    suggestions
}

/// Per-run projection inputs: a run id for log correlation and the clock.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionContext {
    pub run_id: Uuid,
    pub now: DateTime<Utc>,
}

impl ProjectionContext {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            now,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }
}

impl Default for ProjectionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Projection {
    pub records: Vec<CanonicalOpportunity>,
    pub issues: Vec<RowIssue>,
    pub chunks: usize,
    pub rows: usize,
}

/// Project one raw row. Never fails: unreadable cells degrade to the field
/// default and are reported as issues.
pub fn project_row(
    row: &RawRow,
    mapping: &ColumnMapping,
    now: DateTime<Utc>,
) -> (CanonicalOpportunity, Vec<RowIssue>) {
    let mut record = CanonicalOpportunity::default();
    let mut issues = Vec::new();

    for (field, binding) in mapping.iter() {
        let value = match binding {
            Binding::Column(column) | Binding::Fallback(column) => match row.get(column) {
                None => None,
                Some(cell) => match cell.text() {
                    Ok(text) => text,
                    Err(err) => {
                        issues.push(RowIssue {
                            row: row.index,
                            field,
                            kind: IssueKind::MalformedRow,
                            detail: format!("column `{column}`: {err}"),
                        });
                        None
                    }
                },
            },
            Binding::UploadDate(date) => Some(date.clone()),
            Binding::Placeholder => Some(PLACEHOLDER_LINK.to_string()),
            Binding::Unknown | Binding::Absent | Binding::Derived => None,
        };
        assign(&mut record, field, value);
    }

    record.days_remaining = if is_known(&record.response_deadline) {
        let days = days_remaining(Some(&record.response_deadline), now);
        if days == DaysRemaining::Unavailable {
            issues.push(RowIssue {
                row: row.index,
                field: CanonicalField::DaysRemaining,
                kind: IssueKind::Unavailable,
                detail: format!("unparseable deadline `{}`", record.response_deadline),
            });
        }
        days
    } else {
        DaysRemaining::Unavailable
    };

    (record, issues)
}

fn assign(record: &mut CanonicalOpportunity, field: CanonicalField, value: Option<String>) {
    if field == CanonicalField::PlaceOfPerformance {
        record.place_of_performance = value;
        return;
    }
    let text = value
        .or_else(|| field.default_text().map(ToString::to_string))
        .unwrap_or_else(|| UNKNOWN.to_string());
    match field {
        CanonicalField::Title => record.title = text,
        CanonicalField::Type => record.opportunity_type = text,
        CanonicalField::PostedDate => record.posted_date = text,
        CanonicalField::ResponseDeadLine => record.response_deadline = text,
        CanonicalField::NaicsCode => record.naics_code = text,
        CanonicalField::FullParentPathName => record.agency = text,
        CanonicalField::UiLink => record.ui_link = text,
        CanonicalField::PlaceOfPerformance | CanonicalField::DaysRemaining => {}
    }
}

/// One record per input row, in input order.
pub fn project(rows: &[RawRow], mapping: &ColumnMapping, now: DateTime<Utc>) -> Vec<CanonicalOpportunity> {
    let mut projection = Projection::default();
    project_chunk(rows, mapping, now, &mut projection);
    projection.records
}

fn project_chunk(rows: &[RawRow], mapping: &ColumnMapping, now: DateTime<Utc>, out: &mut Projection) {
    out.records.reserve(rows.len());
    for row in rows {
        let (record, issues) = project_row(row, mapping, now);
        for issue in &issues {
            warn!(row = issue.row, field = %issue.field, kind = ?issue.kind, detail = %issue.detail, "row issue");
        }
        out.records.push(record);
        out.issues.extend(issues);
    }
    out.rows += rows.len();
}

/// Pull rows from `source` in chunks of at most `chunk_size` and project them.
pub fn project_source(
    source: &mut dyn RowSource,
    mapping: &ColumnMapping,
    chunk_size: usize,
    ctx: &ProjectionContext,
) -> Result<Projection, SourceError> {
    let chunk_size = chunk_size.max(1);
    let span = info_span!("project_source", run_id = %ctx.run_id, chunk_size);
    let _entered = span.enter();

    let mut projection = Projection::default();
    while let Some(rows) = source.next_chunk(chunk_size)? {
        projection.chunks += 1;
        project_chunk(&rows, mapping, ctx.now, &mut projection);
    }
    info!(
        rows = projection.rows,
        chunks = projection.chunks,
        issues = projection.issues.len(),
        "projection complete"
    );
    Ok(projection)
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub total_records: u64,
    pub projection: Projection,
}

/// Fetch one page from `source` and project it with the identity mapping.
pub async fn run_search(
    source: &dyn OpportunitySource,
    filters: &SearchFilters,
    ctx: &ProjectionContext,
) -> Result<SearchOutcome, SourceError> {
    let span = info_span!("run_search", run_id = %ctx.run_id, source_id = source.source_id());
    async move {
        let ApiPage { rows, total_records } = source.fetch(filters).await?;
        info!(rows = rows.len(), total_records, "search page fetched");
        let mut memory = MemoryRowSource::from_rows(rows);
        let projection = project_source(&mut memory, &ColumnMapping::identity(), DEFAULT_CHUNK_SIZE, ctx)?;
        Ok(SearchOutcome {
            total_records,
            projection,
        })
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadInspection {
    pub columns: Vec<String>,
    /// Cell text per preview row, aligned with `columns`.
    pub preview: Vec<Vec<String>>,
    pub suggestions: UserChoices,
    pub fallbacks: ColumnMapping,
}

/// Columns, a short text preview, mapping suggestions and the mapping that
/// would apply with no user choices.
pub fn inspect_upload(
    source: &mut dyn RowSource,
    preview_rows: usize,
    rules: &FallbackRules,
    upload_date: NaiveDate,
) -> Result<UploadInspection, SourceError> {
    let columns = source.columns().to_vec();
    let preview = if preview_rows == 0 {
        Vec::new()
    } else {
        source
            .next_chunk(preview_rows)?
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|column| match row.cells.get(column).map(RawCell::text) {
                        Some(Ok(text)) => text.unwrap_or_default(),
                        Some(Err(err)) => err.to_string(),
                        None => String::new(),
                    })
                    .collect()
            })
            .collect()
    };
    Ok(UploadInspection {
        suggestions: suggest_choices(&columns),
        fallbacks: ColumnMapping::build(&columns, &UserChoices::new(), rules, upload_date),
        columns,
        preview,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub active: usize,
    pub average_days_remaining: Option<f64>,
    pub unique_agencies: usize,
    pub by_type: Vec<Tally>,
    pub top_agencies: Vec<Tally>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineSpan {
    pub title: String,
    pub posted: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

pub fn total_count(records: &[CanonicalOpportunity]) -> usize {
    records.len()
}

pub fn active_count(records: &[CanonicalOpportunity]) -> usize {
    records.iter().filter(|r| r.is_active()).count()
}

pub fn average_days_remaining(records: &[CanonicalOpportunity]) -> Option<f64> {
    let days: Vec<u32> = records.iter().filter_map(|r| r.days_remaining.days()).collect();
    if days.is_empty() {
        return None;
    }
    let sum: u64 = days.iter().map(|d| u64::from(*d)).sum();
    Some(sum as f64 / days.len() as f64)
}

pub fn unique_agency_count(records: &[CanonicalOpportunity]) -> usize {
    let mut seen = std::collections::HashSet::new();
    records
        .iter()
        .filter(|r| r.has_known_agency())
        .filter(|r| seen.insert(r.agency.as_str()))
        .count()
}

/// Counts in descending order, ties by first appearance.
fn tally<'a>(names: impl Iterator<Item = &'a str>) -> Vec<Tally> {
    let mut order: Vec<Tally> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for name in names {
        match index.get(name) {
            Some(&i) => order[i].count += 1,
            None => {
                index.insert(name, order.len());
                order.push(Tally {
                    name: name.to_string(),
                    count: 1,
                });
            }
        }
    }
    order.sort_by(|a, b| b.count.cmp(&a.count));
    order
}

/// Type tally including the "unknown" bucket; counts sum to the total.
pub fn count_by_type(records: &[CanonicalOpportunity]) -> Vec<Tally> {
    tally(records.iter().map(|r| {
        if is_known(&r.opportunity_type) {
            r.opportunity_type.as_str()
        } else {
            UNKNOWN
        }
    }))
}

pub fn top_agencies(records: &[CanonicalOpportunity], n: usize) -> Vec<Tally> {
    let mut tallies = tally(
        records
            .iter()
            .filter(|r| r.has_known_agency())
            .map(|r| r.agency.as_str()),
    );
    tallies.truncate(n);
    tallies
}

pub fn summarize(records: &[CanonicalOpportunity], top_n: usize) -> Summary {
    Summary {
        total: total_count(records),
        active: active_count(records),
        average_days_remaining: average_days_remaining(records),
        unique_agencies: unique_agency_count(records),
        by_type: count_by_type(records),
        top_agencies: top_agencies(records, top_n),
    }
}

pub fn timeline(records: &[CanonicalOpportunity]) -> Vec<TimelineSpan> {
    records
        .iter()
        .filter_map(|r| {
            Some(TimelineSpan {
                title: r.title.clone(),
                posted: r.posted_at()?,
                deadline: r.deadline_at()?,
            })
        })
        .collect()
}

pub fn locations(records: &[CanonicalOpportunity]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for place in records.iter().filter_map(|r| r.place_of_performance.as_deref()) {
        let place = place.trim();
        if !place.is_empty() && !out.iter().any(|p| p == place) {
            out.push(place.to_string());
        }
    }
    out
}

pub fn filter_active(records: &[CanonicalOpportunity]) -> Vec<CanonicalOpportunity> {
    records.iter().filter(|r| r.is_active()).cloned().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    PostedDate,
    ResponseDeadline,
    Agency,
}

impl FromStr for SortKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "posted_date" | "posted" => Ok(Self::PostedDate),
            "response_deadline" | "deadline" => Ok(Self::ResponseDeadline),
            "agency" => Ok(Self::Agency),
            other => bail!("unknown sort key `{other}` (expected posted_date, response_deadline or agency)"),
        }
    }
}

/// Stable sort. Dates ascend with unparseable values last.
pub fn sort_records(records: &mut [CanonicalOpportunity], key: SortKey) {
    match key {
        SortKey::PostedDate => records.sort_by_cached_key(|r| {
            let at = r.posted_at();
            (at.is_none(), at)
        }),
        SortKey::ResponseDeadline => records.sort_by_cached_key(|r| {
            let at = r.deadline_at();
            (at.is_none(), at)
        }),
        SortKey::Agency => records.sort_by(|a, b| a.agency.cmp(&b.agency)),
    }
}

pub fn summary_markdown(summary: &Summary) -> String {
    let mut lines = vec!["# FCAP Opportunity Brief".to_string(), String::new()];
    lines.push(format!("- opportunities: {}", summary.total));
    lines.push(format!("- active: {}", summary.active));
    lines.push(format!(
        "- average days remaining: {}",
        summary
            .average_days_remaining
            .map(|avg| format!("{avg:.1}"))
            .unwrap_or_else(|| "n/a".to_string())
    ));
    lines.push(format!("- agencies: {}", summary.unique_agencies));
    lines.push(String::new());
    lines.push("## By type".to_string());
    for t in &summary.by_type {
        lines.push(format!("- {}: {}", t.name, t.count));
    }
    if !summary.top_agencies.is_empty() {
        lines.push(String::new());
        lines.push("## Top agencies".to_string());
        for t in &summary.top_agencies {
            lines.push(format!("- {}: {}", t.name, t.count));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

pub fn export_header() -> [&'static str; 9] {
    CANONICAL_FIELDS.map(CanonicalField::key)
}

pub fn to_csv_bytes(records: &[CanonicalOpportunity]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(export_header())
        .context("writing CSV header")?;
    for record in records {
        writer
            .write_record(CANONICAL_FIELDS.map(|f| record.field_text(f)))
            .context("writing CSV record")?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing CSV export: {}", e.error()))
}

pub async fn export_csv(path: &Path, records: &[CanonicalOpportunity]) -> Result<()> {
    let bytes = to_csv_bytes(records)?;
    write_atomic(path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), records = records.len(), "exported CSV");
    Ok(())
}

/// Read a CSV export back; `daysRemaining` is recomputed against `ctx.now`.
pub fn import_csv(bytes: Vec<u8>, ctx: &ProjectionContext) -> Result<Projection> {
    let mut source = CsvRowSource::new(Cursor::new(bytes), EXPORT_FILE_NAME)?;
    let projection = project_source(&mut source, &ColumnMapping::identity(), DEFAULT_CHUNK_SIZE, ctx)?;
    Ok(projection)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `opportunities.parquet` and `manifest.json` under `dir`. Returns the
/// manifest path.
pub async fn export_parquet_snapshot(
    dir: &Path,
    records: &[CanonicalOpportunity],
    ctx: &ProjectionContext,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let opportunities_path = dir.join("opportunities.parquet");
    write_opportunities_parquet(&opportunities_path, records)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id: ctx.run_id,
        generated_at: ctx.now,
        files: vec![manifest_entry("opportunities", dir, &opportunities_path)?],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(path = %manifest_path.display(), records = records.len(), "exported parquet snapshot");
    Ok(manifest_path)
}

fn write_opportunities_parquet(path: &Path, records: &[CanonicalOpportunity]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("type", DataType::Utf8, false),
        ArrowField::new("posted_date", DataType::Utf8, false),
        ArrowField::new("response_deadline", DataType::Utf8, false),
        ArrowField::new("naics_code", DataType::Utf8, false),
        ArrowField::new("full_parent_path_name", DataType::Utf8, false),
        ArrowField::new("ui_link", DataType::Utf8, false),
        ArrowField::new("days_remaining", DataType::UInt32, true),
        ArrowField::new("place_of_performance", DataType::Utf8, true),
    ]));

    let text = |f: fn(&CanonicalOpportunity) -> &str| {
        StringArray::from(records.iter().map(f).collect::<Vec<_>>())
    };
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text(|r| &r.title)),
            Arc::new(text(|r| &r.opportunity_type)),
            Arc::new(text(|r| &r.posted_date)),
            Arc::new(text(|r| &r.response_deadline)),
            Arc::new(text(|r| &r.naics_code)),
            Arc::new(text(|r| &r.agency)),
            Arc::new(text(|r| &r.ui_link)),
            Arc::new(UInt32Array::from(
                records.iter().map(|r| r.days_remaining.days()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records
                    .iter()
                    .map(|r| r.place_of_performance.as_deref())
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building opportunities record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
