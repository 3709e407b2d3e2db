//! Core domain model for FCAP: the canonical opportunity record, the raw
//! cells it is projected from, and deadline arithmetic.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "fcap-core";

/// Default for every text field the source cannot supply.
pub const UNKNOWN: &str = "unknown";
/// Detail link used when a source has no canonical detail page.
pub const PLACEHOLDER_LINK: &str = "#";
/// Wire form of [`DaysRemaining::Unavailable`].
pub const UNAVAILABLE: &str = "unavailable";

/// The closed set of canonical record fields, in export order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CanonicalField {
    Title,
    Type,
    PostedDate,
    ResponseDeadLine,
    NaicsCode,
    FullParentPathName,
    UiLink,
    DaysRemaining,
    PlaceOfPerformance,
}

pub const CANONICAL_FIELDS: [CanonicalField; 9] = [
    CanonicalField::Title,
    CanonicalField::Type,
    CanonicalField::PostedDate,
    CanonicalField::ResponseDeadLine,
    CanonicalField::NaicsCode,
    CanonicalField::FullParentPathName,
    CanonicalField::UiLink,
    CanonicalField::DaysRemaining,
    CanonicalField::PlaceOfPerformance,
];

/// Fields a user may bind to an uploaded column.
pub const MAPPABLE_FIELDS: [CanonicalField; 7] = [
    CanonicalField::Title,
    CanonicalField::Type,
    CanonicalField::PostedDate,
    CanonicalField::ResponseDeadLine,
    CanonicalField::NaicsCode,
    CanonicalField::FullParentPathName,
    CanonicalField::PlaceOfPerformance,
];

impl CanonicalField {
    /// Wire key, identical to the API's JSON field name.
    pub fn key(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Type => "type",
            Self::PostedDate => "postedDate",
            Self::ResponseDeadLine => "responseDeadLine",
            Self::NaicsCode => "naicsCode",
            Self::FullParentPathName => "fullParentPathName",
            Self::UiLink => "uiLink",
            Self::DaysRemaining => "daysRemaining",
            Self::PlaceOfPerformance => "placeOfPerformance",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Title => "Opportunity Title",
            Self::Type => "Opportunity Type",
            Self::PostedDate => "Posted Date",
            Self::ResponseDeadLine => "Response Deadline",
            Self::NaicsCode => "NAICS",
            Self::FullParentPathName => "Component",
            Self::UiLink => "Detail Link",
            Self::DaysRemaining => "Days Remaining",
            Self::PlaceOfPerformance => "Place of Performance",
        }
    }

    /// Case-insensitive lookup by wire key.
    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim();
        CANONICAL_FIELDS
            .into_iter()
            .find(|f| f.key().eq_ignore_ascii_case(key))
    }

    pub fn is_user_mappable(self) -> bool {
        MAPPABLE_FIELDS.contains(&self)
    }

    /// Value used when the source has nothing for this field. `None` means the
    /// field is optional (place of performance) or derived (days remaining).
    pub fn default_text(self) -> Option<&'static str> {
        match self {
            Self::UiLink => Some(PLACEHOLDER_LINK),
            Self::DaysRemaining | Self::PlaceOfPerformance => None,
            _ => Some(UNKNOWN),
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for CanonicalField {
    type Err = UnknownField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_key(s).ok_or_else(|| UnknownField(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown canonical field `{0}`")]
pub struct UnknownField(pub String);

/// Whole days until a deadline, or `Unavailable` when it cannot be derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DaysRemaining {
    Days(u32),
    #[default]
    Unavailable,
}

impl DaysRemaining {
    pub fn days(self) -> Option<u32> {
        match self {
            Self::Days(d) => Some(d),
            Self::Unavailable => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Days(d) if d > 0)
    }
}

impl fmt::Display for DaysRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Days(d) => write!(f, "{d}"),
            Self::Unavailable => f.write_str(UNAVAILABLE),
        }
    }
}

impl FromStr for DaysRemaining {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case(UNAVAILABLE) {
            return Ok(Self::Unavailable);
        }
        s.parse::<u32>().map(Self::Days)
    }
}

impl Serialize for DaysRemaining {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Days(d) => serializer.serialize_u32(*d),
            Self::Unavailable => serializer.serialize_str(UNAVAILABLE),
        }
    }
}

impl<'de> Deserialize<'de> for DaysRemaining {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DaysVisitor;

        impl de::Visitor<'_> for DaysVisitor {
            type Value = DaysRemaining;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative day count or \"unavailable\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(DaysRemaining::Days(u32::try_from(v).unwrap_or(u32::MAX)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(DaysRemaining::Days(u32::try_from(v.max(0)).unwrap_or(u32::MAX)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(DaysRemaining::Unavailable)
            }
        }

        deserializer.deserialize_any(DaysVisitor)
    }
}

/// Canonical opportunity record. Every field is always populated; missing
/// source values carry the field default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalOpportunity {
    pub title: String,
    #[serde(rename = "type")]
    pub opportunity_type: String,
    pub posted_date: String,
    #[serde(rename = "responseDeadLine")]
    pub response_deadline: String,
    pub naics_code: String,
    #[serde(rename = "fullParentPathName")]
    pub agency: String,
    pub ui_link: String,
    pub days_remaining: DaysRemaining,
    #[serde(default)]
    pub place_of_performance: Option<String>,
}

impl Default for CanonicalOpportunity {
    fn default() -> Self {
        Self {
            title: UNKNOWN.to_string(),
            opportunity_type: UNKNOWN.to_string(),
            posted_date: UNKNOWN.to_string(),
            response_deadline: UNKNOWN.to_string(),
            naics_code: UNKNOWN.to_string(),
            agency: UNKNOWN.to_string(),
            ui_link: PLACEHOLDER_LINK.to_string(),
            days_remaining: DaysRemaining::Unavailable,
            place_of_performance: None,
        }
    }
}

impl CanonicalOpportunity {
    /// Text of a field as it appears in the delimited export. An absent place of
    /// performance renders as an empty cell.
    pub fn field_text(&self, field: CanonicalField) -> String {
        match field {
            CanonicalField::Title => self.title.clone(),
            CanonicalField::Type => self.opportunity_type.clone(),
            CanonicalField::PostedDate => self.posted_date.clone(),
            CanonicalField::ResponseDeadLine => self.response_deadline.clone(),
            CanonicalField::NaicsCode => self.naics_code.clone(),
            CanonicalField::FullParentPathName => self.agency.clone(),
            CanonicalField::UiLink => self.ui_link.clone(),
            CanonicalField::DaysRemaining => self.days_remaining.to_string(),
            CanonicalField::PlaceOfPerformance => {
                self.place_of_performance.clone().unwrap_or_default()
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.days_remaining.is_active()
    }

    pub fn has_known_agency(&self) -> bool {
        is_known(&self.agency)
    }

    pub fn posted_at(&self) -> Option<DateTime<Utc>> {
        parse_datetime(&self.posted_date)
    }

    pub fn deadline_at(&self) -> Option<DateTime<Utc>> {
        parse_datetime(&self.response_deadline)
    }
}

/// True for a value that is neither empty nor the "unknown" placeholder.
pub fn is_known(value: &str) -> bool {
    let v = value.trim();
    !v.is_empty() && !v.eq_ignore_ascii_case(UNKNOWN)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    #[error("error cell: {0}")]
    ErrorValue(String),
    #[error("non-finite number")]
    NonFinite,
}

/// One cell of an input table, as decoded by a source reader.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RawCell {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
    Error(String),
}

impl RawCell {
    /// Trimmed text of the cell; `Ok(None)` for empty values.
    pub fn text(&self) -> Result<Option<String>, CellError> {
        match self {
            Self::Empty => Ok(None),
            Self::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(trimmed.to_string()))
                }
            }
            Self::Number(n) => format_number(*n).map(Some),
            Self::Bool(b) => Ok(Some(b.to_string())),
            Self::DateTime(dt) => {
                if dt.time() == NaiveTime::MIN {
                    Ok(Some(dt.format("%Y-%m-%d").to_string()))
                } else {
                    Ok(Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                }
            }
            Self::Error(e) => Err(CellError::ErrorValue(e.clone())),
        }
    }
}

impl From<&str> for RawCell {
    fn from(value: &str) -> Self {
        if value.is_empty() {
            Self::Empty
        } else {
            Self::Text(value.to_string())
        }
    }
}

impl From<String> for RawCell {
    fn from(value: String) -> Self {
        if value.is_empty() {
            Self::Empty
        } else {
            Self::Text(value)
        }
    }
}

fn format_number(n: f64) -> Result<String, CellError> {
    if !n.is_finite() {
        return Err(CellError::NonFinite);
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        Ok(format!("{}", n as i64))
    } else {
        Ok(n.to_string())
    }
}

/// A raw input row: its zero-based position in the source plus its cells.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRow {
    pub index: usize,
    pub cells: BTreeMap<String, RawCell>,
}

impl RawRow {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            cells: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: impl Into<String>, cell: impl Into<RawCell>) -> Self {
        self.cells.insert(column.into(), cell.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, cell: RawCell) {
        self.cells.insert(column.into(), cell);
    }

    pub fn get(&self, column: &str) -> Option<&RawCell> {
        self.cells.get(column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A cell could not be read; the field fell back to its default.
    MalformedRow,
    /// A value was present but a derived field could not be computed from it.
    Unavailable,
}

/// Non-aborting diagnostic raised while projecting a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    pub row: usize,
    pub field: CanonicalField,
    pub kind: IssueKind,
    pub detail: String,
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%Y/%m/%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d-%b-%Y",
];

// Tried only after the four-digit forms above have failed.
const SHORT_YEAR_DATETIME_FORMATS: &[&str] =
    &["%m/%d/%y %H:%M:%S", "%m/%d/%y %H:%M", "%m/%d/%y %I:%M %p"];

const SHORT_YEAR_DATE_FORMATS: &[&str] = &["%m/%d/%y"];

// `%Y` accepts any digit count, so "3/15/26" would otherwise land in 26 AD.
const MIN_FULL_YEAR: i32 = 1000;

fn parse_naive(text: &str, datetime_formats: &[&str], date_formats: &[&str]) -> Option<NaiveDateTime> {
    datetime_formats
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            date_formats
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// Parse a date or date-time of unknown format. Naive values are read as UTC,
/// date-only values as midnight UTC. Two-digit years map into 1969..=2068.
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    parse_naive(text, NAIVE_DATETIME_FORMATS, DATE_FORMATS)
        .filter(|dt| dt.year() >= MIN_FULL_YEAR)
        .or_else(|| parse_naive(text, SHORT_YEAR_DATETIME_FORMATS, SHORT_YEAR_DATE_FORMATS))
        .map(|dt| dt.and_utc())
}

/// Whole days between `now` and the deadline, truncated toward zero and
/// clamped at zero. Absent or unparseable input yields `Unavailable`.
pub fn days_remaining(deadline: Option<&str>, now: DateTime<Utc>) -> DaysRemaining {
    let Some(deadline) = deadline.and_then(parse_datetime) else {
        return DaysRemaining::Unavailable;
    };
    let days = (deadline - now).num_days().max(0);
    DaysRemaining::Days(u32::try_from(days).unwrap_or(u32::MAX))
}

pub fn days_remaining_now(deadline: Option<&str>) -> DaysRemaining {
    days_remaining(deadline, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn future_iso_date_counts_whole_days() {
        assert_eq!(days_remaining(Some("2026-01-11"), now()), DaysRemaining::Days(10));
    }

    #[test]
    fn partial_days_truncate() {
        assert_eq!(
            days_remaining(Some("2026-01-10T12:00:00Z"), now()),
            DaysRemaining::Days(9)
        );
    }

    #[test]
    fn offset_deadlines_are_normalized_to_utc() {
        // 2026-01-05T20:00-05:00 is 2026-01-06T01:00Z
        assert_eq!(
            days_remaining(Some("2026-01-05T20:00:00-05:00"), now()),
            DaysRemaining::Days(5)
        );
        assert_eq!(
            days_remaining(Some("2026-01-05T20:00:00-0500"), now()),
            DaysRemaining::Days(5)
        );
    }

    #[test]
    fn us_style_dates_parse() {
        assert_eq!(days_remaining(Some("01/31/2026"), now()), DaysRemaining::Days(30));
        assert_eq!(
            days_remaining(Some("01/31/2026 02:30 PM"), now()),
            DaysRemaining::Days(30)
        );
    }

    #[test]
    fn two_digit_years_land_in_this_century() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).single().unwrap();
        assert_eq!(parse_datetime("3/15/26"), Some(expected));
        assert_eq!(
            parse_datetime("03/15/26 17:00"),
            Some(Utc.with_ymd_and_hms(2026, 3, 15, 17, 0, 0).single().unwrap())
        );
        assert_eq!(
            parse_datetime("3/15/26 05:00 PM"),
            Some(Utc.with_ymd_and_hms(2026, 3, 15, 17, 0, 0).single().unwrap())
        );
        assert_eq!(days_remaining(Some("3/15/26"), now()), DaysRemaining::Days(73));
    }

    #[test]
    fn years_below_one_thousand_are_rejected() {
        assert_eq!(parse_datetime("0026-03-15"), None);
        assert_eq!(parse_datetime("3/15/0026"), None);
    }

    #[test]
    fn month_name_dates_parse() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).single().unwrap();
        for text in ["March 15, 2026", "Mar 15, 2026", "15-Mar-2026", "2026/03/15"] {
            assert_eq!(parse_datetime(text), Some(expected), "{text}");
        }
    }

    #[test]
    fn slash_iso_date_times_parse() {
        assert_eq!(
            parse_datetime("2026/03/15 17:00"),
            Some(Utc.with_ymd_and_hms(2026, 3, 15, 17, 0, 0).single().unwrap())
        );
        assert_eq!(
            parse_datetime("2026/03/15 17:00:30"),
            Some(Utc.with_ymd_and_hms(2026, 3, 15, 17, 0, 30).single().unwrap())
        );
    }

    #[test]
    fn past_deadlines_clamp_to_zero() {
        for past in ["2025-12-31", "2000-01-01T00:00:00Z", "12/01/2025", "2025-12-31T23:59:59"] {
            assert_eq!(days_remaining(Some(past), now()), DaysRemaining::Days(0), "{past}");
        }
    }

    #[test]
    fn malformed_or_missing_deadlines_are_unavailable() {
        for bad in ["not-a-date", "", "   ", "unknown", "N/A", "2026-13-45", "31/31/2026"] {
            assert_eq!(days_remaining(Some(bad), now()), DaysRemaining::Unavailable, "{bad}");
        }
        assert_eq!(days_remaining(None, now()), DaysRemaining::Unavailable);
    }

    #[test]
    fn far_future_deadline_is_positive_against_wall_clock() {
        assert!(days_remaining_now(Some("2099-01-01")).is_active());
    }

    #[test]
    fn days_remaining_wire_form() {
        assert_eq!(serde_json::to_string(&DaysRemaining::Days(4)).unwrap(), "4");
        assert_eq!(
            serde_json::to_string(&DaysRemaining::Unavailable).unwrap(),
            "\"unavailable\""
        );
        let parsed: DaysRemaining = serde_json::from_str("\"unavailable\"").unwrap();
        assert_eq!(parsed, DaysRemaining::Unavailable);
        let parsed: DaysRemaining = serde_json::from_str("12").unwrap();
        assert_eq!(parsed, DaysRemaining::Days(12));
        assert_eq!("".parse::<DaysRemaining>().unwrap(), DaysRemaining::Unavailable);
    }

    #[test]
    fn field_keys_round_trip_and_are_case_insensitive() {
        for field in CANONICAL_FIELDS {
            assert_eq!(CanonicalField::from_key(field.key()), Some(field));
        }
        assert_eq!(
            CanonicalField::from_key("NAICSCODE"),
            Some(CanonicalField::NaicsCode)
        );
        assert!("bogus".parse::<CanonicalField>().is_err());
        assert!(!CanonicalField::UiLink.is_user_mappable());
        assert!(!CanonicalField::DaysRemaining.is_user_mappable());
    }

    #[test]
    fn default_record_serializes_with_api_keys() {
        let value = serde_json::to_value(CanonicalOpportunity::default()).unwrap();
        assert_eq!(value["type"], "unknown");
        assert_eq!(value["responseDeadLine"], "unknown");
        assert_eq!(value["fullParentPathName"], "unknown");
        assert_eq!(value["uiLink"], "#");
        assert_eq!(value["daysRemaining"], "unavailable");
    }

    #[test]
    fn cell_text_normalizes_spreadsheet_values() {
        assert_eq!(RawCell::Number(541512.0).text().unwrap().as_deref(), Some("541512"));
        assert_eq!(RawCell::Number(2.5).text().unwrap().as_deref(), Some("2.5"));
        assert_eq!(RawCell::Text("  x ".into()).text().unwrap().as_deref(), Some("x"));
        assert_eq!(RawCell::Text("   ".into()).text().unwrap(), None);
        let midnight = NaiveDate::from_ymd_opt(2026, 3, 4)
            .unwrap()
            .and_time(NaiveTime::MIN);
        assert_eq!(
            RawCell::DateTime(midnight).text().unwrap().as_deref(),
            Some("2026-03-04")
        );
        assert!(RawCell::Error("#N/A".into()).text().is_err());
        assert!(RawCell::Number(f64::NAN).text().is_err());
    }
}
