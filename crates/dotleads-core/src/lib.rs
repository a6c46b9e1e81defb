//! Core record model for the DOT leads pipeline.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "dotleads-core";

/// Canonical calendar-date rendering used for file names, partitions and the pull date.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Label prefixed to the per-day partition name.
pub const PARTITION_LABEL: &str = "DOT Leads";

/// Output column order shared by the CSV artifact and the spreadsheet partition.
pub const COLUMN_HEADERS: [&str; 9] = [
    "DOT Number",
    "Legal Company Name",
    "DBA Name",
    "City",
    "State",
    "ZIP Code",
    "Phone",
    "ADD_DATE",
    "Date Pulled",
];

/// Field names read from the upstream census dataset.
pub mod raw_fields {
    pub const DOT_NUMBER: &str = "dot_number";
    pub const LEGAL_NAME: &str = "legal_name";
    pub const DBA_NAME: &str = "dba_name";
    pub const CITY: &str = "phy_city";
    pub const STATE: &str = "phy_state";
    pub const ZIP: &str = "phy_zip";
    pub const TELEPHONE: &str = "telephone";
    pub const ADD_DATE: &str = "add_date";
}

/// Untyped record exactly as the data source returned it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Map<String, JsonValue>);

impl RawRecord {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }

    /// Field value coerced to text. Missing and null values become an empty string.
    pub fn text(&self, name: &str) -> String {
        match self.0.get(name) {
            None | Some(JsonValue::Null) => String::new(),
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Bool(b)) => b.to_string(),
            Some(JsonValue::Number(n)) => n.to_string(),
            Some(other) => other.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Fixed-schema record produced by the normalizer.
///
/// `dot_number` is the natural key and is never empty once a record has been
/// normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub dot_number: String,
    pub legal_name: String,
    pub dba_name: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub phone: String,
    pub add_date: String,
    pub date_pulled: String,
}

impl NormalizedRecord {
    pub fn natural_key(&self) -> &str {
        &self.dot_number
    }

    /// Row cells in [`COLUMN_HEADERS`] order.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.dot_number.clone(),
            self.legal_name.clone(),
            self.dba_name.clone(),
            self.city.clone(),
            self.state.clone(),
            self.zip.clone(),
            self.phone.clone(),
            self.add_date.clone(),
            self.date_pulled.clone(),
        ]
    }
}

pub fn header_row() -> Vec<String> {
    COLUMN_HEADERS.iter().map(|h| h.to_string()).collect()
}

/// Natural keys from the first cell of each stored row.
///
/// The header is recognised by its label rather than its position, so a
/// partition that never received its header row loses no keys. Blanks are dropped.
pub fn stored_keys<'a>(first_cells: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    first_cells
        .into_iter()
        .map(str::trim)
        .filter(|key| !key.is_empty() && *key != COLUMN_HEADERS[0])
        .map(str::to_string)
        .collect()
}

/// Outcome of comparing one batch against what a partition already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub new_records: Vec<NormalizedRecord>,
    pub existing_count: usize,
    pub destination_reference: String,
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_target_date(input: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT)
}

/// The day before `today`; the pipeline's default target.
pub fn previous_day(today: NaiveDate) -> NaiveDate {
    today - Duration::days(1)
}

/// Per-day partition name, e.g. `DOT Leads 2024-03-01`.
pub fn partition_name(date: NaiveDate) -> String {
    format!("{PARTITION_LABEL} {}", format_date(date))
}
