//! Raw census rows -> fixed-schema records.

use chrono::{NaiveDate, NaiveDateTime};
use dotleads_core::{format_date, raw_fields, NormalizedRecord, RawRecord, DATE_FORMAT};
use tracing::{info, warn};

/// Socrata floating timestamp, e.g. `2024-03-01T00:00:00.000`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingNaturalKey,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingNaturalKey => f.write_str("missing DOT number"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeOutcome {
    Kept(NormalizedRecord),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<NormalizedRecord>,
    pub skipped: usize,
}

/// Reformat a registration date to `YYYY-MM-DD`.
///
/// Unparseable values come back unchanged (trimmed) and are logged.
pub fn canonical_registration_date(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT) {
        return format_date(ts.date());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, DATE_FORMAT) {
        return format_date(date);
    }
    warn!(value, "could not parse registration date; keeping raw value");
    value.to_string()
}

pub fn normalize_record(raw: &RawRecord, date_pulled: &str) -> NormalizeOutcome {
    let field = |name: &str| raw.text(name).trim().to_string();

    let dot_number = field(raw_fields::DOT_NUMBER);
    if dot_number.is_empty() {
        return NormalizeOutcome::Skipped(SkipReason::MissingNaturalKey);
    }

    NormalizeOutcome::Kept(NormalizedRecord {
        dot_number,
        legal_name: field(raw_fields::LEGAL_NAME),
        dba_name: field(raw_fields::DBA_NAME),
        city: field(raw_fields::CITY),
        state: field(raw_fields::STATE),
        zip: field(raw_fields::ZIP),
        phone: field(raw_fields::TELEPHONE),
        add_date: canonical_registration_date(&raw.text(raw_fields::ADD_DATE)),
        date_pulled: date_pulled.to_string(),
    })
}

pub fn normalize_batch(raws: &[RawRecord], pulled_on: NaiveDate) -> NormalizedBatch {
    let date_pulled = format_date(pulled_on);
    let mut batch = NormalizedBatch::default();

    for raw in raws {
        match normalize_record(raw, &date_pulled) {
            NormalizeOutcome::Kept(record) => batch.records.push(record),
            NormalizeOutcome::Skipped(reason) => {
                warn!(%reason, fields = raw.len(), "skipping raw record");
                batch.skipped += 1;
            }
        }
    }

    info!(
        kept = batch.records.len(),
        skipped = batch.skipped,
        "normalized raw records"
    );
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn trims_and_maps_every_field() {
        let outcome = normalize_record(
            &raw(json!({
                "dot_number": " 3456789 ",
                "legal_name": "  BLUE LINE FREIGHT LLC ",
                "dba_name": "BLUE LINE",
                "phy_city": "Tulsa",
                "phy_state": "OK",
                "phy_zip": 74103,
                "telephone": "(918) 555-0199",
                "add_date": "2024-03-01T00:00:00.000",
                "carrier_operation": "A"
            })),
            "2024-03-02",
        );

        let NormalizeOutcome::Kept(record) = outcome else {
            panic!("expected record to be kept");
        };
        assert_eq!(record.dot_number, "3456789");
        assert_eq!(record.legal_name, "BLUE LINE FREIGHT LLC");
        assert_eq!(record.zip, "74103");
        assert_eq!(record.add_date, "2024-03-01");
        assert_eq!(record.date_pulled, "2024-03-02");
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let NormalizeOutcome::Kept(record) =
            normalize_record(&raw(json!({ "dot_number": "1" })), "2024-03-02")
        else {
            panic!("expected record to be kept");
        };
        assert_eq!(record.legal_name, "");
        assert_eq!(record.phone, "");
        assert_eq!(record.add_date, "");
    }

    #[test]
    fn blank_natural_key_is_skipped() {
        for key in [json!(""), json!("   "), json!(null)] {
            let outcome = normalize_record(&raw(json!({ "dot_number": key, "legal_name": "X" })), "d");
            assert_eq!(outcome, NormalizeOutcome::Skipped(SkipReason::MissingNaturalKey));
        }
        let outcome = normalize_record(&raw(json!({ "legal_name": "X" })), "d");
        assert_eq!(outcome, NormalizeOutcome::Skipped(SkipReason::MissingNaturalKey));
    }

    #[test]
    fn registration_date_formats() {
        assert_eq!(canonical_registration_date("2024-03-01T00:00:00.000"), "2024-03-01");
        assert_eq!(canonical_registration_date("2024-03-01T13:45:10"), "2024-03-01");
        assert_eq!(canonical_registration_date("2024-03-01"), "2024-03-01");
        assert_eq!(canonical_registration_date(" 01-MAR-24 "), "01-MAR-24");
        assert_eq!(canonical_registration_date(""), "");
    }

    #[test]
    fn batch_counts_kept_and_skipped() {
        let raws = vec![
            raw(json!({ "dot_number": "1" })),
            raw(json!({ "dot_number": "" })),
            raw(json!({ "dot_number": "2" })),
        ];
        let batch = normalize_batch(&raws, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.skipped, 1);
        assert!(batch.records.iter().all(|r| r.date_pulled == "2024-03-02"));
    }
}
