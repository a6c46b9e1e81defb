use std::collections::HashSet;

use dotleads_core::NormalizedRecord;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    /// First occurrence of every natural key, in input order.
    pub records: Vec<NormalizedRecord>,
    pub duplicates: usize,
    /// Records dropped for an empty natural key. Never counted as duplicates.
    pub missing_key: usize,
}

/// Keep the first record per DOT number.
pub fn dedup_by_natural_key(records: Vec<NormalizedRecord>) -> DedupOutcome {
    let input_len = records.len();
    let mut seen: HashSet<String> = HashSet::with_capacity(input_len);
    let mut outcome = DedupOutcome {
        records: Vec::with_capacity(input_len),
        ..Default::default()
    };

    for record in records {
        let key = record.natural_key().trim();
        if key.is_empty() {
            warn!(legal_name = %record.legal_name, "record missing DOT number");
            outcome.missing_key += 1;
            continue;
        }
        if seen.insert(key.to_string()) {
            outcome.records.push(record);
        } else {
            outcome.duplicates += 1;
        }
    }

    info!(
        input = input_len,
        unique = outcome.records.len(),
        duplicates = outcome.duplicates,
        "deduplicated records"
    );
    outcome
}
