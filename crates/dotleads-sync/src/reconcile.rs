//! New-vs-existing split against the day's partition, append-only.

use std::collections::HashSet;

use chrono::NaiveDate;
use dotleads_core::{header_row, partition_name, NormalizedRecord, ReconciliationResult};
use dotleads_storage::{Destination, DestinationError};
use tracing::info;

/// Append the records of `batch` that the day's partition does not hold yet.
///
/// Stored rows are never rewritten, so running this again with the same batch
/// appends nothing and reports every record as existing.
pub async fn reconcile(
    destination: &dyn Destination,
    date: NaiveDate,
    batch: &[NormalizedRecord],
) -> Result<ReconciliationResult, DestinationError> {
    let name = partition_name(date);

    let (partition, stored_keys) = match destination.find_partition(&name).await? {
        Some(partition) => {
            let keys: HashSet<String> = destination.read_keys(&partition).await?.into_iter().collect();
            info!(partition = %name, stored = keys.len(), "partition exists");
            (partition, keys)
        }
        None => {
            let partition = destination
                .create_partition(&name, &header_row(), batch.len())
                .await?;
            (partition, HashSet::new())
        }
    };

    let (existing, new_records): (Vec<&NormalizedRecord>, Vec<&NormalizedRecord>) = batch
        .iter()
        .partition(|record| stored_keys.contains(record.natural_key()));
    let new_records: Vec<NormalizedRecord> = new_records.into_iter().cloned().collect();

    if !new_records.is_empty() {
        let rows: Vec<Vec<String>> = new_records.iter().map(NormalizedRecord::to_row).collect();
        destination.append_rows(&partition, &rows).await?;
    }

    info!(
        partition = %name,
        new = new_records.len(),
        existing = existing.len(),
        "reconciled batch"
    );

    Ok(ReconciliationResult {
        new_records,
        existing_count: existing.len(),
        destination_reference: destination.partition_reference(&partition),
    })
}
