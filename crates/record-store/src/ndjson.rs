//! Newline-delimited JSON interchange: one `InferenceRecord` per line.

use std::io::{BufRead, Write};

use futures_util::StreamExt;
use serde::Serialize;

use replay_core::{InferenceRecord, PutOutcome, RecordStore, ReplayError, ReplayResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub already_present: usize,
}

/// Parse and structurally verify every record in `reader`. Blank lines are
/// skipped; the first bad line aborts with its line number.
pub fn read_records<R: BufRead>(reader: R) -> ReplayResult<Vec<InferenceRecord>> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: InferenceRecord = serde_json::from_str(trimmed).map_err(|e| {
            ReplayError::CorruptRecord(format!("line {}: {}", idx + 1, e))
        })?;
        record.verify().map_err(|e| match e {
            ReplayError::CorruptRecord(msg) => {
                ReplayError::CorruptRecord(format!("line {}: {}", idx + 1, msg))
            }
            other => other,
        })?;
        records.push(record);
    }
    Ok(records)
}

pub fn write_record<W: Write>(writer: &mut W, record: &InferenceRecord) -> ReplayResult<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Load an NDJSON dump into `store`. Nothing is written unless every line
/// parses; store errors stop the import at the failing record.
pub async fn import_records<R: BufRead>(
    store: &dyn RecordStore,
    reader: R,
) -> ReplayResult<ImportSummary> {
    let records = read_records(reader)?;
    let mut summary = ImportSummary::default();

    for record in records {
        match store.put(record).await? {
            PutOutcome::Inserted => summary.inserted += 1,
            PutOutcome::AlreadyPresent => summary.already_present += 1,
        }
    }

    tracing::info!(
        "Imported {} records ({} already present) into {} store",
        summary.inserted,
        summary.already_present,
        store.backend_name()
    );
    Ok(summary)
}

/// Stream a partition's time range out as NDJSON. Returns the record count.
pub async fn export_range<W: Write>(
    store: &dyn RecordStore,
    pair: &str,
    timeframe: &str,
    from_ts: i64,
    to_ts: i64,
    writer: &mut W,
) -> ReplayResult<usize> {
    let mut stream = store.range_query(pair, timeframe, from_ts, to_ts);
    let mut count = 0;
    while let Some(record) = stream.next().await {
        write_record(writer, &record?)?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}
