// JSONL export/import of queue snapshots

use crate::entry::{NewEntry, QueueEntry};
use crate::error::StoreError;
use crate::store::QueueStore;
use serde::{Serialize, de::DeserializeOwned};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Replace a JSONL file with the given records, one per line
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<(), StoreError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

/// Read all records from a JSONL file in file order
///
/// Blank lines are ignored. Lines that fail to read or parse are skipped with
/// a warning so one damaged line doesn't hide the rest of the file.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        // File doesn't exist yet, nothing to read
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(
                    file = ?path,
                    line = line_num + 1,
                    error = ?e,
                    "Failed to read line, skipping"
                );
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str(&line) {
            Ok(r) => records.push(r),
            Err(e) => {
                warn!(
                    file = ?path,
                    line = line_num + 1,
                    error = ?e,
                    "Failed to parse JSON, skipping"
                );
            }
        }
    }

    info!(file = ?path, count = records.len(), "Loaded records from JSONL");
    Ok(records)
}

/// Write the current queue to a JSONL file. Returns the number exported.
pub fn export_queue(store: &QueueStore, path: &Path) -> Result<usize, StoreError> {
    let entries = store.list_all()?;
    write_jsonl(path, &entries)?;
    info!(file = ?path, count = entries.len(), "Exported queue");
    Ok(entries.len())
}

/// Enqueue every entry from a JSONL export. Returns the number imported.
///
/// Kind, payload, client reference and enqueue time are kept; ids are
/// reassigned by the target store. Entries whose client reference is
/// already queued are skipped, so importing the same file twice is harmless.
pub fn import_queue(store: &QueueStore, path: &Path) -> Result<usize, StoreError> {
    let entries: Vec<QueueEntry> = read_jsonl(path)?;
    let mut imported = 0;

    for entry in entries {
        let old_id = entry.id;
        match store.enqueue_if_absent(NewEntry::from(entry)) {
            Ok(Some(_)) => imported += 1,
            Ok(None) => debug!(file = ?path, id = old_id, "Already queued, skipping"),
            Err(StoreError::InvalidEntry(reason)) => {
                warn!(file = ?path, id = old_id, %reason, "Skipping invalid entry");
            }
            Err(e) => return Err(e),
        }
    }

    info!(file = ?path, count = imported, "Imported queue");
    Ok(imported)
}
