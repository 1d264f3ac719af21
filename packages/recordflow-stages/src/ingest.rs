//! JSONL ingestion.
//!
//! One record per line. Malformed lines and duplicate ids are logged and
//! skipped rather than aborting the run; the input files come from upstream
//! exports that occasionally truncate.

use recordflow_orchestration::Record;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No usable records in {0}")]
    Empty(String),
}

/// Load records from a JSONL file, keeping input order. `limit` truncates
/// after that many usable records.
pub fn load_records_jsonl(path: &Path, limit: Option<usize>) -> Result<Vec<Record>, IngestError> {
    let display = path.display().to_string();
    let file = std::fs::File::open(path).map_err(|source| IngestError::Io {
        path: display.clone(),
        source,
    })?;

    let mut records = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| IngestError::Io {
            path: display.clone(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(error) => {
                warn!(line = index + 1, %error, "skipping malformed record");
                continue;
            }
        };
        if !seen.insert(record.record_id.clone()) {
            warn!(line = index + 1, record_id = %record.record_id, "skipping duplicate record id");
            continue;
        }

        records.push(record);
        if limit.is_some_and(|n| records.len() >= n) {
            break;
        }
    }

    if records.is_empty() {
        return Err(IngestError::Empty(display));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn input(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn test_loads_in_order() {
        let file = input(&[
            r#"{"record_id": "d-1", "name": "Sunny Days"}"#,
            r#"{"id": "d-2", "name": "Little Oaks", "website": "https://oaks.example"}"#,
        ]);

        let records = load_records_jsonl(file.path(), None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_id, "d-1");
        assert_eq!(records[1].record_id, "d-2");
        assert_eq!(records[1].website(), Some("https://oaks.example"));
    }

    #[test]
    fn test_tolerates_bad_lines_and_duplicates() {
        let file = input(&[
            r#"{"record_id": "d-1"}"#,
            "",
            "not json at all",
            r#"{"record_id": "d-1", "name": "dupe"}"#,
            r#"{"record_id": "d-2"}"#,
        ]);

        let records = load_records_jsonl(file.path(), None).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["d-1", "d-2"]);
    }

    #[test]
    fn test_limit_truncates() {
        let file = input(&[
            r#"{"record_id": "d-1"}"#,
            r#"{"record_id": "d-2"}"#,
            r#"{"record_id": "d-3"}"#,
        ]);

        let records = load_records_jsonl(file.path(), Some(2)).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        let file = input(&["", "not json"]);
        assert!(matches!(
            load_records_jsonl(file.path(), None),
            Err(IngestError::Empty(_))
        ));
    }
}
