//! # CSV Record Source
//!
//! Reads one reservoir's flat file into an ordered `Vec<Record>` for the
//! publisher. The file needs a header row with a date column and a numeric
//! measurement column; other columns are ignored.
//!
//! Validation happens here, before the core sees anything. A file without one
//! of the required columns is rejected as a whole. Individual rows with an
//! empty date or a value that is not a finite number are logged and skipped,
//! and the rest of the file is kept in order.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::message::{Record, DEFAULT_DATE_FIELD, DEFAULT_VALUE_FIELD};

/// Default file name pattern; see [`resolve_path`].
pub const DEFAULT_FILE_PATTERN: &str = "{Source}_WML(Sample).csv";

/// Failures that reject a whole file.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Required column '{0}' is missing from the header")]
    MissingColumn(String),
}

/// Rows kept and rows skipped by one load.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRecords {
    pub records: Vec<Record>,
    pub rejected: usize,
}

/// # CSV Record Source
#[derive(Debug, Clone)]
pub struct CsvRecordSource {
    date_column: String,
    value_column: String,
}

impl Default for CsvRecordSource {
    fn default() -> Self {
        Self::new(DEFAULT_DATE_FIELD, DEFAULT_VALUE_FIELD)
    }
}

impl CsvRecordSource {
    pub fn new(date_column: impl Into<String>, value_column: impl Into<String>) -> Self {
        Self {
            date_column: date_column.into(),
            value_column: value_column.into(),
        }
    }

    /// Loads records from a file on disk.
    pub fn load(&self, path: &Path) -> Result<LoadedRecords, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let loaded = self.read_from(file)?;
        log::info!(
            "Loaded {} record(s) from {} ({} rejected)",
            loaded.records.len(),
            path.display(),
            loaded.rejected
        );
        Ok(loaded)
    }

    /// Loads records from any CSV stream.
    pub fn read_from<R: Read>(&self, reader: R) -> Result<LoadedRecords, SourceError> {
        let mut table = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let headers = table.headers()?.clone();
        let date_idx = column_index(&headers, &self.date_column)?;
        let value_idx = column_index(&headers, &self.value_column)?;

        let mut records = Vec::new();
        let mut rejected = 0;

        for (row, result) in table.records().enumerate() {
            // Header is line 1.
            let line = row + 2;
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    log::warn!("Skipping line {}: {}", line, e);
                    rejected += 1;
                    continue;
                }
            };

            let date = row.get(date_idx).unwrap_or_default();
            if date.is_empty() {
                log::warn!("Skipping line {}: empty {}", line, self.date_column);
                rejected += 1;
                continue;
            }

            let raw_value = row.get(value_idx).unwrap_or_default();
            match parse_value(raw_value) {
                Some(value) => records.push(Record::new(date, value)),
                None => {
                    log::warn!(
                        "Skipping line {}: {} '{}' is not a number",
                        line,
                        self.value_column,
                        raw_value
                    );
                    rejected += 1;
                }
            }
        }

        Ok(LoadedRecords { records, rejected })
    }
}

/// Resolves the file for `source` in `dir` from a name pattern.
///
/// `{source}` is replaced by the source name as given, `{Source}` by the same
/// name with its first letter upper-cased.
pub fn resolve_path(dir: &Path, pattern: &str, source: &str) -> PathBuf {
    let mut chars = source.chars();
    let capitalised: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    dir.join(
        pattern
            .replace("{Source}", &capitalised)
            .replace("{source}", source),
    )
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize, SourceError> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| SourceError::MissingColumn(name.to_string()))
}

/// Parses a measurement, accepting thousands separators ("1,234.5").
fn parse_value(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_row_order_and_ignores_extra_columns() {
        let data = concat!(
            "Date,Reservoir,TAF\n",
            "2023-01-01,Shasta,10\n",
            "2023-01-01,Shasta,20\n",
            "2023-01-02,Shasta,\"1,234.5\"\n",
        );
        let loaded = CsvRecordSource::default().read_from(data.as_bytes()).unwrap();
        assert_eq!(loaded.rejected, 0);
        assert_eq!(
            loaded.records,
            vec![
                Record::new("2023-01-01", 10.0),
                Record::new("2023-01-01", 20.0),
                Record::new("2023-01-02", 1234.5),
            ]
        );
    }

    #[test]
    fn skips_malformed_rows() {
        let data = "Date,TAF\n2023-01-01,10\n,5\n2023-01-02,n/a\n2023-01-03,NaN\n2023-01-04,7\n";
        let loaded = CsvRecordSource::default().read_from(data.as_bytes()).unwrap();
        assert_eq!(loaded.rejected, 3);
        assert_eq!(
            loaded.records,
            vec![Record::new("2023-01-01", 10.0), Record::new("2023-01-04", 7.0)]
        );
    }

    #[test]
    fn missing_column_rejects_the_file() {
        let data = "Date,Storage\n2023-01-01,10\n";
        let err = CsvRecordSource::default().read_from(data.as_bytes()).unwrap_err();
        assert!(matches!(err, SourceError::MissingColumn(c) if c == "TAF"));
    }

    #[test]
    fn resolves_file_names_from_pattern() {
        let dir = Path::new("/data");
        assert_eq!(
            resolve_path(dir, DEFAULT_FILE_PATTERN, "shasta"),
            PathBuf::from("/data/Shasta_WML(Sample).csv")
        );
        assert_eq!(
            resolve_path(dir, "{source}.csv", "oroville"),
            PathBuf::from("/data/oroville.csv")
        );
    }
}
