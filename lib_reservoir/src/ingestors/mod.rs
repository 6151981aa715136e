//! # Data Ingestors Module
//!
//! Record sources that turn flat files into ordered `Record` sequences for
//! the publisher. Malformed input is rejected here, never in the core.

/// CSV files with a date column and a measurement column.
pub mod csv_records;

pub use csv_records::{CsvRecordSource, LoadedRecords, SourceError};
