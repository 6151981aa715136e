use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use lib_reservoir::core::DailySummary;

/// Writes the daily summaries as a pretty-printed JSON array.
pub fn write_summaries(path: &Path, summaries: &[DailySummary]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summaries)?;
    log::info!("Exported {} daily summaries to {}", summaries.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_reservoir::core::Aggregator;

    #[test]
    fn exports_snapshot_as_json() {
        let aggregator = Aggregator::new();
        aggregator.record("shasta", "2023-01-01", 10.0);
        aggregator.record("shasta", "2023-01-01", 20.0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("summary.json");
        write_summaries(&path, &aggregator.snapshot()).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value[0]["date"], "2023-01-01");
        assert_eq!(value[0]["sources"]["shasta"]["count"], 2);
        assert_eq!(value[0]["sources"]["shasta"]["mean"], 15.0);
    }
}
