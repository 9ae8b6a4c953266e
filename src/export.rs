//! Sequence export.
//!
//! Sequences are written either as one JSON document carrying run metadata,
//! or as JSON Lines with one sequence per line.

use crate::config::SequencerConfig;
use crate::core::sequence::Sequence;
use crate::error::{Result, SequencerError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// Version of the export document layout.
pub const EXPORT_VERSION: &str = "1.0";

/// The name of this producer.
pub const PRODUCER_NAME: &str = "standard-sequencer";

/// Output layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Jsonl,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Jsonl => "jsonl",
            ExportFormat::Json => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" | "ndjson" => Ok(ExportFormat::Jsonl),
            "json" => Ok(ExportFormat::Json),
            other => Err(SequencerError::Config(format!(
                "unknown export format '{other}' (expected json or jsonl)"
            ))),
        }
    }
}

/// Producer metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportProducer {
    /// Name of the producing software
    pub name: String,
    /// Version of the producing software
    pub version: String,
    /// Identifier of the run that produced the export
    pub run_id: Uuid,
}

/// Parameters the sequences were built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportParameters {
    pub timestamp_column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_column: Option<String>,
    pub resampling_rate_ms: i64,
    pub gap_threshold_ms: u64,
    pub sequence_length: usize,
    pub sequence_shift: usize,
}

impl From<&SequencerConfig> for ExportParameters {
    fn from(config: &SequencerConfig) -> Self {
        Self {
            timestamp_column: config.timestamp_column.clone(),
            category_column: config.category_column.clone(),
            resampling_rate_ms: config.resampling_rate_ms(),
            gap_threshold_ms: config.gap_threshold.as_millis() as u64,
            sequence_length: config.sequence_length,
            sequence_shift: config.sequence_shift,
        }
    }
}

/// A complete export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBatch {
    /// Layout version
    pub export_version: String,
    /// When the export was written (RFC3339)
    pub computed_at_utc: String,
    /// Producer metadata
    pub producer: ExportProducer,
    /// Engine parameters
    pub parameters: ExportParameters,
    /// Exported sequences
    pub sequences: Vec<Sequence>,
}

impl ExportBatch {
    pub fn new(run_id: Uuid, config: &SequencerConfig, sequences: Vec<Sequence>) -> Self {
        Self {
            export_version: EXPORT_VERSION.to_string(),
            computed_at_utc: Utc::now().to_rfc3339(),
            producer: ExportProducer {
                name: PRODUCER_NAME.to_string(),
                version: crate::VERSION.to_string(),
                run_id,
            },
            parameters: ExportParameters::from(config),
            sequences,
        }
    }
}

/// Write sequences to any sink in the given layout.
pub fn write_sequences<W: Write>(writer: W, format: ExportFormat, batch: &ExportBatch) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    match format {
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, batch)?;
            writeln!(writer)?;
        }
        ExportFormat::Jsonl => {
            for sequence in &batch.sequences {
                serde_json::to_writer(&mut writer, sequence)?;
                writeln!(writer)?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Write sequences to a file, creating parent directories.
pub fn export_to_file(path: &Path, format: ExportFormat, batch: &ExportBatch) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_sequences(File::create(path)?, format, batch)
}

/// Default file name for an export of the given run.
pub fn export_file_name(run_id: Uuid, format: ExportFormat) -> String {
    format!(
        "sequences_{}_{}.{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        run_id.simple(),
        format.extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn batch() -> ExportBatch {
        let sequence = Sequence {
            category: Some("A".to_string()),
            window_start: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            index: 0,
            start: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            features: BTreeMap::from([(
                "v".to_string(),
                vec![Value::Float(1.5), Value::Missing],
            )]),
        };
        ExportBatch::new(
            Uuid::new_v4(),
            &SequencerConfig::new("ts").with_category("cat"),
            vec![sequence.clone(), Sequence { index: 1, ..sequence }],
        )
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSONL".parse::<ExportFormat>().unwrap(), ExportFormat::Jsonl);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("csv".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_jsonl_one_sequence_per_line() {
        let mut out = Vec::new();
        write_sequences(&mut out, ExportFormat::Jsonl, &batch()).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["category"], "A");
        assert_eq!(first["features"]["v"], serde_json::json!([1.5, null]));
    }

    #[test]
    fn test_json_document_carries_metadata() {
        let batch = batch();
        let mut out = Vec::new();
        write_sequences(&mut out, ExportFormat::Json, &batch).unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(doc["export_version"], EXPORT_VERSION);
        assert_eq!(doc["producer"]["name"], PRODUCER_NAME);
        assert_eq!(doc["producer"]["run_id"], batch.producer.run_id.to_string());
        assert_eq!(doc["parameters"]["category_column"], "cat");
        assert_eq!(doc["sequences"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let batch = batch();
        let path = dir
            .path()
            .join("out")
            .join(export_file_name(batch.producer.run_id, ExportFormat::Json));

        export_to_file(&path, ExportFormat::Json, &batch).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let restored: ExportBatch = serde_json::from_str(&content).unwrap();
        assert_eq!(restored, batch);
        assert!(path.to_string_lossy().ends_with(".json"));
    }
}
