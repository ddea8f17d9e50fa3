use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use super::core::RecordSink;

/// The adapted metric of a chain, as written to the metric file.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub stepsize: f64,
    pub metric_type: String,
    pub inv_metric: serde_json::Value,
}

/// Writes pretty-printed JSON records.
pub struct JsonSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonSink {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }
}

impl RecordSink for JsonSink {
    fn write_record(&mut self, record: &serde_json::Value) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .with_context(|| format!("JSON file was already closed: {:?}", self.path))?;
        serde_json::to_writer_pretty(&mut *writer, record)
            .with_context(|| format!("Failed to write JSON record: {:?}", self.path))?;
        writeln!(writer).with_context(|| format!("Failed to write JSON record: {:?}", self.path))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .with_context(|| format!("Failed to flush JSON file: {:?}", self.path))?;
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
