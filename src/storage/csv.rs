//! CSV table sink.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use itertools::Itertools;

use super::core::TableSink;

/// Writes a table as comma separated values.
///
/// Missing values are written as `NA`, infinities as `Inf` and `-Inf`.
pub struct CsvSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    precision: usize,
}

impl CsvSink {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            precision: 6,
        })
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        let path = &self.path;
        self.writer
            .as_mut()
            .with_context(|| format!("CSV file was already closed: {:?}", path))
    }

    fn format_value(&self, value: f64) -> String {
        if value.is_nan() {
            "NA".to_string()
        } else if value.is_infinite() {
            if value > 0.0 { "Inf" } else { "-Inf" }.to_string()
        } else if value.fract() == 0. && value.abs() < 1e15 {
            format!("{}", value as i64)
        } else {
            format!("{:.prec$}", value, prec = self.precision)
        }
    }
}

impl TableSink for CsvSink {
    fn write_header(&mut self, names: &[String]) -> Result<()> {
        let path = self.path.clone();
        writeln!(self.writer()?, "{}", names.join(","))
            .with_context(|| format!("Failed to write CSV header: {:?}", path))
    }

    fn write_row(&mut self, values: &[f64]) -> Result<()> {
        let line = values.iter().map(|&val| self.format_value(val)).join(",");
        let path = self.path.clone();
        writeln!(self.writer()?, "{}", line)
            .with_context(|| format!("Failed to write CSV row: {:?}", path))
    }

    fn write_comment(&mut self, text: &str) -> Result<()> {
        let path = self.path.clone();
        let writer = self.writer()?;
        for line in text.lines() {
            writeln!(writer, "# {}", line)
                .with_context(|| format!("Failed to write CSV comment: {:?}", path))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .with_context(|| format!("Failed to flush CSV file: {:?}", self.path))?;
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn write_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut sink = CsvSink::create(&path).unwrap();
        sink.write_header(&["lp__".to_string(), "x".to_string()])
            .unwrap();
        sink.write_row(&[-1.5, 2.]).unwrap();
        sink.write_comment("Adaptation terminated\nStep size = 0.5")
            .unwrap();
        sink.write_row(&[f64::NAN, f64::NEG_INFINITY]).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "lp__,x\n-1.500000,2\n# Adaptation terminated\n# Step size = 0.5\nNA,-Inf\n"
        );
        assert!(sink.write_row(&[1.]).is_err());
    }

    #[test]
    fn custom_precision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut sink = CsvSink::create(&path).unwrap().with_precision(2);
        sink.write_row(&[0.123456, 3., f64::INFINITY]).unwrap();
        sink.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0.12,3,Inf\n");
    }

    #[test]
    fn create_in_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.csv");
        assert!(CsvSink::create(path).is_err());
    }
}
