use std::path::Path;

use anyhow::Result;

/// An append-only table destination, one row per saved draw.
///
/// Rows are written in the order they are produced.
pub trait TableSink: Send {
    /// Write the column names. Called once before any row.
    fn write_header(&mut self, names: &[String]) -> Result<()>;

    fn write_row(&mut self, values: &[f64]) -> Result<()>;

    /// Write free-form text that is not part of the table.
    fn write_comment(&mut self, text: &str) -> Result<()>;

    /// Flush and release the destination. Further calls are no-ops.
    fn close(&mut self) -> Result<()>;

    /// The file backing this sink, if there is one.
    fn path(&self) -> Option<&Path>;
}

/// A destination for structured records.
pub trait RecordSink: Send {
    fn write_record(&mut self, record: &serde_json::Value) -> Result<()>;

    /// Flush and release the destination. Further calls are no-ops.
    fn close(&mut self) -> Result<()>;

    fn path(&self) -> Option<&Path>;
}

/// Stands in for outputs that were not requested. Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TableSink for NullSink {
    fn write_header(&mut self, _names: &[String]) -> Result<()> {
        Ok(())
    }

    fn write_row(&mut self, _values: &[f64]) -> Result<()> {
        Ok(())
    }

    fn write_comment(&mut self, _text: &str) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

impl RecordSink for NullSink {
    fn write_record(&mut self, _record: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}
