use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use super::core::{NullSink, RecordSink, TableSink};
use super::csv::CsvSink;
use super::json::JsonSink;
use crate::error::RunError;
use crate::settings::OutputSettings;

/// The kinds of per-chain output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Sample,
    StartParams,
    Diagnostics,
    Metric,
}

impl ContentKind {
    pub fn file_tag(self) -> &'static str {
        match self {
            ContentKind::Sample => "sample",
            ContentKind::StartParams => "start_params",
            ContentKind::Diagnostics => "param_grads",
            ContentKind::Metric => "metric",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ContentKind::Metric => "json",
            ContentKind::Sample | ContentKind::StartParams | ContentKind::Diagnostics => "csv",
        }
    }
}

/// `{model}_{timestamp}_chain{ordinal}_{kind}.{ext}`
pub fn output_file_name(
    model_name: &str,
    timestamp: &str,
    chain_ordinal: usize,
    kind: ContentKind,
) -> String {
    format!(
        "{}_{}_chain{}_{}.{}",
        model_name,
        timestamp,
        chain_ordinal,
        kind.file_tag(),
        kind.extension()
    )
}

/// A timestamp identifying one run, eg `20240131_142501`.
pub fn generate_timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Return the directory outputs go to, creating it if needed.
///
/// An empty path selects a fresh directory in the system temp dir.
pub fn ensure_output_dir(output_dir: &Path) -> Result<PathBuf, RunError> {
    let dir = if output_dir.as_os_str().is_empty() {
        let seconds = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "nuts_output_{}_{}",
            seconds,
            std::process::id()
        ))
    } else {
        output_dir.to_path_buf()
    };
    std::fs::create_dir_all(&dir).map_err(|source| RunError::Sink {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// Files written by one chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputPaths {
    pub sample: PathBuf,
    pub start_params: Option<PathBuf>,
    pub diagnostics: Option<PathBuf>,
    pub metric: Option<PathBuf>,
}

/// The sinks of one chain.
///
/// Outputs that were not requested are bound to a [`NullSink`]. The sinks
/// are closed exactly once, by [`OutputSinkSet::close`] or on drop.
pub struct OutputSinkSet {
    pub sample: Box<dyn TableSink>,
    pub start_params: Box<dyn TableSink>,
    pub diagnostics: Box<dyn TableSink>,
    pub metric: Box<dyn RecordSink>,
    closed: bool,
}

fn table_sink(dir: &Path, name: String) -> Result<Box<dyn TableSink>, RunError> {
    let path = dir.join(name);
    debug!(path = ?path, "creating output file");
    match CsvSink::create(&path) {
        Ok(sink) => Ok(Box::new(sink)),
        Err(source) => Err(RunError::Sink { path, source }),
    }
}

impl OutputSinkSet {
    /// Open the files of one chain in `output.output_dir`, which must exist.
    ///
    /// Failing to open any requested file is fatal.
    pub fn create(
        output: &OutputSettings,
        model_name: &str,
        timestamp: &str,
        chain_ordinal: usize,
    ) -> Result<Self, RunError> {
        let dir = output.output_dir.as_path();
        let name = |kind| output_file_name(model_name, timestamp, chain_ordinal, kind);

        let sample = table_sink(dir, name(ContentKind::Sample))?;
        let start_params = if output.save_start_params {
            table_sink(dir, name(ContentKind::StartParams))?
        } else {
            Box::new(NullSink)
        };
        let diagnostics = if output.save_diagnostics {
            table_sink(dir, name(ContentKind::Diagnostics))?
        } else {
            Box::new(NullSink)
        };
        let metric: Box<dyn RecordSink> = if output.save_metric {
            let path = dir.join(name(ContentKind::Metric));
            debug!(path = ?path, "creating output file");
            match JsonSink::create(&path) {
                Ok(sink) => Box::new(sink),
                Err(source) => return Err(RunError::Sink { path, source }),
            }
        } else {
            Box::new(NullSink)
        };

        Ok(Self {
            sample,
            start_params,
            diagnostics,
            metric,
            closed: false,
        })
    }

    /// A set that discards all output.
    pub fn null() -> Self {
        Self {
            sample: Box::new(NullSink),
            start_params: Box::new(NullSink),
            diagnostics: Box::new(NullSink),
            metric: Box::new(NullSink),
            closed: false,
        }
    }

    pub fn paths(&self) -> OutputPaths {
        OutputPaths {
            sample: self.sample.path().map(Path::to_path_buf).unwrap_or_default(),
            start_params: self.start_params.path().map(Path::to_path_buf),
            diagnostics: self.diagnostics.path().map(Path::to_path_buf),
            metric: self.metric.path().map(Path::to_path_buf),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flush and close every sink. All sinks are closed even if one fails;
    /// the first error is returned.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let results = [
            self.sample.close(),
            self.start_params.close(),
            self.diagnostics.close(),
            self.metric.close(),
        ];
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}

impl Drop for OutputSinkSet {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::error!("failed to close output files: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn output(dir: &Path, flags: bool) -> OutputSettings {
        OutputSettings {
            output_dir: dir.to_path_buf(),
            save_start_params: flags,
            save_warmup: false,
            save_diagnostics: flags,
            save_metric: flags,
        }
    }

    #[test]
    fn file_names() {
        assert_eq!(
            output_file_name("eight", "20240101_120000", 2, ContentKind::Diagnostics),
            "eight_20240101_120000_chain2_param_grads.csv"
        );
        assert_eq!(
            output_file_name("eight", "t", 1, ContentKind::Metric),
            "eight_t_chain1_metric.json"
        );
    }

    #[test]
    fn only_requested_files_exist() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = OutputSinkSet::create(&output(dir.path(), false), "m", "t", 1).unwrap();
        sinks.close().unwrap();
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, vec!["m_t_chain1_sample.csv".to_string()]);
        assert_eq!(sinks.paths().metric, None);
    }

    #[test]
    fn all_files_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = OutputSinkSet::create(&output(dir.path(), true), "m", "t", 3).unwrap();
        let paths = sinks.paths();
        drop(sinks);
        assert!(paths.sample.exists());
        assert!(paths.start_params.unwrap().ends_with("m_t_chain3_start_params.csv"));
        assert!(paths.diagnostics.unwrap().exists());
        assert!(paths.metric.unwrap().exists());
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = OutputSinkSet::create(&output(dir.path(), true), "m", "t", 1).unwrap();
        sinks.sample.write_header(&["a".to_string()]).unwrap();
        sinks.close().unwrap();
        assert!(sinks.is_closed());
        sinks.close().unwrap();
        assert!(sinks.sample.write_row(&[1.]).is_err());
    }

    #[test]
    fn unopenable_output_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does_not_exist");
        let err = OutputSinkSet::create(&output(&missing, false), "m", "t", 1)
            .err()
            .unwrap();
        assert!(matches!(err, RunError::Sink { .. }));
        assert!(err.to_string().contains("m_t_chain1_sample.csv"));
    }

    #[test]
    fn temp_output_dir() {
        let dir = ensure_output_dir(Path::new("")).unwrap();
        assert!(dir.is_dir());
        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("nuts_output_"));
        std::fs::remove_dir(&dir).unwrap();
    }
}
