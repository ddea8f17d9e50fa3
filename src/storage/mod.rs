mod core;
mod csv;
mod json;
mod sinks;

pub use csv::CsvSink;
pub use json::{JsonSink, MetricRecord};
pub use sinks::{
    ensure_output_dir, generate_timestamp, output_file_name, ContentKind, OutputPaths,
    OutputSinkSet,
};

pub use self::core::{NullSink, RecordSink, TableSink};
