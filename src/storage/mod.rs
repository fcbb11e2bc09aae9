pub mod sink;

pub use sink::{CsvSampleSink, SampleStore};
