pub mod controller;
pub mod http;
pub mod latency;
pub mod parse;
pub mod source;

pub use controller::{AcquisitionController, Sources};
pub use source::{ExtractionSource, SourceError};
