//! Sensor sources and the sample types they emit.

pub mod manual;
pub mod simulated;
pub mod source;
pub mod types;

pub use manual::ManualSource;
pub use simulated::SimulatedSource;
pub use source::{BatchHandler, SensorError, SensorSource};
pub use types::{Batch, Sample, SamplePayload, SamplingRate, SensorKind};
