pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod sampler;
pub mod sink;
pub mod sweep;
pub mod telemetry;
pub mod trial;
pub mod util;

/// Bytes of DRAM traffic behind one CAS-count event (one cache line).
pub const DRAM_CAS_BYTES: f64 = 64.0;
