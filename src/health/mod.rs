//! HealthMonitor: pluggable periodic health checks with failure thresholding
//! and recovery callbacks (§4.1).

mod monitor;

pub use monitor::{HealthMonitor, OverallHealth, Probe, RecoveryCallback};
