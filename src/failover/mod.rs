//! FailoverManager: primary/secondary role tracking, automatic promotion of
//! secondaries, and controlled failback (§4.3).

mod manager;

pub use manager::{FailoverGroupSnapshot, FailoverManager};
