//! Thin `Logger` collaborator interface (§6). Every component logs through
//! `tracing` directly; this trait exists only for the rare external
//! collaborator that wants to intercept events programmatically (e.g. to
//! forward them into the dashboard named in §1).

/// Severity, mirroring `tracing::Level` without forcing callers to depend on
/// it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, component: &str, message: &str);
}

/// Default logger: forwards straight into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, component: &str, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(component, "{}", message),
            LogLevel::Info => tracing::info!(component, "{}", message),
            LogLevel::Warn => tracing::warn!(component, "{}", message),
            LogLevel::Error => tracing::error!(component, "{}", message),
        }
    }
}
