//! Structured telemetry for contract violations.
//!
//! The core never panics in release builds when one of its invariants is
//! broken; instead it emits a [`ContractViolation`] describing what went wrong
//! and recovers along a documented fallback path. Violations are structured
//! data that can be:
//!
//! - logged via `tracing` (always),
//! - collected programmatically by tests via [`CollectingObserver`],
//! - routed to custom observers (metrics, alerting).
//!
//! In debug builds a [`ViolationSeverity::Critical`] violation additionally
//! aborts with a descriptive message, so programmer errors surface loudly
//! during development while production servers degrade gracefully.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::UpdateIdx;

/// Severity of a violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the operation continued with a fallback.
    Warning,
    /// Serious issue; the operation may have degraded behaviour.
    Error,
    /// A core invariant is broken; state may be corrupted. Aborts in debug
    /// builds.
    Critical,
}

impl ViolationSeverity {
    /// String form suitable for log and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem a violation originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Update-index bookkeeping went out of step.
    UpdateSync,
    /// Input history invariant violated.
    InputHistory,
    /// Snapshot ring invariant violated.
    StateManagement,
    /// Wire protocol handling invariant violated.
    NetworkProtocol,
    /// Desync bookkeeping inconsistency.
    DesyncTracking,
    /// Connection table inconsistency.
    ConnectionLifecycle,
    /// Internal logic error that should never happen.
    InternalError,
}

impl ViolationKind {
    /// String form suitable for log and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateSync => "update_sync",
            Self::InputHistory => "input_history",
            Self::StateManagement => "state_management",
            Self::NetworkProtocol => "network_protocol",
            Self::DesyncTracking => "desync_tracking",
            Self::ConnectionLifecycle => "connection_lifecycle",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded contract violation with its diagnostic context.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContractViolation {
    /// Severity level.
    pub severity: ViolationSeverity,
    /// Originating subsystem.
    pub kind: ViolationKind,
    /// Human-readable description.
    pub message: String,
    /// Source location (`file:line`) where the violation was detected.
    pub location: &'static str,
    /// The update at which the violation occurred, if applicable.
    pub update: Option<UpdateIdx>,
    /// Additional structured context as key-value pairs.
    pub context: BTreeMap<String, String>,
}

impl ContractViolation {
    /// Creates a new violation record.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            update: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches the update index the violation occurred at.
    #[must_use]
    pub fn with_update(mut self, update: UpdateIdx) -> Self {
        self.update = Some(update);
        self
    }

    /// Attaches a key-value context pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} at {}: {}",
            self.severity, self.kind, self.location, self.message
        )
    }
}

/// Receives violations as they are reported.
pub trait ViolationObserver: Send + Sync {
    /// Called for every reported violation.
    fn on_violation(&self, violation: &ContractViolation);
}

/// Default observer: logs the violation via `tracing` at a level matching
/// its severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ContractViolation) {
        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    kind = violation.kind.as_str(),
                    location = violation.location,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    kind = violation.kind.as_str(),
                    severity = violation.severity.as_str(),
                    location = violation.location,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Test observer that stores every violation for later inspection.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ContractViolation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every violation collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<ContractViolation> {
        self.violations.lock().clone()
    }

    /// Drops all collected violations.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ContractViolation) {
        self.violations.lock().push(violation.clone());
    }
}

static EXTRA_OBSERVERS: Mutex<Vec<Arc<dyn ViolationObserver>>> = Mutex::new(Vec::new());

/// Registers an additional observer that will receive every violation
/// reported after this call, alongside the default tracing observer.
pub fn register_observer(observer: Arc<dyn ViolationObserver>) {
    EXTRA_OBSERVERS.lock().push(observer);
}

/// Removes all additional observers (test isolation).
pub fn clear_observers() {
    EXTRA_OBSERVERS.lock().clear();
}

/// Dispatches a violation to the tracing observer and every registered
/// extra observer. Critical violations abort in debug builds.
pub fn dispatch(violation: &ContractViolation) {
    TracingObserver.on_violation(violation);
    for observer in EXTRA_OBSERVERS.lock().iter() {
        observer.on_violation(violation);
    }
    debug_assert!(
        violation.severity != ViolationSeverity::Critical,
        "critical contract violation: {violation}"
    );
}

/// Reports a contract violation with source location attached.
///
/// ```ignore
/// report_violation!(
///     ViolationSeverity::Error,
///     ViolationKind::UpdateSync,
///     "advance to {} skipped updates (current {})",
///     requested,
///     current
/// );
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ContractViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::dispatch(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ContractViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::dispatch(&violation);
    }};
}

/// Types whose internal invariants can be checked at runtime.
///
/// Checks are intended for tests and debug sessions; they are never run
/// implicitly on hot paths.
pub trait InvariantChecker {
    /// Verifies the type's invariants, returning a description of the
    /// first violated one.
    ///
    /// # Errors
    /// Returns the violated invariant as a [`ContractViolation`].
    fn check_invariants(&self) -> Result<(), ContractViolation>;
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn violation_builder_attaches_context() {
        let violation = ContractViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::UpdateSync,
            "clamped trim bound",
            "rewinder.rs:1",
        )
        .with_update(UpdateIdx::new(42))
        .with_context("requested", "50");

        assert_eq!(violation.update, Some(UpdateIdx::new(42)));
        assert_eq!(violation.context.get("requested").map(String::as_str), Some("50"));
    }

    #[test]
    fn violation_serializes_to_json() {
        let violation = ContractViolation::new(
            ViolationSeverity::Error,
            ViolationKind::InputHistory,
            "gap in input sequence",
            "history.rs:7",
        );
        let json = serde_json::to_string(&violation).unwrap();
        assert!(json.contains(r#""severity":"error""#));
        assert!(json.contains(r#""kind":"input_history""#));
    }

    #[test]
    fn collecting_observer_records() {
        let observer = CollectingObserver::new();
        let violation = ContractViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::StateManagement,
            "test",
            "here:0",
        );
        observer.on_violation(&violation);
        observer.on_violation(&violation);
        assert_eq!(observer.violations().len(), 2);
        observer.clear();
        assert!(observer.violations().is_empty());
    }

    #[test]
    fn display_includes_location_and_kind() {
        let violation = ContractViolation::new(
            ViolationSeverity::Error,
            ViolationKind::NetworkProtocol,
            "bad bytes",
            "messages.rs:12",
        );
        let display = format!("{}", violation);
        assert!(display.contains("network_protocol"));
        assert!(display.contains("messages.rs:12"));
        assert!(display.contains("bad bytes"));
    }
}
