//! Error kinds surfaced by the undervolting engine
//!
//! Every precondition failure and device fault maps to exactly one
//! variant with a fixed human-readable message. Binaries are expected
//! to route errors through [`error_message`] (or `Display`) for the
//! operator.

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors produced by the specification validator, the device drivers
/// and the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `run()` was called before a specification was installed
    #[error("no specification installed; build one from defaults and call set_spec first")]
    NotInitialised,

    /// Software sweep range does not descend
    #[error("sweep start offset must lie above the end offset")]
    RangeInvalid,

    /// Specification carries no workload
    #[error("no workload provided to run under reduced voltage")]
    NoWorkload,

    /// Looping was requested but nothing can terminate it
    #[error("loop mode requires a stop predicate when the workload does not signal stop itself")]
    NoStopPredicate,

    /// MSR device node could not be opened or driven
    #[error("cannot access the MSR device node; load the msr module and run with elevated privileges")]
    MsrInaccessible(#[source] std::io::Error),

    /// Hardware mode without a Teensy device path
    #[error("no Teensy serial device path provided")]
    NoTeensyPath,

    /// Hardware mode with DTR triggering but no trigger device path
    #[error("no trigger serial device path provided")]
    NoTriggerPath,

    /// A command could not be delivered to the Teensy
    #[error("write to the Teensy serial line failed")]
    TeensyWriteFailed(#[source] std::io::Error),

    /// Serial lines could not be opened and configured
    #[error("hardware glitcher initialisation failed")]
    HardwareInitFailed(#[source] std::io::Error),

    /// Fallback for faults with no more specific kind
    #[error("undervolting engine error")]
    Generic,
}

/// Human-readable label for an error kind.
pub fn error_message(error: &EngineError) -> String {
    error.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_stable() {
        assert_eq!(
            error_message(&EngineError::NoWorkload),
            "no workload provided to run under reduced voltage"
        );
        assert_eq!(
            error_message(&EngineError::RangeInvalid),
            "sweep start offset must lie above the end offset"
        );
    }

    #[test]
    fn test_io_sources_are_preserved() {
        let err = EngineError::MsrInaccessible(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("denied"));
    }
}
