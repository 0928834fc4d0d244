//! Error taxonomy for COM sessions.
//!
//! Every fallible foreground operation returns [`CommResult`]. Device faults
//! raised on the caller's thread force the session offline before they are
//! returned; faults raised by the event monitor are parked and surfaced on the
//! next checked call wrapped in [`CommError::BackgroundFault`].

use thiserror::Error;

use super::device::LineErrors;

pub const PORT_OPEN_FAILURE: &str = "Port Open Failure";
pub const BAD_QUEUE_SETTINGS: &str = "Bad queue settings";
pub const BAD_COM_SETTINGS: &str = "Bad com settings";
pub const BAD_TIMEOUT_SETTINGS: &str = "Bad timeout settings";
pub const UNEXPECTED_FAILURE: &str = "Unexpected failure";
pub const TRANSMISSION_FAILURE: &str = "Transmission failure";
pub const OFFLINE: &str = "Offline";

/// Errors surfaced by a [`Session`](super::session::Session).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    /// The OS refused an operation, the handle went invalid, or the session
    /// is offline.
    #[error("{0}")]
    DeviceFault(String),

    /// A completed write transferred fewer bytes than were queued.
    #[error("Send Timeout")]
    SendTimeout,

    /// The UART reported one or more line errors.
    #[error("UART Error: {0}")]
    LineError(LineErrors),

    /// The event monitor failed; the cause is carried along.
    #[error("Receive Thread Exception: {0}")]
    BackgroundFault(#[source] Box<CommError>),

    /// Configuration rejected before touching the device.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CommError {
    pub fn device(reason: impl Into<String>) -> Self {
        Self::DeviceFault(reason.into())
    }

    pub fn offline() -> Self {
        Self::DeviceFault(OFFLINE.to_string())
    }

    pub fn background(cause: CommError) -> Self {
        Self::BackgroundFault(Box::new(cause))
    }

    /// Innermost error, unwrapping any number of background wrappers.
    pub fn root_cause(&self) -> &CommError {
        match self {
            Self::BackgroundFault(inner) => inner.root_cause(),
            other => other,
        }
    }

    pub fn is_device_fault(&self) -> bool {
        matches!(self.root_cause(), Self::DeviceFault(_))
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, Self::DeviceFault(reason) if reason == OFFLINE)
    }
}

/// Convenient Result type for COM operations.
pub type CommResult<T> = Result<T, CommError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_display_texts() {
        assert_eq!(CommError::device(PORT_OPEN_FAILURE).to_string(), "Port Open Failure");
        assert_eq!(CommError::SendTimeout.to_string(), "Send Timeout");
        assert_eq!(
            CommError::LineError(LineErrors::FRAME | LineErrors::OVERRUN).to_string(),
            "UART Error: Framing,Overrun"
        );
        assert_eq!(
            CommError::background(CommError::offline()).to_string(),
            "Receive Thread Exception: Offline"
        );
    }

    #[test]
    fn test_root_cause_unwraps_nested_background() {
        let err = CommError::background(CommError::background(CommError::SendTimeout));
        assert_eq!(err.root_cause(), &CommError::SendTimeout);
        assert!(!err.is_device_fault());
        assert!(CommError::background(CommError::offline()).is_device_fault());
    }

    #[test]
    fn test_background_fault_exposes_source() {
        let err = CommError::background(CommError::LineError(LineErrors::RX_PARITY));
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("UART Error: Parity"));
    }

    #[test]
    fn test_is_offline() {
        assert!(CommError::offline().is_offline());
        assert!(!CommError::device(UNEXPECTED_FAILURE).is_offline());
        assert!(!CommError::InvalidConfig("x".into()).is_offline());
    }
}
