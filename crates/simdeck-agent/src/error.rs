//! Error type shared by the registry, the LPA layer and the provisioning
//! service.

use simdeck_common::models::SequenceNumber;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device bus (ModemManager) failed or is unreachable.
    #[error("device bus: {0}")]
    Transport(String),

    /// No usable APDU channel could be opened for the modem.
    #[error("secure element channel: {0}")]
    Channel(String),

    #[error("no supported ISD-R AID found or it's not an eUICC")]
    NoSupportedSecureElement,

    /// The primary operation succeeded but some notifications could not be
    /// delivered. `sequences` lists every notification that was attempted.
    #[error("{} of {} notification(s) failed: {}", failures.len(), sequences.len(), failures.join("; "))]
    PartialNotificationFailure {
        sequences: Vec<SequenceNumber>,
        failures: Vec<String>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("client disconnected")]
    Disconnected,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("modem {0} not found")]
    ModemNotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    /// The profile protocol engine reported a failure.
    #[error("{0}")]
    Protocol(String),

    /// A download was attempted but no profile engine is configured.
    #[error("profile engine unavailable")]
    EngineUnavailable,

    #[error("modem {identity}: {source}")]
    Device {
        identity: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap with the identity of the modem the operation ran against.
    pub fn on_device(self, identity: impl Into<String>) -> Self {
        match self {
            already @ Error::Device { .. } => already,
            source => Error::Device {
                identity: identity.into(),
                source: Box::new(source),
            },
        }
    }

    /// The innermost error, with any device context removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Device { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<zbus::Error> for Error {
    fn from(err: zbus::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<zbus::fdo::Error> for Error {
    fn from(err: zbus::fdo::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_context_is_applied_once() {
        let err = Error::DeadlineExceeded.on_device("860000000000001").on_device("other");
        assert!(matches!(err.root(), Error::DeadlineExceeded));
        assert_eq!(err.to_string(), "modem 860000000000001: deadline exceeded");
    }

    #[test]
    fn partial_failure_summarises_counts() {
        let err = Error::PartialNotificationFailure {
            sequences: vec![7, 8],
            failures: vec!["handle 8: timeout".into()],
        };
        assert_eq!(
            err.to_string(),
            "1 of 2 notification(s) failed: handle 8: timeout"
        );
    }
}
