//! Error taxonomy for the relay.
//!
//! Two layers: [`StartError`] for failures that kill a whole start attempt
//! (surfaced to the supervisor, retried on the next trigger), and
//! [`ConnectionError`] for failures scoped to a single connection (logged,
//! pruned, never escalated). [`FaultKind`] is the coarse classification used
//! when logging socket-level faults.

use std::io;

use thiserror::Error;

/// Why a listener failed to start.
///
/// Classified from the bind error so the failure paths are enumerable rather
/// than caught generically. Every variant is retryable: the supervisor keeps
/// the configured port and tries again on the next heartbeat or connectivity
/// trigger.
#[derive(Debug, Error)]
pub enum StartError {
    /// The port is already bound by another process.
    #[error("port {port} is already in use")]
    Bind {
        /// Port the bind was attempted on.
        port: u16,
        /// Underlying bind failure.
        #[source]
        source: io::Error,
    },

    /// The environment forbids binding the port.
    #[error("binding port {port} was denied")]
    Permission {
        /// Port the bind was attempted on.
        port: u16,
        /// Underlying bind failure.
        #[source]
        source: io::Error,
    },

    /// Any other start failure.
    #[error("failed to start listener on port {port}")]
    Unknown {
        /// Port the bind was attempted on.
        port: u16,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
}

impl StartError {
    /// Classify a bind failure on `port`.
    pub fn from_bind(port: u16, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::AddrInUse => Self::Bind { port, source },
            io::ErrorKind::PermissionDenied => Self::Permission { port, source },
            _ => Self::Unknown { port, source },
        }
    }

    /// Port the failed start attempt targeted.
    pub fn port(&self) -> u16 {
        match self {
            Self::Bind { port, .. } | Self::Permission { port, .. } | Self::Unknown { port, .. } => {
                *port
            }
        }
    }
}

/// A failure scoped to one connection. Never terminates the hub or the
/// status responder; at most the one connection is pruned.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// A single connection's read, write, or accept failure.
    #[error("transient i/o failure")]
    TransientIo(#[from] io::Error),

    /// Inbound payload did not decode as an envelope. The connection stays
    /// open and the fixed reply is still sent.
    #[error("malformed payload")]
    ProtocolDecode(#[from] serde_json::Error),
}

/// Coarse classification of a socket-level fault, for structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The address is already bound.
    AddressInUse,
    /// Peer or route level failure: reset, abort, broken pipe, timeout.
    NetworkError,
    /// The environment denied the operation.
    PermissionDenied,
    /// Anything else.
    Unknown,
}

impl FaultKind {
    /// Classify an i/o error by kind.
    pub fn classify_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => Self::AddressInUse,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof => Self::NetworkError,
            _ => Self::Unknown,
        }
    }

    /// Classify an arbitrary error by walking its source chain for the
    /// underlying i/o failure. Errors with no i/o cause are `Unknown`.
    pub fn classify(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                return Self::classify_io(io_err);
            }
            current = e.source();
        }
        Self::Unknown
    }

    /// Stable label for log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddressInUse => "address_in_use",
            Self::NetworkError => "network_error",
            Self::PermissionDenied => "permission_denied",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn io_err(kind: io::ErrorKind) -> io::Error {
        io::Error::new(kind, "boom")
    }

    #[test]
    fn bind_failure_classification() {
        assert_matches!(
            StartError::from_bind(8060, io_err(io::ErrorKind::AddrInUse)),
            StartError::Bind { port: 8060, .. }
        );
        assert_matches!(
            StartError::from_bind(80, io_err(io::ErrorKind::PermissionDenied)),
            StartError::Permission { port: 80, .. }
        );
        assert_matches!(
            StartError::from_bind(8060, io_err(io::ErrorKind::InvalidInput)),
            StartError::Unknown { .. }
        );
    }

    #[test]
    fn start_error_reports_port() {
        let err = StartError::from_bind(8061, io_err(io::ErrorKind::AddrInUse));
        assert_eq!(err.port(), 8061);
        assert_eq!(err.to_string(), "port 8061 is already in use");
    }

    #[test]
    fn fault_kind_io_matrix() {
        assert_eq!(
            FaultKind::classify_io(&io_err(io::ErrorKind::AddrInUse)),
            FaultKind::AddressInUse
        );
        assert_eq!(
            FaultKind::classify_io(&io_err(io::ErrorKind::ConnectionReset)),
            FaultKind::NetworkError
        );
        assert_eq!(
            FaultKind::classify_io(&io_err(io::ErrorKind::BrokenPipe)),
            FaultKind::NetworkError
        );
        assert_eq!(
            FaultKind::classify_io(&io_err(io::ErrorKind::PermissionDenied)),
            FaultKind::PermissionDenied
        );
        assert_eq!(
            FaultKind::classify_io(&io_err(io::ErrorKind::AlreadyExists)),
            FaultKind::Unknown
        );
    }

    #[test]
    fn classify_walks_source_chain() {
        #[derive(Debug, Error)]
        #[error("wrapper")]
        struct Wrapper(#[source] io::Error);

        let wrapped = Wrapper(io_err(io::ErrorKind::ConnectionReset));
        assert_eq!(FaultKind::classify(&wrapped), FaultKind::NetworkError);
    }

    #[test]
    fn classify_without_io_cause_is_unknown() {
        #[derive(Debug, Error)]
        #[error("opaque")]
        struct Opaque;

        assert_eq!(FaultKind::classify(&Opaque), FaultKind::Unknown);
    }

    #[test]
    fn connection_error_wraps_decode_failures() {
        let decode_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = ConnectionError::from(decode_err);
        assert_matches!(err, ConnectionError::ProtocolDecode(_));
        assert_eq!(err.to_string(), "malformed payload");
    }

    #[test]
    fn connection_error_wraps_io_failures() {
        let err = ConnectionError::from(io_err(io::ErrorKind::ConnectionReset));
        assert_matches!(err, ConnectionError::TransientIo(_));
        assert_eq!(err.to_string(), "transient i/o failure");
    }

    #[test]
    fn fault_labels_are_stable() {
        assert_eq!(FaultKind::AddressInUse.as_str(), "address_in_use");
        assert_eq!(FaultKind::NetworkError.as_str(), "network_error");
        assert_eq!(FaultKind::PermissionDenied.as_str(), "permission_denied");
        assert_eq!(FaultKind::Unknown.as_str(), "unknown");
    }
}
