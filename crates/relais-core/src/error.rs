//! Error types.

use core::fmt;

use rmpv::Value;

/// An application-level error reported by the remote service for one
/// session. Not a transport failure: the session itself completed normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub code: i64,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build a service error from an `"error"` event payload.
    ///
    /// Accepts both the map form `{code, message}` and the positional pair
    /// `[code, message]`. Anything else is kept verbatim in the message with
    /// code -1 so the caller still sees what the peer sent.
    pub fn from_payload(payload: &Value) -> Self {
        match payload {
            Value::Map(entries) => {
                let mut code = None;
                let mut message = None;
                for (key, value) in entries {
                    match key.as_str() {
                        Some("code") => code = value.as_i64(),
                        Some("message") => message = value.as_str(),
                        _ => {}
                    }
                }
                if let (Some(code), Some(message)) = (code, message) {
                    return Self::new(code, message);
                }
            }
            Value::Array(items) => {
                if let [code, message] = items.as_slice() {
                    if let (Some(code), Some(message)) = (code.as_i64(), message.as_str()) {
                        return Self::new(code, message);
                    }
                }
            }
            _ => {}
        }
        Self::new(-1, payload.to_string())
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ServiceError {}

/// Faults raised by the incremental frame decoder.
///
/// Both variants leave the decoder resynced: `Malformed` has already skipped
/// one byte, `NotAFrame` has already consumed the offending value whole.
#[derive(Debug)]
pub enum FrameError {
    /// The bytes at the head of the buffer did not decode as a value.
    Malformed(String),
    /// A value decoded but is not a `[session, type, payload]` triple.
    NotAFrame(Value),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed frame: {msg}"),
            Self::NotAFrame(value) => write!(f, "not a frame: {value}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Client-facing errors.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// The connection closed while the session was still open.
    ConnectionClosed,
    /// `attach` was called on a connection that already has a live stream.
    AlreadyConnected,
    /// The connection has no endpoint yet; it must be resolved first.
    Unresolved { service: String },
    Encode(String),
    /// The method name is absent from the service's API description.
    UnknownMethod { method: String },
    /// The verb name is absent from the session's tx tree.
    UnknownVerb { verb: String },
    /// A frame arrived whose message type is not legal in the session's
    /// current transition subtree.
    InvalidMessageType { ty: u64 },
    /// The event name has no mapping in the protocol transform in use.
    UnexpectedEvent { event: String },
    /// The resolved service version does not satisfy the requested one.
    VersionMismatch {
        service: String,
        requested: u64,
        resolved: u64,
    },
    /// The remote service reported an application error.
    Service(ServiceError),
    /// A receive deadline expired before anything arrived.
    DeadlineExceeded,
    /// The session buffered more events than the configured backlog allows.
    BacklogExceeded { limit: usize },
    /// A resolution result, API description or transition tree did not have
    /// the expected wire shape.
    InvalidDescriptor(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::Unresolved { service } => {
                write!(f, "service '{service}' has not been resolved to an endpoint")
            }
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
            Self::UnknownMethod { method } => write!(f, "unknown method '{method}'"),
            Self::UnknownVerb { verb } => write!(f, "unknown verb '{verb}'"),
            Self::InvalidMessageType { ty } => {
                write!(f, "message type {ty} is not legal in the current protocol state")
            }
            Self::UnexpectedEvent { event } => write!(f, "unexpected event '{event}'"),
            Self::VersionMismatch {
                service,
                requested,
                resolved,
            } => {
                write!(
                    f,
                    "service '{service}' has version {resolved}, version {requested} required"
                )
            }
            Self::Service(e) => write!(f, "service error: {e}"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::BacklogExceeded { limit } => {
                write!(f, "session backlog exceeded ({limit} buffered events)")
            }
            Self::InvalidDescriptor(msg) => write!(f, "invalid descriptor: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Service(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ServiceError> for Error {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_from_map_payload() {
        let payload = Value::Map(vec![
            (Value::from("code"), Value::from(42)),
            (Value::from("message"), Value::from("not found")),
        ]);
        assert_eq!(
            ServiceError::from_payload(&payload),
            ServiceError::new(42, "not found")
        );
    }

    #[test]
    fn test_service_error_from_pair_payload() {
        let payload = Value::Array(vec![Value::from(-3), Value::from("bad request")]);
        assert_eq!(
            ServiceError::from_payload(&payload),
            ServiceError::new(-3, "bad request")
        );
    }

    #[test]
    fn test_service_error_from_unrecognized_payload() {
        let err = ServiceError::from_payload(&Value::from("boom"));
        assert_eq!(err.code, -1);
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn test_service_error_from_map_with_missing_fields() {
        let payload = Value::Map(vec![(Value::from("code"), Value::from(7))]);
        let err = ServiceError::from_payload(&payload);
        assert_eq!(err.code, -1);
    }
}
