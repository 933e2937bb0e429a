use std::io;

/// Errors produced by the reactor core.
///
/// Statuses are values as much as they are errors: connection shutdown and
/// task aborts hand them to callbacks, so the type is `Clone` and carries an
/// optional errno for the cases where callers dispatch on one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, errno: Option<i32> },
    #[error("aborted: {message}")]
    Aborted { message: String, errno: Option<i32> },
    #[error("network error: {message}")]
    Network { message: String },
    #[error("illegal state: {message}")]
    IllegalState { message: String },
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("timed out: {message}")]
    TimedOut { message: String },
    #[error("io error: {message}")]
    Io { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Error::ServiceUnavailable {
            message: message.into(),
            errno: None,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Error::Aborted {
            message: message.into(),
            errno: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Error::Network {
            message: message.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Error::TimedOut {
            message: message.into(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted { .. })
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Error::ServiceUnavailable { .. })
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Error::IllegalState { .. })
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut { .. })
    }

    /// The errno attached to shutdown statuses, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::ServiceUnavailable { errno, .. } | Error::Aborted { errno, .. } => *errno,
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::ServiceUnavailable { message, .. }
            | Error::Aborted { message, .. }
            | Error::Network { message }
            | Error::IllegalState { message }
            | Error::InvalidArgument { message }
            | Error::TimedOut { message }
            | Error::Io { message } => message,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io {
            message: e.to_string(),
        }
    }
}

/// Status handed to everything torn down by a closing reactor. Aborted for
/// work that was already accepted, ServiceUnavailable for work refused at the
/// door; both carry ESHUTDOWN.
pub fn shutdown_error(aborted: bool) -> Error {
    const MSG: &str = "reactor is shutting down";
    if aborted {
        Error::Aborted {
            message: MSG.to_string(),
            errno: Some(libc::ESHUTDOWN),
        }
    } else {
        Error::ServiceUnavailable {
            message: MSG.to_string(),
            errno: Some(libc::ESHUTDOWN),
        }
    }
}
