//! The framework error taxonomy.
//!
//! Every error that can cross the wire is reducible to a
//! category/code/message trio, and every trio received from a peer is
//! reconstructed into the matching local kind.

/// Category used by all framework-defined error kinds. Handler-defined
/// faults carry their own category.
pub const BUILTIN_CATEGORY: &str = "tether";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The call terminated before a response arrived.
    #[error("closed: {0}")]
    Closed(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Non-domain failure in the transport layer.
    #[error("transport: {0}")]
    Transport(String),

    /// A typed error returned by a remote handler, or raised by a local
    /// one.
    #[error("{category}/{code}: {message}")]
    Fault {
        category: String,
        code: String,
        message: String,
    },

    /// The remote handler panicked. Never retried.
    #[error("remote panic: {0}")]
    RemotePanic(String),
}

impl Error {
    pub fn fault(category: &str, code: &str, message: &str) -> Self {
        Self::Fault {
            category: category.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    pub fn category(&self) -> &str {
        match self {
            Error::Fault { category, .. } => category,
            _ => BUILTIN_CATEGORY,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Error::NotFound(_) => "not-found",
            Error::InvalidArgument(_) => "invalid-argument",
            Error::Closed(_) => "closed",
            Error::Timeout => "timeout",
            Error::Unauthorized(_) => "unauthorized",
            Error::Transport(_) => "transport",
            Error::Fault { code, .. } => code,
            Error::RemotePanic(_) => "panic",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Error::NotFound(m)
            | Error::InvalidArgument(m)
            | Error::Closed(m)
            | Error::Unauthorized(m)
            | Error::Transport(m)
            | Error::RemotePanic(m) => m.clone(),
            Error::Timeout => "deadline exceeded".to_string(),
            Error::Fault { message, .. } => message.clone(),
        }
    }

    /// Reconstruct an error from a trio received over the wire, mapping
    /// framework codes back onto their local kinds.
    pub fn from_trio(category: &str, code: &str, message: &str) -> Self {
        if category != BUILTIN_CATEGORY {
            return Self::fault(category, code, message);
        }

        match code {
            "not-found" => Error::NotFound(message.to_string()),
            "invalid-argument" => Error::InvalidArgument(message.to_string()),
            "closed" => Error::Closed(message.to_string()),
            "timeout" => Error::Timeout,
            "unauthorized" => Error::Unauthorized(message.to_string()),
            "transport" => Error::Transport(message.to_string()),
            "panic" => Error::RemotePanic(message.to_string()),
            _ => Self::fault(category, code, message),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        match value {
            codec::Error::StaleTimestamp | codec::Error::InvalidSignature => {
                Error::Unauthorized(value.to_string())
            }
            codec::Error::InvalidIdentity(m) => Error::Unauthorized(m),
            other => Error::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_trio_roundtrip() {
        let errors = [
            Error::NotFound("meter".to_string()),
            Error::InvalidArgument("slot 0".to_string()),
            Error::Closed("mid-call".to_string()),
            Error::Timeout,
            Error::Unauthorized("skew".to_string()),
            Error::Transport("reset".to_string()),
        ];

        for error in errors {
            let back = Error::from_trio(error.category(), error.code(), &error.message());
            assert_eq!(back, error);
        }
    }

    #[test]
    fn handler_faults_keep_their_trio() {
        let fault = Error::fault("billing", "quota", "quota exhausted");
        let back = Error::from_trio(fault.category(), fault.code(), &fault.message());

        assert_eq!(back, fault);
    }
}
