use hyper::StatusCode;
use thiserror::Error;

/// Main error type for the vgate proxy engine
#[derive(Error, Debug)]
pub enum VgateError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A handler name references itself, directly or indirectly
    #[error("Handler cycle detected for {name}: {path}")]
    HandlerCycle { name: String, path: String },

    /// Handler type has no registered constructor
    #[error("No such handler type: {name}")]
    UnknownHandlerType { name: String },

    /// A vt:// URI names an upstream that was never configured
    #[error("No such upstream: {name}")]
    UnknownUpstream { name: String },

    /// Every slot of the upstream is quarantined or dead
    #[error("No live backend in upstream {upstream}")]
    NoLiveBackend { upstream: String },

    /// The retry budget ran out; carries the last network error
    #[error("Retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// Certificate validation failed during the backend roundtrip
    #[error("Certificate error: {message}")]
    CertInvalid { message: String },

    /// The inbound client went away mid-roundtrip
    #[error("Client cancelled request")]
    ClientCancelled,

    /// A pipeline module returned an error
    #[error("Module {module} failed: {message}")]
    Module { module: String, message: String },

    /// Underlying cache failure (treated as a miss by callers)
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Network related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Internal server errors
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl VgateError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a module error
    pub fn module<M: Into<String>, S: Into<String>>(module: M, message: S) -> Self {
        Self::Module {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Create a cache error
    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The HTTP status delivered to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            VgateError::NoLiveBackend { .. }
            | VgateError::RetriesExhausted { .. }
            | VgateError::CertInvalid { .. } => StatusCode::BAD_GATEWAY,
            // 499: nginx-compliant client cancellation code, not in the IANA registry
            VgateError::ClientCancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is fatal at configuration/startup time
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            VgateError::Config { .. }
                | VgateError::HandlerCycle { .. }
                | VgateError::UnknownHandlerType { .. }
                | VgateError::UnknownUpstream { .. }
        )
    }
}

/// Result type alias for vgate operations
pub type VgateResult<T> = Result<T, VgateError>;

/// Convert from std::io::Error to VgateError
impl From<std::io::Error> for VgateError {
    fn from(err: std::io::Error) -> Self {
        VgateError::network(format!("IO error: {}", err))
    }
}

/// Convert from hyper::Error to VgateError
impl From<hyper::Error> for VgateError {
    fn from(err: hyper::Error) -> Self {
        if err.is_canceled() {
            VgateError::ClientCancelled
        } else {
            VgateError::network(format!("HTTP error: {}", err))
        }
    }
}

/// Convert from serde_json::Error to VgateError
impl From<serde_json::Error> for VgateError {
    fn from(err: serde_json::Error) -> Self {
        VgateError::config(format!("JSON parsing error: {}", err))
    }
}

/// Convert from hyper::http::uri::InvalidUri to VgateError
impl From<hyper::http::uri::InvalidUri> for VgateError {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        VgateError::config(format!("Invalid URI: {}", err))
    }
}

/// Convert from hyper::http::Error to VgateError
impl From<hyper::http::Error> for VgateError {
    fn from(err: hyper::http::Error) -> Self {
        VgateError::internal(format!("HTTP message error: {}", err))
    }
}
