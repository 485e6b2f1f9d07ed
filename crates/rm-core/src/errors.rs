//! Unified error system for the resource manager
//!
//! A single error type covers local policy failures, protocol violations,
//! remote and network failures and owner shutdown. Every variant maps to an
//! errno-class status code, which is what callers observe on a terminal
//! incoming request and what travels back in a failed reply.

use serde::{Deserialize, Serialize};

/// Errno-class status codes carried by terminal requests.
pub mod errno {
    /// No such right: not representable by the resource type.
    pub const ESRCH: i32 = 3;
    /// Out of memory or per-owner limit reached.
    pub const ENOMEM: i32 = 12;
    /// Conflicting right is in use and waiting was not permitted.
    pub const EBUSY: i32 = 16;
    /// Invalid argument or call in the wrong state.
    pub const EINVAL: i32 = 22;
    /// Too many rechecks of one request.
    pub const ELOOP: i32 = 40;
    /// Right lives in another owner and borrowing was not permitted.
    pub const EREMOTE: i32 = 66;
    /// Protocol error: unknown cookie or malformed message.
    pub const EPROTO: i32 = 71;
    /// Transport endpoint is not connected.
    pub const ENOTCONN: i32 = 107;
    /// Owner is shutting down.
    pub const ESHUTDOWN: i32 = 108;
    /// Outgoing request timed out.
    pub const ETIMEDOUT: i32 = 110;
}

/// Unified error type for all resource manager operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RmError {
    /// Wanted right cannot be represented by the resource type
    #[error("Not representable: {message}")]
    NotRepresentable {
        /// What could not be represented
        message: String,
    },

    /// Malformed remote request or unknown cookie
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation
        message: String,
    },

    /// The right is held elsewhere and may not be fetched
    #[error("Remote: {message}")]
    Remote {
        /// Description of where the right is stuck
        message: String,
    },

    /// A conflicting right is in use
    #[error("Busy: {message}")]
    Busy {
        /// Description of the conflict
        message: String,
    },

    /// Outgoing request did not complete in time
    #[error("Timeout: {message}")]
    Timeout {
        /// Description of the timed out operation
        message: String,
    },

    /// Network or transport error
    #[error("Network error: {message}")]
    Network {
        /// Description of the network issue
        message: String,
    },

    /// Resource exhaustion, books are left unchanged
    #[error("Exhausted: {message}")]
    Exhausted {
        /// Which limit was reached
        message: String,
    },

    /// Request rechecked too many times
    #[error("Live-lock: {message}")]
    LiveLock {
        /// Description of the looping request
        message: String,
    },

    /// Owner no longer accepts the request
    #[error("Shutdown: {message}")]
    Shutdown {
        /// Description of the refused operation
        message: String,
    },

    /// Invalid input, configuration or call sequence
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Encoding or decoding of a message failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },
}

impl RmError {
    /// Create a not-representable error
    pub fn not_representable(message: impl Into<String>) -> Self {
        Self::NotRepresentable {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a remote error
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Create a busy error
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an exhaustion error
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::Exhausted {
            message: message.into(),
        }
    }

    /// Create a live-lock error
    pub fn live_lock(message: impl Into<String>) -> Self {
        Self::LiveLock {
            message: message.into(),
        }
    }

    /// Create a shutdown error
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Positive errno code of this error class
    pub fn code(&self) -> i32 {
        match self {
            Self::NotRepresentable { .. } => errno::ESRCH,
            Self::Protocol { .. } | Self::Serialization { .. } => errno::EPROTO,
            Self::Remote { .. } => errno::EREMOTE,
            Self::Busy { .. } => errno::EBUSY,
            Self::Timeout { .. } => errno::ETIMEDOUT,
            Self::Network { .. } => errno::ENOTCONN,
            Self::Exhausted { .. } => errno::ENOMEM,
            Self::LiveLock { .. } => errno::ELOOP,
            Self::Shutdown { .. } => errno::ESHUTDOWN,
            Self::Invalid { .. } => errno::EINVAL,
        }
    }

    /// Negative status delivered to callers, success being zero
    pub fn errno(&self) -> i32 {
        -self.code()
    }
}

/// Standard Result type for resource manager operations
pub type RmResult<T> = std::result::Result<T, RmError>;

/// Status code of a result: zero on success, negative errno otherwise
pub fn status_of<T>(result: &RmResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.errno(),
    }
}

impl From<bincode::Error> for RmError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<std::io::Error> for RmError {
    fn from(err: std::io::Error) -> Self {
        Self::invalid(err.to_string())
    }
}

impl From<toml::de::Error> for RmError {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid(format!("config: {err}"))
    }
}
