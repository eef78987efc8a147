//! Error types for mpirt
//!
//! Every error carries an [`ErrorClass`], a stable integer code that
//! survives being handed across the "return mode" boundary and can be
//! turned back into a message with [`error_string`].

use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error classes with stable integer codes.
///
/// Code `0` is reserved for success and is never produced by [`Error::class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorClass {
    /// Successful completion
    Success = 0,
    /// Invalid or freed communicator
    Comm = 1,
    /// Invalid group
    Group = 2,
    /// Invalid count argument
    Count = 3,
    /// Invalid datatype or operator/type mismatch
    Type = 4,
    /// Invalid buffer
    Buffer = 5,
    /// Invalid root rank
    Root = 6,
    /// Invalid argument not covered by another class
    Arg = 7,
    /// Invalid info key or value
    Info = 8,
    /// Invalid topology
    Topology = 9,
    /// Spawn failure
    Spawn = 10,
    /// Service name not published
    Service = 11,
    /// Message truncated on receive
    Truncate = 12,
    /// Out of a runtime resource
    NoResources = 13,
    /// Invalid rank
    Rank = 14,
    /// Invalid tag
    Tag = 15,
    /// Invalid operator handle
    Op = 16,
    /// Invalid or closed port
    Port = 17,
    /// Invalid request handle
    Request = 18,
    /// The universe was aborted
    Aborted = 19,
    /// Operation not supported by this runtime
    Unsupported = 20,
    /// Internal runtime error
    Intern = 21,
}

impl ErrorClass {
    /// All error classes, in code order.
    pub const ALL: [ErrorClass; 22] = [
        ErrorClass::Success,
        ErrorClass::Comm,
        ErrorClass::Group,
        ErrorClass::Count,
        ErrorClass::Type,
        ErrorClass::Buffer,
        ErrorClass::Root,
        ErrorClass::Arg,
        ErrorClass::Info,
        ErrorClass::Topology,
        ErrorClass::Spawn,
        ErrorClass::Service,
        ErrorClass::Truncate,
        ErrorClass::NoResources,
        ErrorClass::Rank,
        ErrorClass::Tag,
        ErrorClass::Op,
        ErrorClass::Port,
        ErrorClass::Request,
        ErrorClass::Aborted,
        ErrorClass::Unsupported,
        ErrorClass::Intern,
    ];

    /// Look up the class for an integer code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| *c as i32 == code)
    }

    /// Short human-readable description of the class.
    pub fn description(self) -> &'static str {
        match self {
            ErrorClass::Success => "No error",
            ErrorClass::Comm => "Invalid communicator",
            ErrorClass::Group => "Invalid group",
            ErrorClass::Count => "Invalid count argument",
            ErrorClass::Type => "Invalid datatype",
            ErrorClass::Buffer => "Invalid buffer pointer",
            ErrorClass::Root => "Invalid root",
            ErrorClass::Arg => "Invalid argument",
            ErrorClass::Info => "Invalid info object",
            ErrorClass::Topology => "Invalid topology",
            ErrorClass::Spawn => "Error spawning processes",
            ErrorClass::Service => "Invalid service name",
            ErrorClass::Truncate => "Message truncated",
            ErrorClass::NoResources => "Out of resources",
            ErrorClass::Rank => "Invalid rank",
            ErrorClass::Tag => "Invalid tag",
            ErrorClass::Op => "Invalid reduce operation",
            ErrorClass::Port => "Invalid port",
            ErrorClass::Request => "Invalid request",
            ErrorClass::Aborted => "Job aborted",
            ErrorClass::Unsupported => "Operation not supported",
            ErrorClass::Intern => "Internal error",
        }
    }
}

/// Return the message associated with an error code.
///
/// Unknown codes produce a generic message rather than an error.
pub fn error_string(code: i32) -> String {
    match ErrorClass::from_code(code) {
        Some(class) => class.description().to_string(),
        None => format!("Unknown error code {code}"),
    }
}

/// Error types for runtime operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Null, freed or otherwise unusable communicator
    #[error("Invalid communicator: {0}")]
    InvalidCommunicator(String),

    /// Invalid group argument
    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    /// Negative or inconsistent count
    #[error("Invalid count: {0}")]
    InvalidCount(i64),

    /// Datatype does not match the operator or message
    #[error("Invalid datatype: {0}")]
    InvalidType(String),

    /// Invalid buffer provided
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    /// Root outside of the communicator
    #[error("Invalid root: {0}")]
    InvalidRoot(i32),

    /// Invalid rank specified
    #[error("Invalid rank: {0}")]
    InvalidRank(i32),

    /// Invalid message tag
    #[error("Invalid tag: {0}")]
    InvalidTag(i32),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// Malformed info key or value
    #[error("Invalid info: {0}")]
    InvalidInfo(String),

    /// Invalid Cartesian topology request
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Invalid or freed operator handle
    #[error("Invalid operator: {0}")]
    InvalidOp(String),

    /// Port is unknown or closed
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Invalid request handle
    #[error("Invalid request handle")]
    InvalidRequest,

    /// Spawn could not start the requested processes
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    /// Service name is not published
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Receive buffer smaller than the incoming message
    #[error("Message truncated: received {received} of {expected} elements")]
    Truncated {
        /// Elements delivered into the buffer
        received: i64,
        /// Elements in the incoming message
        expected: i64,
    },

    /// A runtime resource ran out
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The universe was aborted by a fatal error
    #[error("Universe aborted with code {0}")]
    Aborted(i32),

    /// Operation not supported by this runtime
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidCommunicator(_) => ErrorClass::Comm,
            Error::InvalidGroup(_) => ErrorClass::Group,
            Error::InvalidCount(_) => ErrorClass::Count,
            Error::InvalidType(_) => ErrorClass::Type,
            Error::InvalidBuffer(_) => ErrorClass::Buffer,
            Error::InvalidRoot(_) => ErrorClass::Root,
            Error::InvalidRank(_) => ErrorClass::Rank,
            Error::InvalidTag(_) => ErrorClass::Tag,
            Error::InvalidArg(_) => ErrorClass::Arg,
            Error::InvalidInfo(_) => ErrorClass::Info,
            Error::InvalidTopology(_) => ErrorClass::Topology,
            Error::InvalidOp(_) => ErrorClass::Op,
            Error::InvalidPort(_) => ErrorClass::Port,
            Error::InvalidRequest => ErrorClass::Request,
            Error::SpawnFailed(_) => ErrorClass::Spawn,
            Error::ServiceNotFound(_) => ErrorClass::Service,
            Error::Truncated { .. } => ErrorClass::Truncate,
            Error::ResourceExhausted(_) => ErrorClass::NoResources,
            Error::Aborted(_) => ErrorClass::Aborted,
            Error::NotSupported(_) => ErrorClass::Unsupported,
            Error::Internal(_) => ErrorClass::Intern,
        }
    }

    /// The integer code of this error's class.
    pub fn code(&self) -> i32 {
        self.class() as i32
    }

    /// Rebuild an error from a code received from another process.
    ///
    /// Returns `Ok(())` for the success code.
    pub fn check(code: i32, context: &str) -> Result<()> {
        let Some(class) = ErrorClass::from_code(code) else {
            return Err(Error::Internal(format!("unknown error code {code}")));
        };
        let msg = context.to_string();
        Err(match class {
            ErrorClass::Success => return Ok(()),
            ErrorClass::Comm => Error::InvalidCommunicator(msg),
            ErrorClass::Group => Error::InvalidGroup(msg),
            ErrorClass::Count => Error::InvalidCount(-1),
            ErrorClass::Type => Error::InvalidType(msg),
            ErrorClass::Buffer => Error::InvalidBuffer(msg),
            ErrorClass::Root => Error::InvalidRoot(-1),
            ErrorClass::Arg => Error::InvalidArg(msg),
            ErrorClass::Info => Error::InvalidInfo(msg),
            ErrorClass::Topology => Error::InvalidTopology(msg),
            ErrorClass::Spawn => Error::SpawnFailed(msg),
            ErrorClass::Service => Error::ServiceNotFound(msg),
            ErrorClass::Truncate => Error::Truncated {
                received: -1,
                expected: -1,
            },
            ErrorClass::NoResources => Error::ResourceExhausted(msg),
            ErrorClass::Rank => Error::InvalidRank(-1),
            ErrorClass::Tag => Error::InvalidTag(-1),
            ErrorClass::Op => Error::InvalidOp(msg),
            ErrorClass::Port => Error::InvalidPort(msg),
            ErrorClass::Request => Error::InvalidRequest,
            ErrorClass::Aborted => Error::Aborted(-1),
            ErrorClass::Unsupported => Error::NotSupported(msg),
            ErrorClass::Intern => Error::Internal(msg),
        })
    }

    /// Whether this error leaves the runtime usable regardless of error mode.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Truncated { .. })
    }
}

/// How errors raised on a communicator are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Abort every process in the universe (the default).
    #[default]
    Fatal,
    /// Return the error to the caller.
    Return,
}

impl std::str::FromStr for ErrorMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" | "abort" | "errors_are_fatal" => Ok(ErrorMode::Fatal),
            "return" | "errors_return" => Ok(ErrorMode::Return),
            other => Err(Error::InvalidArg(format!("unknown error mode '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_codes_are_sequential() {
        for (i, class) in ErrorClass::ALL.iter().enumerate() {
            assert_eq!(*class as i32, i as i32, "class {class:?} out of order");
        }
    }

    #[test]
    fn check_success_is_ok() {
        assert!(Error::check(0, "ignored").is_ok());
    }

    #[test]
    fn check_rebuilds_class() {
        let err = Error::ServiceNotFound("svc".into());
        let rebuilt = Error::check(err.code(), "svc").unwrap_err();
        assert_eq!(rebuilt.class(), ErrorClass::Service);
        assert_eq!(rebuilt, err);
    }

    #[test]
    fn check_unknown_code_is_internal() {
        let err = Error::check(9999, "x").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Intern);
    }

    #[test]
    fn error_string_known_and_unknown() {
        assert_eq!(error_string(ErrorClass::Service as i32), "Invalid service name");
        assert_eq!(error_string(0), "No error");
        assert!(error_string(-7).contains("-7"));
    }

    #[test]
    fn only_truncation_is_recoverable() {
        let trunc = Error::Truncated {
            received: 2,
            expected: 4,
        };
        assert!(trunc.is_recoverable());
        assert!(!Error::InvalidRoot(3).is_recoverable());
        assert_eq!(
            format!("{trunc}"),
            "Message truncated: received 2 of 4 elements"
        );
    }

    #[test]
    fn error_mode_parse() {
        assert_eq!("fatal".parse::<ErrorMode>().unwrap(), ErrorMode::Fatal);
        assert_eq!("RETURN".parse::<ErrorMode>().unwrap(), ErrorMode::Return);
        assert!("sometimes".parse::<ErrorMode>().is_err());
        assert_eq!(ErrorMode::default(), ErrorMode::Fatal);
    }
}
