use crate::engine::status;
use hickory_proto::op::ResponseCode;
use std::{fmt, io};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create resolution engine context: {0}")]
    EngineInit(#[source] io::Error),

    #[error("engine rejected option {name} {value}: {}", describe_status(*.code))]
    EngineOption {
        name: String,
        value: String,
        code: i32,
    },

    #[error("resolver is already monitoring its readiness handle")]
    AlreadyStarted,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The error half of a resolution result.
///
/// Every variant but `Response` carries a code in the generic category:
/// negative values are engine status codes, positive values are errno values.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The engine refused the query before scheduling it.
    #[error("query rejected: {}", describe_status(*.0))]
    Rejected(i32),

    /// The engine finished the query with a nonzero status.
    #[error("resolution failed: {}", describe_status(*.0))]
    Failed(i32),

    /// The engine got an answer carrying a nonzero response code.
    #[error("server responded with {}", <ResponseCode as From<u16>>::from(*.0))]
    Response(u16),

    /// The answer had neither data nor an error response code.
    #[error("operation canceled")]
    Canceled,

    /// The answer claimed data but none of it was a usable address.
    #[error("malformed answer data")]
    Malformed,

    /// A deadline set above the resolver expired first.
    #[error("lookup timed out")]
    TimedOut,
}

impl ResolveError {
    /// The numeric code in the category given by [`ResolveError::is_response_code`].
    pub fn code(&self) -> i32 {
        match self {
            ResolveError::Rejected(code) | ResolveError::Failed(code) => *code,
            ResolveError::Response(rcode) => i32::from(*rcode),
            ResolveError::Canceled => libc::ECANCELED,
            ResolveError::Malformed => libc::EBADMSG,
            ResolveError::TimedOut => libc::ETIMEDOUT,
        }
    }

    pub fn is_response_code(&self) -> bool {
        matches!(self, ResolveError::Response(_))
    }
}

pub(crate) fn describe_status(code: i32) -> StatusDisplay {
    StatusDisplay(code)
}

pub(crate) struct StatusDisplay(i32);

impl fmt::Display for StatusDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match status::name(self.0) {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "{}", io::Error::from_raw_os_error(self.0)),
        }
    }
}
