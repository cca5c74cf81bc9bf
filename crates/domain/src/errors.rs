use thiserror::Error;

/// Everything that can end a query or tear down a connection.
///
/// A successful resolution is represented by `Ok(_)` at the call sites;
/// these variants cover the failure half of the protocol state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No upstream servers configured")]
    NoServers,

    #[error("Connection refused by server")]
    ConnRefused,

    #[error("Address family not supported for server")]
    BadFamily,

    #[error("Malformed DNS response")]
    BadResponse,

    #[error("Server returned SERVFAIL")]
    ServFail,

    #[error("Server returned NOTIMP")]
    NotImplemented,

    #[error("Server returned REFUSED")]
    Refused,

    #[error("Server returned FORMERR")]
    FormErr,

    #[error("Query timed out")]
    TimedOut,

    #[error("Query cancelled")]
    Cancelled,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Failed to encode DNS message: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ResolveError {
    /// True for failures tied to one particular server rather than the
    /// query itself. These are worth retrying against a different server.
    pub fn is_server_specific(&self) -> bool {
        matches!(self, Self::ConnRefused | Self::BadFamily)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_specific_classification() {
        assert!(ResolveError::ConnRefused.is_server_specific());
        assert!(ResolveError::BadFamily.is_server_specific());
        assert!(!ResolveError::TimedOut.is_server_specific());
        assert!(!ResolveError::OutOfMemory.is_server_specific());
    }

    #[test]
    fn display_names_the_rcode() {
        assert_eq!(
            ResolveError::ServFail.to_string(),
            "Server returned SERVFAIL"
        );
        assert_eq!(ResolveError::Refused.to_string(), "Server returned REFUSED");
    }
}
