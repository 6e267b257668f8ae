//! Error codes surfaced on the wire and the kinds behind them.

use std::fmt;

/// Stable `code` discriminator carried by every error response and by Task
/// records that end in `error`. Wire form is `as_str()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MissingUserId,
    InvalidQuery,
    QueryTooLong,
    TaskNotFound,
    AgentNotFound,
    Forbidden,
    DaemonUnavailable,
    QuotaExceeded,
    Timeout,
    Cancelled,
    ServiceUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MissingUserId => "MISSING_USER_ID",
            ErrorCode::InvalidQuery => "INVALID_QUERY",
            ErrorCode::QueryTooLong => "QUERY_TOO_LONG",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::AgentNotFound => "AGENT_NOT_FOUND",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::DaemonUnavailable => "DAEMON_UNAVAILABLE",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }

    /// Classification used when deciding how a failure surfaces to the user.
    pub fn kind(self) -> ErrorClass {
        match self {
            ErrorCode::MissingUserId | ErrorCode::InvalidQuery | ErrorCode::QueryTooLong => {
                ErrorClass::Validation
            }
            ErrorCode::Forbidden => ErrorClass::Auth,
            ErrorCode::DaemonUnavailable | ErrorCode::QuotaExceeded => ErrorClass::Capacity,
            ErrorCode::Timeout | ErrorCode::Cancelled => ErrorClass::Timeout,
            ErrorCode::ServiceUnavailable => ErrorClass::Upstream,
            ErrorCode::TaskNotFound
            | ErrorCode::AgentNotFound
            | ErrorCode::Internal => ErrorClass::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "MISSING_USER_ID" => ErrorCode::MissingUserId,
            "INVALID_QUERY" => ErrorCode::InvalidQuery,
            "QUERY_TOO_LONG" => ErrorCode::QueryTooLong,
            "TASK_NOT_FOUND" => ErrorCode::TaskNotFound,
            "AGENT_NOT_FOUND" => ErrorCode::AgentNotFound,
            "FORBIDDEN" => ErrorCode::Forbidden,
            "DAEMON_UNAVAILABLE" => ErrorCode::DaemonUnavailable,
            "QUOTA_EXCEEDED" => ErrorCode::QuotaExceeded,
            "TIMEOUT" => ErrorCode::Timeout,
            "CANCELLED" => ErrorCode::Cancelled,
            "SERVICE_UNAVAILABLE" => ErrorCode::ServiceUnavailable,
            "INTERNAL_ERROR" => ErrorCode::Internal,
            _ => return Err(()),
        })
    }
}

/// Broad failure classes. Validation failures are synchronous HTTP 400s and
/// never produce Task records; everything else the MasterAgent converts into
/// a Task `error` with user-facing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Auth,
    Capacity,
    Timeout,
    Upstream,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_round_trip() {
        for code in [
            ErrorCode::MissingUserId,
            ErrorCode::QueryTooLong,
            ErrorCode::TaskNotFound,
            ErrorCode::Forbidden,
            ErrorCode::DaemonUnavailable,
            ErrorCode::QuotaExceeded,
            ErrorCode::Timeout,
            ErrorCode::Internal,
        ] {
            let parsed: ErrorCode = code.as_str().parse().unwrap();
            assert_eq!(parsed, code);
        }
    }

    #[test]
    fn test_validation_codes_classify_as_validation() {
        assert_eq!(ErrorCode::QueryTooLong.kind(), ErrorClass::Validation);
        assert_eq!(ErrorCode::DaemonUnavailable.kind(), ErrorClass::Capacity);
        assert_eq!(ErrorCode::Timeout.kind(), ErrorClass::Timeout);
    }
}
