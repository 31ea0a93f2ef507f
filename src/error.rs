//! Turn-level error taxonomy.

use thiserror::Error;

/// Why a proactive turn ended before delivery.
///
/// The variant decides what happens next: `Reschedule` ends the turn but
/// books a retry through the interval scheduler, `Silent` ends it with no
/// retry, and `Fatal` routes through the top-level recovery handler (which
/// refuses to retry authentication-class failures).
#[derive(Debug, Error)]
pub enum TurnAbort {
    #[error("{0}")]
    Reschedule(String),
    #[error("{0}")]
    Silent(String),
    #[error("{0}")]
    Fatal(String),
}

/// Error keywords that mark a failure as authentication-class.
/// Retrying those would loop forever against a broken credential.
const AUTH_ERROR_KEYWORDS: [&str; 4] = ["authentication", "auth", "unauthorized", "forbidden"];

pub(crate) fn is_auth_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    AUTH_ERROR_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_keywords_match_case_insensitively() {
        assert!(is_auth_error("401 Unauthorized"));
        assert!(is_auth_error("AuthenticationError: invalid api key"));
        assert!(is_auth_error("403 FORBIDDEN"));
        assert!(!is_auth_error("connection reset by peer"));
    }
}
