use serde::{Deserialize, Serialize};

/// Classification of a provider call result. Rate limits are a category,
/// never a success flag, so callers can fall back instead of failing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    Ok,
    RateLimit,
    CredentialsExpired,
    NotFound,
    Transient,
    Validation,
    Checkpoint,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Ok => "ok",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::CredentialsExpired => "credentials_expired",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Checkpoint => "checkpoint",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Uniform result of every provider call.
#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub category: ErrorCategory,
    pub status_code: Option<u16>,
}

impl ProviderOutcome {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            category: ErrorCategory::Ok,
            status_code: None,
        }
    }

    pub fn failure(category: ErrorCategory, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            category,
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

/// Map a LinkedIn provider response to an outcome. 409 and the 422
/// "already invited" subclass count as success: the intent (a standing
/// invitation) already holds. 422 resend-throttle subclasses are rate
/// limits, not successes.
pub fn classify_linkedin_response(status: u16, body: &str) -> (bool, ErrorCategory) {
    match status {
        200..=299 => (true, ErrorCategory::Ok),
        401 => (false, ErrorCategory::CredentialsExpired),
        404 => (false, ErrorCategory::NotFound),
        409 => (true, ErrorCategory::Ok),
        422 => {
            let lower = body.to_lowercase();
            if lower.contains("already_invited") || lower.contains("already invited") {
                (true, ErrorCategory::Ok)
            } else if lower.contains("cannot_resend_yet")
                || lower.contains("cannot resend")
                || lower.contains("temporary")
                || lower.contains("limit")
            {
                (false, ErrorCategory::RateLimit)
            } else {
                (false, ErrorCategory::Validation)
            }
        }
        429 => (false, ErrorCategory::RateLimit),
        400 => (false, ErrorCategory::Validation),
        403 => {
            if body.to_lowercase().contains("checkpoint") {
                (false, ErrorCategory::Checkpoint)
            } else {
                (false, ErrorCategory::CredentialsExpired)
            }
        }
        500..=599 => (false, ErrorCategory::Transient),
        _ => (false, ErrorCategory::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_success() {
        assert_eq!(classify_linkedin_response(409, ""), (true, ErrorCategory::Ok));
    }

    #[test]
    fn test_already_invited_is_success() {
        let (ok, cat) = classify_linkedin_response(422, r#"{"type":"already_invited"}"#);
        assert!(ok);
        assert_eq!(cat, ErrorCategory::Ok);
    }

    #[test]
    fn test_resend_throttle_is_rate_limit_not_success() {
        let (ok, cat) = classify_linkedin_response(422, r#"{"type":"cannot_resend_yet"}"#);
        assert!(!ok);
        assert_eq!(cat, ErrorCategory::RateLimit);

        let (ok, cat) = classify_linkedin_response(422, "temporary provider limit reached");
        assert!(!ok);
        assert_eq!(cat, ErrorCategory::RateLimit);
    }

    #[test]
    fn test_status_families() {
        assert_eq!(classify_linkedin_response(401, "").1, ErrorCategory::CredentialsExpired);
        assert_eq!(classify_linkedin_response(404, "").1, ErrorCategory::NotFound);
        assert_eq!(classify_linkedin_response(429, "").1, ErrorCategory::RateLimit);
        assert_eq!(classify_linkedin_response(503, "").1, ErrorCategory::Transient);
        assert_eq!(classify_linkedin_response(403, "checkpoint required").1, ErrorCategory::Checkpoint);
    }
}
