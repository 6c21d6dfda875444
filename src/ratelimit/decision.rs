//! Rate limit outcomes and the response metadata derived from them.

use serde::Serialize;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// HTTP status used for rejected requests.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Result of taking tokens from a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    /// Whole tokens left after this request
    pub remaining: u32,
    /// Seconds until the bucket is full again
    pub reset_seconds: u64,
    /// Bucket capacity
    pub limit: u32,
}

impl Decision {
    /// Response headers for this decision. `Retry-After` is only present on reject.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_seconds.to_string()),
        ];
        if !self.allowed {
            headers.push((HEADER_RETRY_AFTER, self.reset_seconds.to_string()));
        }
        headers
    }

    /// The error body to send with a 429, or `None` if the request was allowed.
    pub fn rejection(&self) -> Option<RejectionBody> {
        if self.allowed {
            return None;
        }
        Some(RejectionBody {
            status_code: TOO_MANY_REQUESTS,
            error: "Too Many Requests".to_string(),
            message: format!(
                "Rate limit exceeded, retry in {} seconds",
                self.reset_seconds
            ),
        })
    }
}

/// Structured error payload for a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub status_code: u16,
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_headers_have_no_retry_after() {
        let decision = Decision {
            allowed: true,
            remaining: 4,
            reset_seconds: 1,
            limit: 5,
        };
        let headers = decision.headers();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0], (HEADER_LIMIT, "5".to_string()));
        assert_eq!(headers[1], (HEADER_REMAINING, "4".to_string()));
        assert_eq!(headers[2], (HEADER_RESET, "1".to_string()));
        assert!(decision.rejection().is_none());
    }

    #[test]
    fn test_rejected_headers_and_body() {
        let decision = Decision {
            allowed: false,
            remaining: 0,
            reset_seconds: 7,
            limit: 5,
        };
        let headers = decision.headers();
        assert!(headers.contains(&(HEADER_RETRY_AFTER, "7".to_string())));

        let body = decision.rejection().unwrap();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["statusCode"], 429);
        assert_eq!(json["error"], "Too Many Requests");
        assert!(json["message"].as_str().unwrap().contains('7'));
    }
}
