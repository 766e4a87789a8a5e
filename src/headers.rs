//! Rendering rate limit results as HTTP headers and 429 responses.
//!
//! Two header families are supported: the de facto `X-RateLimit-*` set and
//! the IETF `draft-ietf-httpapi-ratelimit-headers` set. Legacy reset values
//! are absolute Unix timestamps; the IETF `RateLimit-Reset` is seconds from
//! now, as the draft requires.

use serde::Serialize;

use crate::config::HeaderConfig;
use crate::error::Result;
use crate::ratelimit::RateLimitResult;

pub const X_RATELIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub const X_RATELIMIT_REMAINING: &str = "X-RateLimit-Remaining";
pub const X_RATELIMIT_RESET: &str = "X-RateLimit-Reset";
pub const RATELIMIT_LIMIT: &str = "RateLimit-Limit";
pub const RATELIMIT_REMAINING: &str = "RateLimit-Remaining";
pub const RATELIMIT_RESET: &str = "RateLimit-Reset";
pub const RATELIMIT_POLICY: &str = "RateLimit-Policy";
pub const RETRY_AFTER: &str = "Retry-After";

/// HTTP status of an exceeded response.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// One `limit;w=window` entry of a policy header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyComponent {
    pub limit: u64,
    pub window_secs: u64,
    pub comment: Option<String>,
}

impl PolicyComponent {
    pub fn new(limit: u64, window_secs: u64) -> Self {
        Self {
            limit,
            window_secs,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Format a single policy: `100;w=60` or `100;w=60;comment="..."`.
pub fn format_policy(limit: u64, window_secs: u64, comment: Option<&str>) -> String {
    match comment {
        Some(comment) => format!(
            "{};w={};comment=\"{}\"",
            limit,
            window_secs,
            comment.replace('\\', "\\\\").replace('"', "\\\"")
        ),
        None => format!("{};w={}", limit, window_secs),
    }
}

/// Join several policies for a multi-window declaration.
pub fn format_combined_policy(policies: &[PolicyComponent]) -> String {
    policies
        .iter()
        .map(|p| format_policy(p.limit, p.window_secs, p.comment.as_deref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Headers describing `result`, legacy family first.
///
/// Unlimited results produce no headers at all.
pub fn generate_headers(
    result: &RateLimitResult,
    config: &HeaderConfig,
    now: i64,
) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    if result.is_unlimited() {
        return headers;
    }

    let limit = result.limit().to_string();
    let remaining = result.remaining().to_string();

    if config.include_legacy {
        headers.push((X_RATELIMIT_LIMIT.to_string(), limit.clone()));
        headers.push((X_RATELIMIT_REMAINING.to_string(), remaining.clone()));
        headers.push((X_RATELIMIT_RESET.to_string(), result.reset_at().to_string()));
    }

    if config.include_ietf {
        let reset_in = result.reset_at().saturating_sub(now).max(0);
        headers.push((RATELIMIT_LIMIT.to_string(), limit));
        headers.push((RATELIMIT_REMAINING.to_string(), remaining));
        headers.push((RATELIMIT_RESET.to_string(), reset_in.to_string()));
        if let Some(policy) = result.policy() {
            headers.push((RATELIMIT_POLICY.to_string(), policy.to_string()));
        }
    }

    headers
}

/// Body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceededBody {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
    pub limit: u64,
    pub tier: String,
}

/// A complete 429 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceededResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ExceededBody,
}

impl ExceededResponse {
    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The body serialized as JSON.
    pub fn body_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.body)?)
    }
}

/// Build the 429 response for a denied result.
pub fn create_exceeded_response(
    result: &RateLimitResult,
    config: &HeaderConfig,
    now: i64,
) -> ExceededResponse {
    let retry_after = result.retry_after().unwrap_or(0);
    let mut headers = generate_headers(result, config, now);
    if retry_after > 0 {
        headers.push((RETRY_AFTER.to_string(), retry_after.to_string()));
    }

    let message = if retry_after > 0 {
        format!(
            "Too many requests. Please retry after {} seconds.",
            retry_after
        )
    } else {
        "Too many requests.".to_string()
    };

    ExceededResponse {
        status: TOO_MANY_REQUESTS,
        headers,
        body: ExceededBody {
            error: "rate_limit_exceeded".to_string(),
            message,
            retry_after,
            limit: result.limit(),
            tier: result.tier().unwrap_or("unknown").to_string(),
        },
    }
}

/// Header names that must be listed in `Access-Control-Expose-Headers` for
/// browsers to read them.
pub fn exposed_headers(config: &HeaderConfig) -> Vec<&'static str> {
    let mut names = Vec::new();
    if config.include_legacy {
        names.extend([X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET]);
    }
    if config.include_ietf {
        names.extend([
            RATELIMIT_LIMIT,
            RATELIMIT_REMAINING,
            RATELIMIT_RESET,
            RATELIMIT_POLICY,
        ]);
    }
    names.push(RETRY_AFTER);
    names
}

/// Value for the `Access-Control-Expose-Headers` header.
pub fn expose_headers_value(config: &HeaderConfig) -> String {
    exposed_headers(config).join(", ")
}
