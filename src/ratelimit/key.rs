//! Storage key derivation.
//!
//! A key is `{prefix}:{identity}:{tier}:{window}:{attempts}:{algorithm}`.
//! Everything after the identity describes the declaration itself, so two
//! limits on the same caller never read or write each other's state, even
//! when they share a window.

use crate::request::RequestContext;

use super::limit::{KeyBy, LimitConfig};

/// Default namespace for every key written to storage.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// Builds storage keys for limits.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Full storage key for evaluating `limit` against `request` in `tier`.
    pub fn build<R: RequestContext + ?Sized>(
        &self,
        request: &R,
        limit: &LimitConfig,
        tier: &str,
    ) -> String {
        let identity = match (&limit.key, limit.by) {
            (Some(pattern), _) => resolve_pattern(pattern, request, tier),
            (None, KeyBy::Ip) | (None, KeyBy::Custom) => format!("ip:{}", request.client_ip()),
            (None, KeyBy::User) => match request.principal().and_then(|p| p.id()) {
                Some(id) => format!("user:{}", id),
                None => format!("ip:{}", request.client_ip()),
            },
            (None, KeyBy::Endpoint) => format!(
                "endpoint:{}:{}:{}",
                request.method(),
                request.path(),
                caller_identifier(request)
            ),
        };

        format!(
            "{}:{}:{}:{}:{}:{}",
            self.prefix, identity, tier, limit.window_secs, limit.attempts, limit.algorithm
        )
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// The principal id when authenticated, otherwise the client IP.
fn caller_identifier<R: RequestContext + ?Sized>(request: &R) -> String {
    request
        .principal()
        .and_then(|p| p.id())
        .unwrap_or_else(|| request.client_ip().to_string())
}

/// Substitute `{ip}`, `{user}`, `{path}`, `{method}` and `{tier}` in a
/// custom key pattern. Unknown placeholders are left as written.
pub fn resolve_pattern<R: RequestContext + ?Sized>(pattern: &str, request: &R, tier: &str) -> String {
    let mut resolved = String::with_capacity(pattern.len() + 16);
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        resolved.push_str(&rest[..open]);
        let after = &rest[open..];
        let Some(close) = after.find('}') else {
            rest = after;
            break;
        };

        match &after[1..close] {
            "ip" => resolved.push_str(request.client_ip()),
            "user" => resolved.push_str(&caller_identifier(request)),
            "path" => resolved.push_str(request.path()),
            "method" => resolved.push_str(request.method()),
            "tier" => resolved.push_str(tier),
            _ => resolved.push_str(&after[..=close]),
        }
        rest = &after[close + 1..];
    }

    resolved.push_str(rest);
    resolved
}
