//! Mapping an authenticated principal to a tier name.
//!
//! Resolution runs a fixed list of extractors in priority order and keeps
//! the first non-empty answer:
//!
//! 1. plan/tier fields of a record principal
//! 2. tier accessors of an object principal
//! 3. plan/tier attributes of an object principal
//! 4. roles, mapped through the role table; when several roles map, the
//!    highest tier wins regardless of list order
//!
//! Unauthenticated requests are `anonymous`; authenticated ones that match
//! nothing are `free`.

use std::collections::HashMap;

use serde_json::Value;
use tracing::trace;

use crate::request::{scalar_to_string, Principal, RequestContext};

pub const ANONYMOUS: &str = "anonymous";
pub const FREE: &str = "free";
pub const PRO: &str = "pro";
pub const ENTERPRISE: &str = "enterprise";

/// Field names that may carry a tier, in priority order.
const TIER_FIELDS: &[&str] = &[
    "tier",
    "plan",
    "subscription_tier",
    "subscription",
    "rate_limit_tier",
];

/// Tiers granted through roles, highest first. Tiers not listed rank
/// below these, in the order their roles appear.
const ROLE_TIER_PRIORITY: &[&str] = &[ENTERPRISE, PRO, FREE, ANONYMOUS];

fn role_tier_rank(tier: &str) -> usize {
    ROLE_TIER_PRIORITY
        .iter()
        .position(|ranked| *ranked == tier)
        .unwrap_or(ROLE_TIER_PRIORITY.len())
}

/// Fold a tier name to its canonical lowercase form.
pub fn normalize_tier(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "unlimited" => ENTERPRISE.to_string(),
        "starter" => FREE.to_string(),
        "guest" => ANONYMOUS.to_string(),
        _ => name,
    }
}

type TierExtractor = fn(&Principal) -> Option<String>;

fn non_blank(value: &Value) -> Option<String> {
    scalar_to_string(value).filter(|s| !s.trim().is_empty())
}

fn from_record_fields(principal: &Principal) -> Option<String> {
    match principal {
        Principal::Record(map) => TIER_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(non_blank)),
        Principal::Object(_) => None,
    }
}

fn from_accessors(principal: &Principal) -> Option<String> {
    match principal {
        Principal::Object(identity) => identity
            .tier()
            .filter(|tier| !tier.trim().is_empty())
            .or_else(|| identity.plan().filter(|plan| !plan.trim().is_empty()))
            .or_else(|| {
                identity
                    .subscription_tier()
                    .filter(|tier| !tier.trim().is_empty())
            }),
        Principal::Record(_) => None,
    }
}

fn from_attributes(principal: &Principal) -> Option<String> {
    match principal {
        Principal::Object(identity) => TIER_FIELDS.iter().find_map(|field| {
            identity
                .attribute(field)
                .as_ref()
                .and_then(non_blank)
        }),
        Principal::Record(_) => None,
    }
}

const FIELD_EXTRACTORS: &[TierExtractor] = &[from_record_fields, from_accessors, from_attributes];

fn roles_of(principal: &Principal) -> Vec<String> {
    let from_value = |value: Option<&Value>| -> Vec<String> {
        match value {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
            Some(Value::String(role)) => vec![role.clone()],
            _ => Vec::new(),
        }
    };

    match principal {
        Principal::Record(map) => from_value(map.get("roles")),
        Principal::Object(identity) => {
            let roles = identity.roles();
            if roles.is_empty() {
                from_value(identity.attribute("roles").as_ref())
            } else {
                roles
            }
        }
    }
}

/// Resolves the tier a request is evaluated under.
#[derive(Debug, Clone)]
pub struct TierResolver {
    roles: HashMap<String, String>,
    authenticated_default: String,
}

impl TierResolver {
    /// Resolver with the built-in role table.
    pub fn new() -> Self {
        let roles = [
            ("admin", ENTERPRISE),
            ("enterprise", ENTERPRISE),
            ("pro", PRO),
            ("professional", PRO),
            ("business", PRO),
            ("premium", PRO),
        ]
        .into_iter()
        .map(|(role, tier)| (role.to_string(), tier.to_string()))
        .collect();

        Self {
            roles,
            authenticated_default: FREE.to_string(),
        }
    }

    /// Map an extra role to a tier.
    pub fn with_role(mut self, role: &str, tier: &str) -> Self {
        self.roles
            .insert(role.trim().to_ascii_lowercase(), normalize_tier(tier));
        self
    }

    /// Resolve the tier for a request.
    pub fn resolve<R: RequestContext + ?Sized>(&self, request: &R) -> String {
        self.resolve_principal(request.principal())
    }

    /// Resolve the tier for a principal, `None` meaning unauthenticated.
    pub fn resolve_principal(&self, principal: Option<&Principal>) -> String {
        let Some(principal) = principal else {
            return ANONYMOUS.to_string();
        };

        let direct = FIELD_EXTRACTORS
            .iter()
            .find_map(|extract| extract(principal));
        if let Some(tier) = direct {
            trace!(tier = %tier, "Tier taken from principal field");
            return normalize_tier(&tier);
        }

        let from_roles = roles_of(principal)
            .iter()
            .filter_map(|role| self.roles.get(&role.trim().to_ascii_lowercase()))
            .min_by_key(|tier| role_tier_rank(tier));
        if let Some(tier) = from_roles {
            trace!(tier = %tier, "Tier taken from principal roles");
            return tier.clone();
        }

        self.authenticated_default.clone()
    }
}

impl Default for TierResolver {
    fn default() -> Self {
        Self::new()
    }
}
