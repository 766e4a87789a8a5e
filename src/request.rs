//! The view of an inbound request that rate limiting needs.
//!
//! Routing and authentication live elsewhere. They hand over the client
//! address, method, path and whatever principal the auth layer attached.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

/// Accessor for the request attributes used to key and tier a limit.
pub trait RequestContext {
    /// HTTP method, e.g. `GET`.
    fn method(&self) -> &str;

    /// Request path, e.g. `/api/users`.
    fn path(&self) -> &str;

    /// Client IP address as a string.
    fn client_ip(&self) -> &str;

    /// Principal attached by upstream authentication, if any.
    fn principal(&self) -> Option<&Principal>;
}

/// An authenticated principal exposed through methods.
///
/// Every accessor has a default so implementors only provide what their
/// user model actually has.
pub trait Identity: Send + Sync {
    /// Stable identifier of the principal.
    fn id(&self) -> Option<String>;

    fn tier(&self) -> Option<String> {
        None
    }

    fn plan(&self) -> Option<String> {
        None
    }

    fn subscription_tier(&self) -> Option<String> {
        None
    }

    fn roles(&self) -> Vec<String> {
        Vec::new()
    }

    /// Look up a raw attribute by name.
    fn attribute(&self, _name: &str) -> Option<Value> {
        None
    }
}

/// The authenticated principal attached to a request.
#[derive(Clone)]
pub enum Principal {
    /// A structured record such as decoded token claims.
    Record(Map<String, Value>),
    /// A user object exposing accessors.
    Object(Arc<dyn Identity>),
}

/// Record fields that may carry the principal id, in priority order.
const ID_FIELDS: &[&str] = &["id", "user_id", "sub"];

impl Principal {
    /// Build a record principal from a JSON object. Non-objects yield `None`.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Principal::Record(map)),
            _ => None,
        }
    }

    pub fn object(identity: impl Identity + 'static) -> Self {
        Principal::Object(Arc::new(identity))
    }

    /// Identifier of the principal, if it has one.
    pub fn id(&self) -> Option<String> {
        let id = match self {
            Principal::Record(map) => ID_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(scalar_to_string)),
            Principal::Object(identity) => identity.id(),
        };
        id.filter(|id| !id.is_empty())
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Record(map) => f.debug_tuple("Record").field(map).finish(),
            Principal::Object(identity) => f
                .debug_struct("Object")
                .field("id", &identity.id())
                .finish(),
        }
    }
}

/// Render a string or number as a string.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A plain owned request, for callers without their own request type.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    method: String,
    path: String,
    client_ip: String,
    principal: Option<Principal>,
}

impl RequestInfo {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        client_ip: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            client_ip: client_ip.into(),
            principal: None,
        }
    }

    /// Attach an authenticated principal.
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }
}

impl RequestContext for RequestInfo {
    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn client_ip(&self) -> &str {
        &self.client_ip
    }

    fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }
}
