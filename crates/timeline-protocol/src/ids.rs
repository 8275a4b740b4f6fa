//! Canonical ID types for the timeline.
//!
//! IDs are opaque String wrappers (serde-transparent). Event ids are UUID v4
//! generated at creation; tenant, project and thread ids come from callers.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

typed_id!(
    /// Globally unique identifier for an event. The only valid resumption token.
    EventId
);
typed_id!(
    /// Tenant identifier (`t_[a-z0-9_-]+`).
    TenantId
);
typed_id!(
    /// Project identifier within a tenant.
    ProjectId
);
typed_id!(
    /// Conversation thread identifier.
    ThreadId
);
typed_id!(
    /// Agent run identifier.
    RunId
);
typed_id!(
    /// Identifier for one live transport connection.
    ConnectionId
);

impl TenantId {
    /// Whether the id matches `t_[a-z0-9_-]+`.
    pub fn is_well_formed(&self) -> bool {
        is_valid_tenant_id(&self.0)
    }
}

pub(crate) fn is_valid_tenant_id(raw: &str) -> bool {
    match raw.strip_prefix("t_") {
        Some(rest) if !rest.is_empty() => rest
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'),
        _ => false,
    }
}
