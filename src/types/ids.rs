//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `must()`, `as_str()`, Display,
/// Serialize, Deserialize. Optionally generates `new()` (UUID v4) and
/// `Default` if the `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            /// Construct from a literal known to be non-empty. Panics on
            /// empty input; intended for tests and static registration.
            #[allow(clippy::panic)]
            pub fn must(s: impl Into<String>) -> Self {
                let s = s.into();
                if s.is_empty() {
                    panic!(concat!(stringify!($name), " cannot be empty"));
                }
                Self(s)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            /// Construct from a literal known to be non-empty. Panics on
            /// empty input; intended for tests and static registration.
            #[allow(clippy::panic)]
            pub fn must(s: impl Into<String>) -> Self {
                let s = s.into();
                if s.is_empty() {
                    panic!(concat!(stringify!($name), " cannot be empty"));
                }
                Self(s)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(InvocationId, uuid);
define_id!(PlanId, uuid);
define_id!(ToolId);
define_id!(TenantId);
define_id!(StepId);
define_id!(UserId);
