//! Identifier types shared by events, commands and queries.
//!
//! All identifiers are trimmed on construction. Emptiness is not rejected here:
//! the eventstore checks required identifiers at the push boundary, where a
//! missing value becomes an `InvalidArgument` error for the whole push.

use nutype::nutype;

/// The kind of entity an event stream belongs to, e.g. `user` or `org`.
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateType(String);

/// Identifier of a single aggregate within its type.
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AggregateId(String);

/// Name of a domain change, e.g. `user.human.added`.
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

/// Tenant the aggregate lives in. Empty for system-level aggregates.
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct InstanceId(String);

/// Organisation owning the aggregate.
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ResourceOwner(String);

/// Schema version of the aggregate's events, e.g. `v1`.
#[nutype(
    sanitize(trim),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Version(String);

macro_rules! string_conversions {
    ($($name:ident),+ $(,)?) => {
        $(
            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    Self::new(value.to_string())
                }
            }

            impl From<String> for $name {
                fn from(value: String) -> Self {
                    Self::new(value)
                }
            }

            impl From<&$name> for $name {
                fn from(value: &$name) -> Self {
                    value.clone()
                }
            }

            impl $name {
                /// Returns the identifier as a string slice.
                pub fn as_str(&self) -> &str {
                    let value: &String = self;
                    value
                }
            }
        )+
    };
}

string_conversions!(
    AggregateType,
    AggregateId,
    EventType,
    InstanceId,
    ResourceOwner,
    Version
);

impl Default for InstanceId {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl Default for ResourceOwner {
    fn default() -> Self {
        Self::new(String::new())
    }
}
