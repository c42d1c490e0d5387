//! Typed ID wrappers providing compile-time safety for entity identifiers.
//!
//! Jobs, tasks and profiles are identified by newtypes over `Uuid`, which
//! prevents passing a `TaskId` where a `JobId` is expected. Worker nodes name
//! themselves, so [`NodeId`] wraps a string instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Generate a newtype ID wrapper over `Uuid`.
///
/// The macro produces a struct with:
/// - `new()` to create a random v4 UUID
/// - `Debug`, `Clone`, `Copy`, `PartialEq`, `Eq`, `Hash`, `Ord`, `Serialize`, `Deserialize`
/// - `Display` and `FromStr` delegating to the inner UUID
/// - `From<Uuid>` and `Into<Uuid>` conversions
/// - `Default` that generates a new random ID
macro_rules! typed_id {
    ($($(#[doc = $doc:expr])* $name:ident),+ $(,)?) => {
        $(
            $(#[doc = $doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                /// Create a new random ID.
                #[must_use]
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                /// Build an ID from a fixed 128-bit value.
                #[must_use]
                pub const fn from_u128(value: u128) -> Self {
                    Self(Uuid::from_u128(value))
                }

                /// Return the inner UUID value.
                #[must_use]
                pub fn as_uuid(&self) -> &Uuid {
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

            impl FromStr for $name {
                type Err = uuid::Error;

                fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                    Uuid::parse_str(s).map(Self)
                }
            }

            impl From<Uuid> for $name {
                fn from(uuid: Uuid) -> Self {
                    Self(uuid)
                }
            }

            impl From<$name> for Uuid {
                fn from(id: $name) -> Self {
                    id.0
                }
            }
        )+
    };
}

typed_id! {
    /// Unique identifier for an encoding job.
    JobId,
    /// Unique identifier for a task within a job.
    TaskId,
    /// Unique identifier for an encoding profile.
    ProfileId,
}

/// Self-assigned name of a worker node (usually the hostname).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn roundtrip_uuid() {
        let uuid = Uuid::new_v4();
        let id = TaskId::from(uuid);
        let back: Uuid = id.into();
        assert_eq!(uuid, back);
    }

    #[test]
    fn display_and_from_str() {
        let id = ProfileId::new();
        let parsed: ProfileId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn fixed_ids_are_stable() {
        const A: ProfileId = ProfileId::from_u128(1);
        assert_eq!(A, ProfileId::from_u128(1));
        assert_eq!(A.to_string(), "00000000-0000-0000-0000-000000000001");
    }

    #[test]
    fn invalid_from_str() {
        assert!(JobId::from_str("not-a-uuid").is_err());
    }

    #[test]
    fn node_id_serializes_as_plain_string() {
        let node = NodeId::from("gpu-01");
        assert_eq!(serde_json::to_string(&node).unwrap(), "\"gpu-01\"");
        assert_eq!(node.to_string(), "gpu-01");
        assert_eq!(node.as_str(), "gpu-01");
    }
}
