//! Identifier newtypes.
//!
//! Endpoints, deploys and invocations are all addressed by opaque strings.
//! Wrapping them keeps a deploy id from being passed where an endpoint id is
//! expected; all three serialize as plain strings.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of an externally addressable endpoint.
    EndpointId
);

string_id!(
    /// Identifier of one immutable deploy artifact.
    DeployId
);

string_id!(
    /// Identifier of one invocation; generated per call and never reused.
    InvocationId
);

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_generate_is_unique() {
        let ids: HashSet<InvocationId> = (0..1000).map(|_| InvocationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = DeployId::new("d-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""d-1""#);

        let back: DeployId = serde_json::from_str(r#""d-1""#).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_display() {
        assert_eq!(EndpointId::from("e1").to_string(), "e1");
        assert_eq!(EndpointId::from("e1").as_str(), "e1");
    }
}
