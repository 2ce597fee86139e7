//! Identifiers for users, applications, stores, and devices.
//!
//! All ids are caller-supplied strings except [`DeviceId`], which the
//! service derives from the transport's local device name. Validation
//! mirrors the service surface: non-empty, at most 256 bytes, restricted
//! character set.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum byte length of an application or store id.
pub const MAX_ID_LENGTH: usize = 256;

fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LENGTH
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Build from a caller-supplied string, trimming surrounding
            /// whitespace the way the service surface does.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into().trim().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Non-empty, bounded length, restricted character set.
            pub fn is_valid(&self) -> bool {
                is_valid_id(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

string_id!(
    /// Bundle name of the calling application.
    AppId
);
string_id!(
    /// Caller-chosen store identifier, unique per `(user, app)`.
    StoreId
);
string_id!(
    /// Device-account id a store belongs to, resolved from the caller uid.
    UserId
);

/// Identity of a device in the sync mesh.
///
/// Locally this is the hex SHA-256 of the transport's device name; remote
/// ids arrive pre-hashed from peers. Empty means "this device" in log
/// entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(hashed: impl Into<String>) -> Self {
        Self(hashed.into())
    }

    /// The local-origin marker used in change-log entries.
    pub fn local() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0.is_empty()
    }

    /// Short prefix for log output; device ids are long hashes.
    pub fn fmt_short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
