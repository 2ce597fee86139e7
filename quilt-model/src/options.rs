//! Open options and the enums they carry.

use serde::{Deserialize, Serialize};

/// Kind of store engine a caller asks for.
///
/// `MultiVersion` is recognized for wire compatibility with legacy clients
/// but no longer backed by an engine; opens are rejected with
/// [`Status::NotSupported`](crate::Status::NotSupported).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    SingleVersion,
    Relational,
    MultiVersion,
}

/// Which data root a store lives under.
///
/// `De` is available from boot, `Ce` only after the user unlocks. The
/// level picks the directory subtree and the backup location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    #[default]
    De,
    Ce,
}

impl SecurityLevel {
    /// Path segment for this level.
    pub fn dir_name(&self) -> &'static str {
        match self {
            SecurityLevel::De => "de",
            SecurityLevel::Ce => "ce",
        }
    }

    pub fn all() -> [SecurityLevel; 2] {
        [SecurityLevel::De, SecurityLevel::Ce]
    }
}

/// Caller-supplied store options, fixed across the service surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Create the store if it does not exist; `false` turns a missing
    /// store into `StoreNotOpen`.
    pub create_if_missing: bool,
    /// The store must be protected by a per-store secret key.
    pub encrypt: bool,
    /// The engine may initiate sync without explicit calls.
    pub auto_sync: bool,
    /// Enables the periodic backup snapshot.
    pub backup: bool,
    pub security_level: SecurityLevel,
    pub kind: StoreKind,
    /// Opaque schema string persisted in meta alongside the store.
    pub schema: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            encrypt: false,
            auto_sync: false,
            backup: false,
            security_level: SecurityLevel::De,
            kind: StoreKind::SingleVersion,
            schema: String::new(),
        }
    }
}

impl Options {
    /// A kind the engines can actually serve.
    pub fn is_supported_kind(&self) -> bool {
        !matches!(self.kind, StoreKind::MultiVersion)
    }
}
