//! Store descriptors and their persisted meta records.

use crate::options::{Options, SecurityLevel, StoreKind};
use crate::types::{AppId, DeviceId, StoreId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current on-disk format version, bumped on format upgrades.
pub const STORE_VERSION: u32 = 3;

/// The globally unique `(user, app, store)` triple identifying a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreTuple {
    pub user_id: UserId,
    pub app_id: AppId,
    pub store_id: StoreId,
}

impl StoreTuple {
    pub fn new(
        user_id: impl Into<UserId>,
        app_id: impl Into<AppId>,
        store_id: impl Into<StoreId>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            app_id: app_id.into(),
            store_id: store_id.into(),
        }
    }

    /// Both caller-supplied ids pass validation.
    pub fn ids_valid(&self) -> bool {
        self.app_id.is_valid() && self.store_id.is_valid()
    }
}

impl fmt::Display for StoreTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.app_id, self.store_id)
    }
}

/// The durable record describing a store, kept in the meta store under
/// `StoreMeta:<dev>:<user>:default:<app>:<store>`.
///
/// Serialized as JSON; peers exchange these records to learn about each
/// other's stores, so fields are additive across versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub app_id: AppId,
    /// `harmony` for system-trusted bundles, `default` otherwise. Drives
    /// the dirty-store deletion watcher.
    pub app_type: String,
    pub user_id: UserId,
    pub store_id: StoreId,
    pub device_id: DeviceId,
    pub kind: StoreKind,
    pub encrypted: bool,
    pub auto_sync: bool,
    pub backup: bool,
    pub security_level: SecurityLevel,
    pub schema: String,
    pub data_dir: String,
    pub version: u32,
    /// Set by a peer to request deletion of its replica on this device.
    #[serde(default)]
    pub is_dirty: bool,
}

impl StoreMeta {
    /// Assemble the record written after a successful open.
    pub fn from_open(
        tuple: &StoreTuple,
        options: &Options,
        device_id: DeviceId,
        data_dir: String,
    ) -> Self {
        Self {
            app_id: tuple.app_id.clone(),
            app_type: "harmony".to_string(),
            user_id: tuple.user_id.clone(),
            store_id: tuple.store_id.clone(),
            device_id,
            kind: options.kind,
            encrypted: options.encrypt,
            auto_sync: options.auto_sync,
            backup: options.backup,
            security_level: options.security_level,
            schema: options.schema.clone(),
            data_dir,
            version: STORE_VERSION,
            is_dirty: false,
        }
    }

    pub fn tuple(&self) -> StoreTuple {
        StoreTuple {
            user_id: self.user_id.clone(),
            app_id: self.app_id.clone(),
            store_id: self.store_id.clone(),
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Sync strategy / capability record for a store, written by
/// `SetCapability` and deleted together with the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyMeta {
    pub capability_enabled: bool,
    pub local_label: Vec<String>,
    pub remote_label: Vec<String>,
}

impl StrategyMeta {
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple() -> StoreTuple {
        StoreTuple {
            user_id: "0".into(),
            app_id: "app.a".into(),
            store_id: "s1".into(),
        }
    }

    #[test]
    fn test_store_meta_json_roundtrip() {
        let meta = StoreMeta::from_open(
            &tuple(),
            &Options {
                encrypt: true,
                ..Default::default()
            },
            DeviceId::new("abcd"),
            "/data/quilt".to_string(),
        );
        let bytes = meta.to_json();
        let back = StoreMeta::from_json(&bytes).unwrap();
        assert_eq!(back.tuple(), tuple());
        assert!(back.encrypted);
        assert!(!back.is_dirty);
        assert_eq!(back.version, STORE_VERSION);
    }

    #[test]
    fn test_is_dirty_defaults_false_for_old_records() {
        // Records written before the dirty flag existed must still parse.
        let json = br#"{"app_id":"app.a","app_type":"harmony","user_id":"0",
            "store_id":"s1","device_id":"d","kind":"SingleVersion",
            "encrypted":false,"auto_sync":false,"backup":false,
            "security_level":"De","schema":"","data_dir":"/d","version":1}"#;
        let meta = StoreMeta::from_json(json).unwrap();
        assert!(!meta.is_dirty);
    }
}
