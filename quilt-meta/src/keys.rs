//! Composite key builders for the meta store.
//!
//! Layout (all segments `:`-separated, account slot fixed to `default`):
//!
//! - `StoreMeta:<dev>:<user>:default:<app>:<store>` — descriptor record
//! - `SecretKey:<user>:default:<app>:<store>:<KEY|SINGLE_KEY>` — sealed secret
//! - `StrategyMeta:<dev>:<user>:default:<app>:<store>` — capability record

use quilt_model::{DeviceId, StoreTuple};

pub const STORE_META_PREFIX: &str = "StoreMeta";
pub const SECRET_KEY_PREFIX: &str = "SecretKey";
pub const STRATEGY_META_PREFIX: &str = "StrategyMeta";

const SEPARATOR: &str = ":";
const DEFAULT_ACCOUNT: &str = "default";

/// Which engine a sealed secret belongs to. Single stores use
/// `SINGLE_KEY`; relational stores use `KEY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Key,
    SingleKey,
}

impl SecretKind {
    fn suffix(&self) -> &'static str {
        match self {
            SecretKind::Key => "KEY",
            SecretKind::SingleKey => "SINGLE_KEY",
        }
    }
}

fn join(segments: &[&str]) -> Vec<u8> {
    segments.join(SEPARATOR).into_bytes()
}

/// Key of a store's descriptor record.
pub fn store_meta_key(device: &DeviceId, tuple: &StoreTuple) -> Vec<u8> {
    join(&[
        STORE_META_PREFIX,
        device.as_str(),
        tuple.user_id.as_str(),
        DEFAULT_ACCOUNT,
        tuple.app_id.as_str(),
        tuple.store_id.as_str(),
    ])
}

/// Prefix covering every store of one app for one user on one device.
/// Used by store-id enumeration.
pub fn store_meta_app_prefix(device: &DeviceId, user_id: &str, app_id: &str) -> Vec<u8> {
    let mut prefix = join(&[
        STORE_META_PREFIX,
        device.as_str(),
        user_id,
        DEFAULT_ACCOUNT,
        app_id,
    ]);
    prefix.extend_from_slice(SEPARATOR.as_bytes());
    prefix
}

/// Prefix covering every descriptor record; the registry's watcher
/// subscribes here.
pub fn store_meta_prefix() -> Vec<u8> {
    let mut prefix = STORE_META_PREFIX.as_bytes().to_vec();
    prefix.extend_from_slice(SEPARATOR.as_bytes());
    prefix
}

/// Key of a store's sealed secret.
pub fn secret_key_key(tuple: &StoreTuple, kind: SecretKind) -> Vec<u8> {
    join(&[
        SECRET_KEY_PREFIX,
        tuple.user_id.as_str(),
        DEFAULT_ACCOUNT,
        tuple.app_id.as_str(),
        tuple.store_id.as_str(),
        kind.suffix(),
    ])
}

/// Key of a store's sync strategy record.
pub fn strategy_meta_key(device: &DeviceId, tuple: &StoreTuple) -> Vec<u8> {
    join(&[
        STRATEGY_META_PREFIX,
        device.as_str(),
        tuple.user_id.as_str(),
        DEFAULT_ACCOUNT,
        tuple.app_id.as_str(),
        tuple.store_id.as_str(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple() -> StoreTuple {
        StoreTuple::new("100", "app.a", "s1")
    }

    #[test]
    fn test_store_meta_key_layout() {
        let key = store_meta_key(&DeviceId::new("dev"), &tuple());
        assert_eq!(key, b"StoreMeta:dev:100:default:app.a:s1".to_vec());
    }

    #[test]
    fn test_secret_key_suffixes() {
        assert!(secret_key_key(&tuple(), SecretKind::SingleKey).ends_with(b":SINGLE_KEY"));
        assert!(secret_key_key(&tuple(), SecretKind::Key).ends_with(b":KEY"));
    }

    #[test]
    fn test_app_prefix_matches_store_key() {
        let key = store_meta_key(&DeviceId::new("dev"), &tuple());
        let prefix = store_meta_app_prefix(&DeviceId::new("dev"), "100", "app.a");
        assert!(key.starts_with(&prefix));

        let other = store_meta_app_prefix(&DeviceId::new("dev"), "100", "app");
        assert!(!key.starts_with(&other));
    }
}
