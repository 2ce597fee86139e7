//! Caller identity checker collaborator.

use std::collections::HashMap;
use std::sync::RwLock;

/// Lowest uid granted implicit trust; callers below it must be in the
/// trust table.
pub const SYSTEM_UID: u32 = 10_000;

/// Resolves caller uids and bundle names to trusted app identities.
pub trait Checker: Send + Sync {
    /// The true app id for `(uid, bundle)`, or `None` when the caller may
    /// not act for that bundle.
    fn get_app_id(&self, uid: u32, bundle_name: &str) -> Option<String>;

    fn is_valid(&self, uid: u32, bundle_name: &str) -> bool {
        self.get_app_id(uid, bundle_name).is_some()
    }
}

/// Default checker: a static trust table plus implicit trust for system
/// uids acting under their own bundle name.
pub struct BundleChecker {
    trusts: RwLock<HashMap<String, String>>,
}

impl BundleChecker {
    pub fn new() -> Self {
        Self {
            trusts: RwLock::new(HashMap::new()),
        }
    }

    /// Pin `bundle_name` to a fixed app id regardless of uid.
    pub fn set_trust_info(&self, bundle_name: &str, app_id: &str) {
        let mut trusts = self.trusts.write().unwrap_or_else(|e| e.into_inner());
        trusts.insert(bundle_name.to_string(), app_id.to_string());
    }
}

impl Default for BundleChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl Checker for BundleChecker {
    fn get_app_id(&self, uid: u32, bundle_name: &str) -> Option<String> {
        if bundle_name.is_empty() {
            return None;
        }
        let trusts = self.trusts.read().unwrap_or_else(|e| e.into_inner());
        if let Some(app_id) = trusts.get(bundle_name) {
            return Some(app_id.clone());
        }
        if uid >= SYSTEM_UID {
            Some(bundle_name.to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_uid_trusted_for_own_bundle() {
        let checker = BundleChecker::new();
        assert_eq!(
            checker.get_app_id(10_001, "app.a").as_deref(),
            Some("app.a")
        );
        assert!(checker.is_valid(10_001, "app.a"));
    }

    #[test]
    fn test_low_uid_denied_unless_trusted() {
        let checker = BundleChecker::new();
        assert_eq!(checker.get_app_id(99, "app.a"), None);

        checker.set_trust_info("app.a", "signed.app.a");
        assert_eq!(checker.get_app_id(99, "app.a").as_deref(), Some("signed.app.a"));
    }

    #[test]
    fn test_empty_bundle_denied() {
        let checker = BundleChecker::new();
        assert_eq!(checker.get_app_id(10_001, ""), None);
    }
}
