//! User records and token checks.
//!
//! Users live in the meta table under the reserved `~` prefix; every mutation
//! is journaled through the meta pipeline by the master before the in-memory
//! map changes. Tokens are a stable hash of `user:password`, so records never
//! store the password itself.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::meta::UserMeta;
use crate::status::StatusCode;

pub const ROOT_USER: &str = "root";

/// Token derivation: hash of `user:password`, hex-encoded.
pub fn user_token(user: &str, password: &str) -> String {
    let mut hasher = DefaultHasher::new();
    format!("{user}:{password}").hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[derive(Default)]
pub struct UserManager {
    users: Mutex<HashMap<String, UserMeta>>,
}

impl UserManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore one user record read back from the meta tablet.
    pub fn load_user_meta(&self, meta: UserMeta) {
        self.users.lock().unwrap().insert(meta.name.clone(), meta);
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.users.lock().unwrap().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<UserMeta> {
        self.users.lock().unwrap().get(name).cloned()
    }

    pub fn list(&self) -> Vec<UserMeta> {
        let mut users: Vec<UserMeta> = self.users.lock().unwrap().values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    /// Build (but do not apply) the record for a new user.
    pub fn prepare_create(&self, name: &str, password: &str) -> Result<UserMeta, StatusCode> {
        if name.is_empty() || !crate::meta::is_valid_table_name(name) {
            return Err(StatusCode::BadParam);
        }
        if self.is_known(name) {
            return Err(StatusCode::TableExist);
        }
        Ok(UserMeta {
            name: name.to_string(),
            token: user_token(name, password),
            groups: Vec::new(),
        })
    }

    pub fn prepare_change_pwd(&self, name: &str, password: &str) -> Result<UserMeta, StatusCode> {
        let mut meta = self.get(name).ok_or(StatusCode::NotFound)?;
        meta.token = user_token(name, password);
        Ok(meta)
    }

    pub fn prepare_add_to_group(&self, name: &str, group: &str) -> Result<UserMeta, StatusCode> {
        let mut meta = self.get(name).ok_or(StatusCode::NotFound)?;
        if meta.groups.iter().any(|g| g == group) {
            return Err(StatusCode::BadParam);
        }
        meta.groups.push(group.to_string());
        Ok(meta)
    }

    pub fn prepare_remove_from_group(
        &self,
        name: &str,
        group: &str,
    ) -> Result<UserMeta, StatusCode> {
        let mut meta = self.get(name).ok_or(StatusCode::NotFound)?;
        let before = meta.groups.len();
        meta.groups.retain(|g| g != group);
        if meta.groups.len() == before {
            return Err(StatusCode::NotFound);
        }
        Ok(meta)
    }

    /// Apply a record after its meta write succeeded.
    pub fn apply(&self, meta: UserMeta) {
        self.users.lock().unwrap().insert(meta.name.clone(), meta);
    }

    pub fn remove(&self, name: &str) -> Option<UserMeta> {
        self.users.lock().unwrap().remove(name)
    }

    /// Whether `token` belongs to the root user.
    pub fn is_root_token(&self, token: &str) -> bool {
        self.get(ROOT_USER).is_some_and(|meta| meta.token == token)
    }

    /// Permission gate for table-modifying RPCs: root always passes, other
    /// tokens must belong to a registered user.
    pub fn has_permission(&self, token: &str) -> bool {
        if self.is_root_token(token) {
            return true;
        }
        self.users
            .lock()
            .unwrap()
            .values()
            .any(|meta| meta.token == token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_stable_and_password_sensitive() {
        assert_eq!(user_token("alice", "pw"), user_token("alice", "pw"));
        assert_ne!(user_token("alice", "pw"), user_token("alice", "pw2"));
        assert_ne!(user_token("alice", "pw"), user_token("bob", "pw"));
    }

    #[test]
    fn create_then_change_pwd_rotates_token() {
        let manager = UserManager::new();
        let created = manager.prepare_create("alice", "pw").unwrap();
        manager.apply(created.clone());
        assert!(manager.has_permission(&created.token));

        let rotated = manager.prepare_change_pwd("alice", "pw2").unwrap();
        manager.apply(rotated.clone());
        assert!(!manager.has_permission(&created.token));
        assert!(manager.has_permission(&rotated.token));
    }

    #[test]
    fn duplicate_user_is_rejected() {
        let manager = UserManager::new();
        manager.apply(manager.prepare_create("alice", "pw").unwrap());
        assert_eq!(
            manager.prepare_create("alice", "pw").unwrap_err(),
            StatusCode::TableExist
        );
    }

    #[test]
    fn group_membership_round_trip() {
        let manager = UserManager::new();
        manager.apply(manager.prepare_create("alice", "pw").unwrap());
        manager.apply(manager.prepare_add_to_group("alice", "admins").unwrap());
        assert_eq!(manager.get("alice").unwrap().groups, vec!["admins"]);
        manager.apply(manager.prepare_remove_from_group("alice", "admins").unwrap());
        assert!(manager.get("alice").unwrap().groups.is_empty());
        assert_eq!(
            manager
                .prepare_remove_from_group("alice", "admins")
                .unwrap_err(),
            StatusCode::NotFound
        );
    }
}
