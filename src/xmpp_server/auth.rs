//! Credential backend interface.
//!
//! Account storage lives outside the core; SASL mechanisms only see this trait.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unknown user or wrong password")]
    NotAuthorized,
    #[error("account is disabled")]
    AccountDisabled,
    #[error("operation not supported by the credential backend")]
    Unsupported,
    #[error("credential backend unavailable: {0}")]
    Temporary(String),
}

pub trait CredentialStore: Send + Sync {
    /// Check a plaintext password.
    fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthError>;

    /// Whether `password` can return plaintext-comparable secrets. Challenge
    /// based mechanisms are only offered when it can.
    fn supports_password_retrieval(&self) -> bool;

    fn password(&self, username: &str) -> Result<String, AuthError>;

    fn is_disabled(&self, _username: &str) -> bool {
        false
    }
}

/// In-memory accounts, filled from the `[users]` configuration section.
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    users: RwLock<HashMap<String, String>>,
    disabled: RwLock<HashSet<String>>,
}

impl StaticCredentialStore {
    pub fn new(users: HashMap<String, String>) -> Self {
        let users = users
            .into_iter()
            .map(|(name, password)| (name.to_lowercase(), password))
            .collect();
        Self {
            users: RwLock::new(users),
            disabled: RwLock::new(HashSet::new()),
        }
    }

    pub fn set_password(&self, username: &str, password: &str) {
        self.users
            .write()
            .insert(username.to_lowercase(), password.to_string());
    }

    pub fn set_disabled(&self, username: &str, disabled: bool) {
        let mut set = self.disabled.write();
        if disabled {
            set.insert(username.to_lowercase());
        } else {
            set.remove(&username.to_lowercase());
        }
    }
}

impl CredentialStore for StaticCredentialStore {
    fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthError> {
        match self.users.read().get(&username.to_lowercase()) {
            Some(stored) if stored == password => Ok(()),
            _ => Err(AuthError::NotAuthorized),
        }
    }

    fn supports_password_retrieval(&self) -> bool {
        true
    }

    fn password(&self, username: &str) -> Result<String, AuthError> {
        self.users
            .read()
            .get(&username.to_lowercase())
            .cloned()
            .ok_or(AuthError::NotAuthorized)
    }

    fn is_disabled(&self, username: &str) -> bool {
        self.disabled.read().contains(&username.to_lowercase())
    }
}
