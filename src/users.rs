//! In-memory stand-in for the external user store (§6: "the core relies on
//! an external user store"). The dispatcher's `auth` and `user.*` handlers
//! are written against this trait-shaped API; a deployment backed by a real
//! database only needs to satisfy the same operations.

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::auth::password::{hash_password, verify_password, PasswordError};
use crate::core::{id_string, now_s};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UserError {
    #[error("no such user")]
    NotFound,
    #[error("username or email already taken")]
    Conflict,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("password hashing failed")]
    HashingFailed,
}

impl From<PasswordError> for UserError {
    fn from(_: PasswordError) -> Self {
        UserError::HashingFailed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

pub struct UserStore {
    by_id: DashMap<String, User>,
    id_by_username: DashMap<String, String>,
}

impl UserStore {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            id_by_username: DashMap::new(),
        }
    }

    pub fn create(&self, username: &str, email: &str, password: &str) -> Result<User, UserError> {
        if self.id_by_username.contains_key(username) {
            return Err(UserError::Conflict);
        }
        let password_hash = hash_password(password)?;
        let now = now_s();
        let user = User {
            user_id: format!("u_{}", id_string()),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.id_by_username.insert(username.to_string(), user.user_id.clone());
        self.by_id.insert(user.user_id.clone(), user.clone());
        Ok(user)
    }

    pub fn get(&self, user_id: &str) -> Result<User, UserError> {
        self.by_id.get(user_id).map(|u| u.clone()).ok_or(UserError::NotFound)
    }

    pub fn get_by_username(&self, username: &str) -> Result<User, UserError> {
        let id = self.id_by_username.get(username).ok_or(UserError::NotFound)?;
        self.get(&id)
    }

    pub fn list(&self) -> Vec<User> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }

    pub fn update_email(&self, user_id: &str, email: &str) -> Result<User, UserError> {
        let mut u = self.by_id.get_mut(user_id).ok_or(UserError::NotFound)?;
        u.email = email.to_string();
        u.updated_at = now_s();
        Ok(u.clone())
    }

    pub fn delete(&self, user_id: &str) -> Result<(), UserError> {
        let (_, user) = self.by_id.remove(user_id).ok_or(UserError::NotFound)?;
        self.id_by_username.remove(&user.username);
        Ok(())
    }

    /// Verify a username/password pair, the entry point for `auth`.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<User, UserError> {
        let user = self.get_by_username(username)?;
        if !user.is_active {
            return Err(UserError::InvalidCredentials);
        }
        match verify_password(password, &user.password_hash) {
            Ok(true) => Ok(user),
            _ => Err(UserError::InvalidCredentials),
        }
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_authenticate_round_trip() {
        let store = UserStore::new();
        let user = store.create("alice", "alice@example.com", "Secret!1").unwrap();
        let authed = store.authenticate("alice", "Secret!1").unwrap();
        assert_eq!(authed.user_id, user.user_id);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let store = UserStore::new();
        store.create("bob", "bob@example.com", "Secret!1").unwrap();
        assert_eq!(store.authenticate("bob", "wrong"), Err(UserError::InvalidCredentials));
    }

    #[test]
    fn duplicate_username_conflicts() {
        let store = UserStore::new();
        store.create("carol", "carol@example.com", "Secret!1").unwrap();
        assert_eq!(
            store.create("carol", "carol2@example.com", "Secret!1"),
            Err(UserError::Conflict)
        );
    }

    #[test]
    fn delete_removes_username_index() {
        let store = UserStore::new();
        let user = store.create("dan", "dan@example.com", "Secret!1").unwrap();
        store.delete(&user.user_id).unwrap();
        assert_eq!(store.get_by_username("dan"), Err(UserError::NotFound));
    }
}
