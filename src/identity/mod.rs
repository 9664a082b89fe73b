//! Visitor and session identifiers.
//!
//! Two tokens, each in its own storage scope: the visitor id lives in
//! durable storage and survives browser restarts, the session id lives in
//! session-scoped storage and dies with the tab.

pub mod storage;

use std::{fmt, sync::Arc};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AgentError;

pub use storage::{FileStorage, MemoryStorage};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum StorageScope {
    Durable,
    Session,
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageScope::Durable => f.write_str("durable"),
            StorageScope::Session => f.write_str("session"),
        }
    }
}

/// Key/value capability provided by the host environment.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Returns the stored value or stores `make()` and returns that.
    /// Implementations holding a lock should keep it across both steps.
    fn get_or_insert_with(&self, key: &str, make: &mut dyn FnMut() -> String) -> Result<String> {
        if let Some(existing) = self.get(key)? {
            return Ok(existing);
        }
        let value = make();
        self.set(key, &value)?;
        Ok(value)
    }
}

/// The durable and session stores a page has access to.
#[derive(Clone)]
pub struct IdentityStores {
    durable: Arc<dyn Storage>,
    session: Arc<dyn Storage>,
}

impl IdentityStores {
    pub fn new(durable: Arc<dyn Storage>, session: Arc<dyn Storage>) -> Self {
        Self { durable, session }
    }

    pub fn scope(&self, scope: StorageScope) -> &dyn Storage {
        match scope {
            StorageScope::Durable => self.durable.as_ref(),
            StorageScope::Session => self.session.as_ref(),
        }
    }
}

pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// Returns the identifier stored under `key` in `scope`, creating it on
/// first access. Storage failures are reported, never papered over with a
/// throwaway token.
pub fn provision_identifier(
    stores: &IdentityStores,
    scope: StorageScope,
    key: &str,
) -> Result<String, AgentError> {
    stores
        .scope(scope)
        .get_or_insert_with(key, &mut generate_token)
        .map_err(|source| AgentError::StorageUnavailable { scope, source })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identities {
    pub user_id: String,
    pub session_id: String,
}

impl Identities {
    pub fn provision(
        stores: &IdentityStores,
        visitor_key: &str,
        session_key: &str,
    ) -> Result<Self, AgentError> {
        Ok(Self {
            user_id: provision_identifier(stores, StorageScope::Durable, visitor_key)?,
            session_id: provision_identifier(stores, StorageScope::Session, session_key)?,
        })
    }
}
