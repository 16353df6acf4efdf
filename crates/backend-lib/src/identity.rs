// ============================
// roomchat-backend-lib/src/identity.rs
// ============================
//! Connection → display name bindings.
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::AppError;

/// Identifier of one live transport connection
pub type ConnectionId = Uuid;

/// A validated display name.
///
/// Not globally unique: two connections may claim the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Arc<str>);

impl Identity {
    /// Validate `name` against the length bound
    pub fn parse(name: &str, max_len: usize) -> Result<Self, AppError> {
        if name.is_empty() {
            return Err(AppError::InvalidIdentity("username is empty".to_string()));
        }
        let len = name.chars().count();
        if len > max_len {
            return Err(AppError::InvalidIdentity(format!(
                "username is {len} characters, limit is {max_len}"
            )));
        }
        Ok(Self(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Registry of which identity each connection has claimed
#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    bindings: Arc<DashMap<ConnectionId, Identity>>,
    max_name_len: usize,
}

impl IdentityRegistry {
    pub fn new(max_name_len: usize) -> Self {
        Self {
            bindings: Arc::new(DashMap::new()),
            max_name_len,
        }
    }

    /// Bind `name` to `connection`, replacing any previous binding.
    pub fn bind(&self, connection: ConnectionId, name: &str) -> Result<Identity, AppError> {
        let identity = Identity::parse(name, self.max_name_len)?;
        self.bindings.insert(connection, identity.clone());
        Ok(identity)
    }

    /// Identity bound to `connection`
    pub fn resolve(&self, connection: ConnectionId) -> Result<Identity, AppError> {
        self.bindings
            .get(&connection)
            .map(|entry| entry.value().clone())
            .ok_or(AppError::NoIdentityBound)
    }

    /// Drop the binding for a terminated connection
    pub fn unbind(&self, connection: ConnectionId) -> Option<Identity> {
        self.bindings.remove(&connection).map(|(_, identity)| identity)
    }

    pub fn max_name_len(&self) -> usize {
        self.max_name_len
    }

    /// Number of live bindings
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
