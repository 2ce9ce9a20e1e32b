//! # Access Control
//!
//! The three identity collaborators the query pipeline leans on (token
//! checking, identity resolution, permission lookup) and the single view
//! decision built from them.

pub mod directory;
pub mod tokens;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Who a valid token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub user_id: String,
    /// Service-to-service callers may read any subject.
    pub is_server: bool,
}

#[async_trait::async_trait]
pub trait TokenChecker: Send + Sync {
    /// `None` for unknown, expired, or malformed tokens.
    async fn check(&self, token: &str) -> Option<TokenData>;
}

/// A subject after resolution: the user it names and that user's storage
/// partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSubject {
    pub user_id: String,
    pub storage_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("user '{0}' not found")]
    UnknownUser(String),
    #[error("user '{0}' has no storage partition")]
    NoStorageKey(String),
}

#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a user id or email address.
    async fn resolve(&self, raw: &str) -> Result<ResolvedSubject, ResolveError>;
}

pub type Permissions = BTreeSet<String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("permission lookup unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait PermissionLookup: Send + Sync {
    /// Permissions `caller` holds over `subject`'s data.
    async fn permissions_of(&self, caller: &str, subject: &str)
        -> Result<Permissions, LookupError>;
}

/// Permission names that grant read access.
pub const VIEW_PERMISSIONS: [&str; 2] = ["root", "view"];

/// Why access was granted, or that it wasn't.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Server,
    Owner,
    Granted,
    Denied,
}

impl Access {
    pub fn allowed(self) -> bool {
        !matches!(self, Self::Denied)
    }
}

/// Decide whether `caller` may view `subject_user`'s data.
///
/// Checked in order: server token, same user, explicit `root`/`view` grant.
/// The permission lookup is only consulted when the first two fail, and a
/// lookup failure denies.
pub async fn authorize(
    caller: &TokenData,
    subject_user: &str,
    lookup: &dyn PermissionLookup,
) -> Access {
    if caller.is_server {
        return Access::Server;
    }
    if caller.user_id == subject_user {
        return Access::Owner;
    }
    match lookup.permissions_of(&caller.user_id, subject_user).await {
        Ok(perms) if VIEW_PERMISSIONS.iter().any(|p| perms.contains(*p)) => Access::Granted,
        Ok(perms) => {
            tracing::debug!(
                "{} holds {:?} over {}, no view grant",
                caller.user_id,
                perms,
                subject_user
            );
            Access::Denied
        }
        Err(e) => {
            tracing::warn!("Permission lookup for {} failed: {}", caller.user_id, e);
            Access::Denied
        }
    }
}
