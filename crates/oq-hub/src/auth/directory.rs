//! # User Directory
//!
//! Config-backed identity resolution and permission lookup. Users are
//! addressable by id or by any of their email addresses.

use serde::Deserialize;

use super::{
    IdentityResolver, LookupError, PermissionLookup, Permissions, ResolveError, ResolvedSubject,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub grants: Vec<GrantEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub id: String,
    #[serde(default)]
    pub emails: Vec<String>,
    /// Storage partition holding the user's records.
    pub storage_key: Option<String>,
}

/// `user` holds `permissions` over `group`'s data.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantEntry {
    pub user: String,
    pub group: String,
    pub permissions: Vec<String>,
}

pub struct Directory {
    users: Vec<UserEntry>,
    grants: Vec<GrantEntry>,
}

impl Directory {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            users: config.users,
            grants: config.grants,
        }
    }

    fn find(&self, raw: &str) -> Option<&UserEntry> {
        self.users.iter().find(|u| {
            u.id == raw || u.emails.iter().any(|e| e.eq_ignore_ascii_case(raw))
        })
    }
}

#[async_trait::async_trait]
impl IdentityResolver for Directory {
    async fn resolve(&self, raw: &str) -> Result<ResolvedSubject, ResolveError> {
        let user = self
            .find(raw)
            .ok_or_else(|| ResolveError::UnknownUser(raw.to_string()))?;
        let storage_key = user
            .storage_key
            .clone()
            .ok_or_else(|| ResolveError::NoStorageKey(user.id.clone()))?;
        Ok(ResolvedSubject {
            user_id: user.id.clone(),
            storage_key,
        })
    }
}

#[async_trait::async_trait]
impl PermissionLookup for Directory {
    async fn permissions_of(
        &self,
        caller: &str,
        subject: &str,
    ) -> Result<Permissions, LookupError> {
        Ok(self
            .grants
            .iter()
            .filter(|g| g.user == caller && g.group == subject)
            .flat_map(|g| g.permissions.iter().cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> Directory {
        Directory::new(DirectoryConfig {
            users: vec![
                UserEntry {
                    id: "u1".into(),
                    emails: vec!["Foo@Bar.org".into()],
                    storage_key: Some("pair-u1".into()),
                },
                UserEntry {
                    id: "u2".into(),
                    emails: vec![],
                    storage_key: None,
                },
            ],
            grants: vec![
                GrantEntry {
                    user: "care".into(),
                    group: "u1".into(),
                    permissions: vec!["view".into()],
                },
                GrantEntry {
                    user: "care".into(),
                    group: "u1".into(),
                    permissions: vec!["note".into()],
                },
            ],
        })
    }

    #[tokio::test]
    async fn test_resolve_by_id_and_email() {
        let dir = directory();
        let by_id = dir.resolve("u1").await.unwrap();
        let by_email = dir.resolve("foo@bar.org").await.unwrap();
        assert_eq!(by_id, by_email);
        assert_eq!(by_id.storage_key, "pair-u1");
    }

    #[tokio::test]
    async fn test_resolve_failures() {
        let dir = directory();
        assert_eq!(
            dir.resolve("nobody").await,
            Err(ResolveError::UnknownUser("nobody".into()))
        );
        assert_eq!(
            dir.resolve("u2").await,
            Err(ResolveError::NoStorageKey("u2".into()))
        );
    }

    #[tokio::test]
    async fn test_grants_are_merged() {
        let perms = directory().permissions_of("care", "u1").await.unwrap();
        assert!(perms.contains("view"));
        assert!(perms.contains("note"));
        assert!(directory()
            .permissions_of("care", "u2")
            .await
            .unwrap()
            .is_empty());
    }
}
