//! Caller identity and write-permission evaluation.
//!
//! The catalog returns, per path, an owner DN, an owning role and three
//! Unix-style permission groups. A caller whose DN matches the owner uses the
//! owner bits when their role also matches, world bits otherwise; any other
//! caller uses group bits when the role matches, world bits otherwise.

use serde::{Deserialize, Serialize};

use crate::error::DmsResult;

/// Permission record the catalog keeps for a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPermissions {
    /// DN of the owner.
    pub owner_dn: String,
    /// Owning role (group).
    pub role: String,
    /// Owner permission bits (0-7).
    pub owner: u8,
    /// Group permission bits (0-7).
    pub group: u8,
    /// World permission bits (0-7).
    pub world: u8,
}

impl PathPermissions {
    /// Build a record from an octal mode such as `0o775`.
    pub fn from_mode(owner_dn: impl Into<String>, role: impl Into<String>, mode: u32) -> Self {
        Self {
            owner_dn: owner_dn.into(),
            role: role.into(),
            owner: ((mode >> 6) & 0o7) as u8,
            group: ((mode >> 3) & 0o7) as u8,
            world: (mode & 0o7) as u8,
        }
    }
}

/// Identity derived from the active credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// User name.
    pub user: String,
    /// DN of the active credential.
    pub dn: String,
    /// Every DN registered for the user.
    pub all_dns: Vec<String>,
    /// Roles carried by the credential, e.g. `/vo/Role=production`.
    pub roles: Vec<String>,
    /// Group selected for the session.
    pub group: String,
}

impl CallerIdentity {
    /// Identity with a single DN and role.
    pub fn new(user: impl Into<String>, dn: impl Into<String>, role: impl Into<String>) -> Self {
        let dn = dn.into();
        let role = role.into();
        Self {
            user: user.into(),
            all_dns: vec![dn.clone()],
            dn,
            group: role.clone(),
            roles: vec![role],
        }
    }

    /// True if any DN of the user is the given DN.
    pub fn has_dn(&self, dn: &str) -> bool {
        self.dn == dn || self.all_dns.iter().any(|d| d == dn)
    }

    /// True if any role of the credential ends with the given role.
    pub fn has_role(&self, role: &str) -> bool {
        !role.is_empty() && self.roles.iter().any(|r| r.ends_with(role))
    }
}

/// Supplies the identity of the caller.
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` when no credential is present (anonymous or local context).
    fn current(&self) -> DmsResult<Option<CallerIdentity>>;
}

/// No credential: every permission check passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousCredentials;

impl CredentialProvider for AnonymousCredentials {
    fn current(&self) -> DmsResult<Option<CallerIdentity>> {
        Ok(None)
    }
}

/// A fixed identity established by the caller.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    identity: CallerIdentity,
}

impl StaticCredentials {
    /// Wrap an identity.
    pub fn new(identity: CallerIdentity) -> Self {
        Self { identity }
    }
}

impl CredentialProvider for StaticCredentials {
    fn current(&self) -> DmsResult<Option<CallerIdentity>> {
        Ok(Some(self.identity.clone()))
    }
}

/// True for permission values that include the write bit (2, 3, 6, 7).
pub fn bits_allow_write(bits: u8) -> bool {
    matches!(bits, 2 | 3 | 6 | 7)
}

/// Select the applicable permission group and test it for write access.
pub fn write_allowed(identity: &CallerIdentity, perms: &PathPermissions) -> bool {
    let role_match = identity.has_role(&perms.role);
    let bits = if identity.has_dn(&perms.owner_dn) {
        if role_match {
            perms.owner
        } else {
            perms.world
        }
    } else if role_match {
        perms.group
    } else {
        perms.world
    };
    bits_allow_write(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "/DC=ch/DC=cern/CN=alice";
    const OTHER: &str = "/DC=uk/DC=ral/CN=bob";

    fn perms(owner: u8, group: u8, world: u8) -> PathPermissions {
        PathPermissions {
            owner_dn: OWNER.to_string(),
            role: "vo_user".to_string(),
            owner,
            group,
            world,
        }
    }

    #[test]
    fn test_bits_allow_write() {
        for bits in [2u8, 3, 6, 7] {
            assert!(bits_allow_write(bits));
        }
        for bits in [0u8, 1, 4, 5] {
            assert!(!bits_allow_write(bits));
        }
    }

    #[test]
    fn test_owner_with_role_uses_owner_bits() {
        let id = CallerIdentity::new("alice", OWNER, "/vo/Role=vo_user");
        assert!(write_allowed(&id, &perms(7, 5, 5)));
        assert!(!write_allowed(&id, &perms(5, 7, 7)));
    }

    #[test]
    fn test_owner_without_role_uses_world_bits() {
        let id = CallerIdentity::new("alice", OWNER, "/vo/Role=production");
        assert!(!write_allowed(&id, &perms(7, 7, 5)));
        assert!(write_allowed(&id, &perms(5, 5, 6)));
    }

    #[test]
    fn test_non_owner_with_role_uses_group_bits() {
        let id = CallerIdentity::new("bob", OTHER, "/vo/Role=vo_user");
        assert!(write_allowed(&id, &perms(5, 7, 5)));
        assert!(!write_allowed(&id, &perms(7, 5, 7)));
    }

    #[test]
    fn test_non_owner_without_role_uses_world_bits() {
        let id = CallerIdentity::new("bob", OTHER, "/vo/Role=guest");
        assert!(!write_allowed(&id, &perms(7, 7, 5)));
        assert!(write_allowed(&id, &perms(5, 5, 3)));
    }

    #[test]
    fn test_alternate_dn_counts_as_owner() {
        let mut id = CallerIdentity::new("alice", OTHER, "/vo/Role=vo_user");
        id.all_dns.push(OWNER.to_string());
        assert!(write_allowed(&id, &perms(7, 0, 0)));
    }

    #[test]
    fn test_from_mode() {
        let p = PathPermissions::from_mode(OWNER, "vo_user", 0o754);
        assert_eq!((p.owner, p.group, p.world), (7, 5, 4));
    }

    #[test]
    fn test_anonymous_has_no_identity() {
        assert!(AnonymousCredentials.current().unwrap().is_none());
        let id = CallerIdentity::new("alice", OWNER, "vo_user");
        let provider = StaticCredentials::new(id.clone());
        assert_eq!(provider.current().unwrap(), Some(id));
    }
}
