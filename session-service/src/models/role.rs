//! Platform roles and the permissions each one carries.
//!
//! Both enumerations are closed. Role names arriving from an external identity
//! provider go through [`Role::from_provider_claim`], which is total: anything
//! it does not recognise resolves to [`Role::LEAST_PRIVILEGED`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    TechTransferOfficer,
    Researcher,
    Industry,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "technology:read")]
    TechnologyRead,
    #[serde(rename = "technology:create")]
    TechnologyCreate,
    #[serde(rename = "technology:update")]
    TechnologyUpdate,
    #[serde(rename = "technology:delete")]
    TechnologyDelete,
    #[serde(rename = "grant:read")]
    GrantRead,
    #[serde(rename = "grant:apply")]
    GrantApply,
    #[serde(rename = "grant:manage")]
    GrantManage,
    #[serde(rename = "message:read")]
    MessageRead,
    #[serde(rename = "message:send")]
    MessageSend,
    #[serde(rename = "user:manage")]
    UserManage,
    #[serde(rename = "analytics:view")]
    AnalyticsView,
}

/// How a provider role claim was turned into a [`Role`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleResolution {
    Mapped,
    MissingClaim,
    UnknownClaim(String),
}

impl RoleResolution {
    pub fn is_default(&self) -> bool {
        !matches!(self, RoleResolution::Mapped)
    }
}

impl Role {
    pub const LEAST_PRIVILEGED: Role = Role::Viewer;

    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::TechTransferOfficer,
        Role::Researcher,
        Role::Industry,
        Role::Viewer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::TechTransferOfficer => "tech_transfer_officer",
            Role::Researcher => "researcher",
            Role::Industry => "industry",
            Role::Viewer => "viewer",
        }
    }

    /// Map an identity-provider role claim onto a platform role.
    pub fn from_provider_claim(claim: Option<&str>) -> (Role, RoleResolution) {
        let Some(raw) = claim.map(str::trim).filter(|c| !c.is_empty()) else {
            return (Role::LEAST_PRIVILEGED, RoleResolution::MissingClaim);
        };

        let role = match raw.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "admin" | "administrator" => Some(Role::Admin),
            "tech_transfer_officer" | "tto" | "licensing_officer" => {
                Some(Role::TechTransferOfficer)
            }
            "researcher" | "inventor" | "faculty" => Some(Role::Researcher),
            "industry" | "company" | "industry_partner" => Some(Role::Industry),
            "viewer" | "guest" | "public" => Some(Role::Viewer),
            _ => None,
        };

        match role {
            Some(role) => (role, RoleResolution::Mapped),
            None => (
                Role::LEAST_PRIVILEGED,
                RoleResolution::UnknownClaim(raw.to_string()),
            ),
        }
    }

    /// The permission set granted to a role at token issuance.
    pub fn default_permissions(&self) -> BTreeSet<Permission> {
        use Permission::*;

        let perms: &[Permission] = match self {
            Role::Admin => &[
                TechnologyRead,
                TechnologyCreate,
                TechnologyUpdate,
                TechnologyDelete,
                GrantRead,
                GrantApply,
                GrantManage,
                MessageRead,
                MessageSend,
                UserManage,
                AnalyticsView,
            ],
            Role::TechTransferOfficer => &[
                TechnologyRead,
                TechnologyCreate,
                TechnologyUpdate,
                GrantRead,
                GrantManage,
                MessageRead,
                MessageSend,
                AnalyticsView,
            ],
            Role::Researcher => &[
                TechnologyRead,
                TechnologyCreate,
                TechnologyUpdate,
                GrantRead,
                GrantApply,
                MessageRead,
                MessageSend,
            ],
            Role::Industry => &[TechnologyRead, GrantRead, MessageRead, MessageSend],
            Role::Viewer => &[TechnologyRead, GrantRead],
        };

        perms.iter().copied().collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("Invalid role: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_claims_map_exactly() {
        assert_eq!(
            Role::from_provider_claim(Some("TTO")),
            (Role::TechTransferOfficer, RoleResolution::Mapped)
        );
        assert_eq!(
            Role::from_provider_claim(Some("industry-partner")),
            (Role::Industry, RoleResolution::Mapped)
        );
        assert_eq!(
            Role::from_provider_claim(Some(" Administrator ")),
            (Role::Admin, RoleResolution::Mapped)
        );
    }

    #[test]
    fn unknown_claim_defaults_to_least_privileged() {
        let (role, resolution) = Role::from_provider_claim(Some("superuser"));
        assert_eq!(role, Role::Viewer);
        assert_eq!(
            resolution,
            RoleResolution::UnknownClaim("superuser".to_string())
        );
        assert!(resolution.is_default());
    }

    #[test]
    fn missing_claim_defaults_to_least_privileged() {
        assert_eq!(
            Role::from_provider_claim(None),
            (Role::Viewer, RoleResolution::MissingClaim)
        );
        assert_eq!(
            Role::from_provider_claim(Some("   ")),
            (Role::Viewer, RoleResolution::MissingClaim)
        );
    }

    #[test]
    fn least_privileged_role_has_smallest_permission_set() {
        let viewer = Role::LEAST_PRIVILEGED.default_permissions();
        for role in Role::ALL {
            assert!(viewer.is_subset(&role.default_permissions()), "{role}");
        }
    }

    #[test]
    fn only_admin_manages_users() {
        for role in Role::ALL {
            let has = role.default_permissions().contains(&Permission::UserManage);
            assert_eq!(has, role == Role::Admin, "{role}");
        }
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
        }
    }

    #[test]
    fn permission_serializes_with_scope_syntax() {
        let json = serde_json::to_string(&Permission::GrantApply).expect("serializes");
        assert_eq!(json, "\"grant:apply\"");
    }
}
