//! Authenticated actors.
//!
//! Within a request an [`Actor`] is produced only by [`ActorResolver`], which checks the bearer
//! token and then re-reads the account on every request.

pub mod resolver;
pub mod token;

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use resolver::{extract_bearer_token, ActorResolver};
pub use token::{Claims, JwtVerifier, TokenError, TokenVerifier};

/// Closed set of roles an actor can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Patient,
    Doctor,
    #[serde(rename = "hrRecruiter", alias = "recruiter")]
    Recruiter,
    SystemAdmin,
    Member,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Patient,
        Role::Doctor,
        Role::Recruiter,
        Role::SystemAdmin,
        Role::Member,
    ];

    /// Wire name as carried in tokens and audit rows
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Recruiter => "hrRecruiter",
            Role::SystemAdmin => "systemAdmin",
            Role::Member => "member",
        }
    }

    /// Account table holding actors of this role
    pub fn account_table(&self) -> &'static str {
        match self {
            Role::Patient => "patients",
            Role::Doctor => "doctors",
            Role::Recruiter => "hr_recruiters",
            Role::SystemAdmin => "system_admins",
            Role::Member => "members",
        }
    }

    /// Whether the account table carries an `is_active` flag next to `deleted_at`
    pub fn has_active_flag(&self) -> bool {
        match self {
            Role::Patient => false,
            Role::Doctor | Role::Recruiter | Role::SystemAdmin | Role::Member => true,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::SystemAdmin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            "hrRecruiter" | "recruiter" => Ok(Role::Recruiter),
            "systemAdmin" => Ok(Role::SystemAdmin),
            "member" => Ok(Role::Member),
            other => Err(TokenError::UnknownRole(other.to_string())),
        }
    }
}

/// A proven, currently active identity making a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Uuid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActorSpecError {
    #[error("expected ROLE:UUID, got '{0}'")]
    Malformed(String),

    #[error(transparent)]
    Role(#[from] TokenError),

    #[error("invalid account id: {0}")]
    Id(#[from] uuid::Error),
}

/// `role:uuid`, e.g. `hrRecruiter:6f1c...`; used to seed accounts from the CLI
impl FromStr for Actor {
    type Err = ActorSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, id) = s
            .split_once(':')
            .ok_or_else(|| ActorSpecError::Malformed(s.to_string()))?;
        Ok(Actor::new(Uuid::parse_str(id.trim())?, role.trim().parse()?))
    }
}
