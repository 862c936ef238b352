//! Caller identity passed explicitly into every dispatch operation.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a user (driver, towing service, or admin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for UserId {
    fn from(uuid: Uuid) -> Self {
        UserId(uuid)
    }
}

impl std::ops::Deref for UserId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Driver,
    TowingService,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Driver => "driver",
            Role::TowingService => "towing_service",
            Role::Admin => "admin",
        })
    }
}

/// The authenticated caller of an operation.
///
/// Authentication happens outside this crate; whoever builds an `Actor` vouches for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }

    pub fn driver(id: UserId) -> Self {
        Self::new(id, Role::Driver)
    }

    pub fn towing_service(id: UserId) -> Self {
        Self::new(id, Role::TowingService)
    }

    pub fn admin(id: UserId) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn is_service(&self) -> bool {
        self.role == Role::TowingService
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
