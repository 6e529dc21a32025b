use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Roles known to the platform. Identity itself lives in a separate service;
/// the JWT carries the role and we trust it after signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Driver,
    Admin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }

    pub fn is_driver(self) -> bool {
        self == Role::Driver
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub phone: Option<String>,
    pub exp: usize,
}

/// The authenticated caller, decoded once at the middleware boundary and
/// carried through request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub role: Role,
    pub phone: Option<String>,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        AuthUser {
            id: claims.sub,
            role: claims.role,
            phone: claims.phone,
        }
    }
}
