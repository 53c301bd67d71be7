use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::CoreError;

/// Role asserted by the identity provider for the caller of an API operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Guest,
    Customer,
    Courier,
    Admin,
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GUEST" => Ok(Role::Guest),
            "CUSTOMER" => Ok(Role::Customer),
            "COURIER" => Ok(Role::Courier),
            "ADMIN" | "SUPER_ADMIN" => Ok(Role::Admin),
            other => Err(CoreError::IdentityError(format!("unknown role: {}", other))),
        }
    }
}

/// Who is calling and in what capacity. Guests have no subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub subject: Option<String>,
    pub role: Role,
}

impl Caller {
    pub fn guest() -> Self {
        Self { subject: None, role: Role::Guest }
    }

    pub fn new(subject: impl Into<String>, role: Role) -> Self {
        Self {
            subject: Some(subject.into()),
            role,
        }
    }

    pub fn customer(subject: impl Into<String>) -> Self {
        Self::new(subject, Role::Customer)
    }

    pub fn courier(subject: impl Into<String>) -> Self {
        Self::new(subject, Role::Courier)
    }

    pub fn admin(subject: impl Into<String>) -> Self {
        Self::new(subject, Role::Admin)
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_guest(&self) -> bool {
        self.role == Role::Guest || self.subject.is_none()
    }
}
