use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    DirectManager,
    Accountant,
    FinalManager,
    Admin,
}

impl Role {
    pub const ALL: [Role; 5] =
        [Role::User, Role::DirectManager, Role::Accountant, Role::FinalManager, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::DirectManager => "DIRECT_MANAGER",
            Self::Accountant => "ACCOUNTANT",
            Self::FinalManager => "FINAL_MANAGER",
            Self::Admin => "ADMIN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "USER" => Some(Self::User),
            "DIRECT_MANAGER" | "DM" => Some(Self::DirectManager),
            "ACCOUNTANT" => Some(Self::Accountant),
            "FINAL_MANAGER" => Some(Self::FinalManager),
            "ADMIN" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity an operation is performed as. Always passed explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub manager_id: Option<UserId>,
    pub active: bool,
}

impl User {
    pub fn actor(&self) -> Actor {
        Actor { id: self.id, role: self.role }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub manager_id: Option<UserId>,
}

#[cfg(test)]
mod tests {
    use super::Role;

    #[test]
    fn role_parse_accepts_wire_and_short_forms() {
        assert_eq!(Role::parse("direct_manager"), Some(Role::DirectManager));
        assert_eq!(Role::parse("DM"), Some(Role::DirectManager));
        assert_eq!(Role::parse("final-manager"), Some(Role::FinalManager));
        assert_eq!(Role::parse("auditor"), None);
    }

    #[test]
    fn role_serializes_in_screaming_case() {
        let json = serde_json::to_string(&Role::FinalManager).expect("serialize role");
        assert_eq!(json, "\"FINAL_MANAGER\"");
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
    }
}
