use procura_core::domain::user::{NewUser, Role, User};

use crate::repositories::{RepositoryError, UserRepository};

/// One pooled holder per approval role, a second direct manager for race
/// drills, and an employee reporting to the first manager.
const DEMO_USERS: &[DemoUserContract] = &[
    DemoUserContract {
        username: "admin",
        display_name: "Ada Admin",
        role: Role::Admin,
        manager: None,
    },
    DemoUserContract {
        username: "dana",
        display_name: "Dana Direct",
        role: Role::DirectManager,
        manager: None,
    },
    DemoUserContract {
        username: "drew",
        display_name: "Drew Direct",
        role: Role::DirectManager,
        manager: None,
    },
    DemoUserContract {
        username: "alex",
        display_name: "Alex Accounts",
        role: Role::Accountant,
        manager: None,
    },
    DemoUserContract {
        username: "fiona",
        display_name: "Fiona Final",
        role: Role::FinalManager,
        manager: None,
    },
    DemoUserContract {
        username: "uma",
        display_name: "Uma User",
        role: Role::User,
        manager: Some("dana"),
    },
];

/// Deterministic directory of demo users for local runs and end-to-end tests.
pub struct DemoDirectory;

impl DemoDirectory {
    /// Inserts every missing demo user. Existing usernames are left alone, so
    /// seeding twice is harmless.
    pub async fn seed(users: &dyn UserRepository) -> Result<SeedResult, RepositoryError> {
        let mut seeded = Vec::new();
        let mut skipped = Vec::new();

        for contract in DEMO_USERS {
            if users.find_by_username(contract.username).await?.is_some() {
                skipped.push(contract.username);
                continue;
            }

            let manager_id = match contract.manager {
                Some(manager) => Some(
                    users
                        .find_by_username(manager)
                        .await?
                        .ok_or_else(|| RepositoryError::NotFound(format!("manager `{manager}`")))?
                        .id,
                ),
                None => None,
            };

            let user = users
                .insert(NewUser {
                    username: contract.username.to_string(),
                    display_name: contract.display_name.to_string(),
                    role: contract.role,
                    manager_id,
                })
                .await?;
            seeded.push(user);
        }

        Ok(SeedResult { seeded, skipped })
    }

    /// Checks that each demo user exists with the expected role and manager.
    pub async fn verify(users: &dyn UserRepository) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for contract in DEMO_USERS {
            let found = users.find_by_username(contract.username).await?;
            let role_ok = found.as_ref().map(|user| user.role == contract.role).unwrap_or(false);
            checks.push((contract.username, role_ok));

            if let (Some(user), Some(manager)) = (found.as_ref(), contract.manager) {
                let expected = users.find_by_username(manager).await?.map(|m| m.id);
                checks.push((contract.manager_label(), user.manager_id == expected));
            }
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    pub fn usernames() -> impl Iterator<Item = &'static str> {
        DEMO_USERS.iter().map(|contract| contract.username)
    }
}

#[derive(Debug, Clone, Copy)]
struct DemoUserContract {
    username: &'static str,
    display_name: &'static str,
    role: Role,
    manager: Option<&'static str>,
}

impl DemoUserContract {
    fn manager_label(&self) -> &'static str {
        match self.username {
            "uma" => "uma-reports-to-dana",
            _ => "manager-link",
        }
    }
}

#[derive(Debug)]
pub struct SeedResult {
    pub seeded: Vec<User>,
    pub skipped: Vec<&'static str>,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
