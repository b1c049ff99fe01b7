use serde_json::json;

use crate::commands::{prepare, CommandResult};
use procura_db::{connect, migrations, DemoDirectory, SqlUserRepository};

pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("seed") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool =
            connect(&config.database).await.map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let users = SqlUserRepository::new(pool.clone());
        let seeded = DemoDirectory::seed(&users)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
        let verification = DemoDirectory::verify(&users)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        pool.close().await;

        if !verification.all_present {
            let failed = verification
                .checks
                .iter()
                .filter_map(|(check, passed)| (!passed).then_some(*check))
                .collect::<Vec<_>>();
            return Err(("seed_verification", verification_message(&failed), 6u8));
        }
        Ok::<_, (&'static str, String, u8)>(seeded)
    });

    match result {
        Ok(seeded) => {
            let users = seeded
                .seeded
                .iter()
                .map(|user| json!({ "id": user.id, "username": user.username, "role": user.role }))
                .collect::<Vec<_>>();
            let message = format!(
                "demo directory ready: {} user(s) added, {} already present",
                seeded.seeded.len(),
                seeded.skipped.len()
            );
            CommandResult::success_with(
                "seed",
                message,
                Some(json!({ "seeded": users, "skipped": seeded.skipped })),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "some demo users failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_message;

    #[test]
    fn verification_message_names_failed_checks() {
        assert_eq!(
            verification_message(&["alex", "uma-reports-to-dana"]),
            "seed verification failed for checks: alex, uma-reports-to-dana"
        );
    }

    #[test]
    fn verification_message_falls_back_to_generic_text() {
        assert_eq!(verification_message(&[]), "some demo users failed to load");
    }
}
