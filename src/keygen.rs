//! Key material generation for a fresh deployment
//!
//! Produces a ready-to-paste `.env` block with a signing secret, an encryption
//! key, and a bcrypt hash of the administrator password.

use std::io::{self, BufRead};

use secrecy::{ExposeSecret, SecretString};

use crate::config::generate_secret;
use crate::errors::{AppError, AppResult};

/// Read the admin password, prompting twice on a TTY or once from stdin
pub fn read_admin_password(from_stdin: bool) -> AppResult<SecretString> {
    let password = if from_stdin {
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| AppError::Internal(format!("failed to read stdin: {e}")))?;
        line.trim_end_matches(['\r', '\n']).to_owned()
    } else {
        let first = prompt("Admin password: ")?;
        let confirm = prompt("Confirm admin password: ")?;
        if first != confirm {
            return Err(AppError::invalid("passwords do not match"));
        }
        first
    };

    if password.is_empty() {
        return Err(AppError::invalid("admin password must not be empty"));
    }
    Ok(SecretString::new(password.into()))
}

fn prompt(label: &str) -> AppResult<String> {
    rpassword::prompt_password(label)
        .map_err(|e| AppError::Internal(format!("failed to read password: {e}")))
}

/// Hash the admin password with bcrypt at `cost`
pub fn hash_admin_password(password: &SecretString, cost: u32) -> AppResult<String> {
    bcrypt::hash(password.expose_secret(), cost)
        .map_err(|e| AppError::Internal(format!("bcrypt hashing failed: {e}")))
}

/// Render the `.env` block for the generated values
pub fn render_env_block(password_hash: &str) -> String {
    let jwt_secret = generate_secret();
    let encryption_key = generate_secret();
    format!(
        "# mail-smtp-mcp-rs environment\n\
         # Keep this file out of version control.\n\
         \n\
         JWT_SECRET_KEY={jwt_secret}\n\
         ENCRYPTION_KEY={encryption_key}\n\
         ADMIN_PASSWORD_HASH='{password_hash}'\n\
         \n\
         REQUIRE_HTTPS=true\n\
         RATE_LIMIT_PER_HOUR=10\n"
    )
}

/// Run the `keygen` subcommand
pub fn run(password_stdin: bool) -> AppResult<()> {
    let password = read_admin_password(password_stdin)?;
    let hash = hash_admin_password(&password, bcrypt::DEFAULT_COST)?;
    print!("{}", render_env_block(&hash));
    Ok(())
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{hash_admin_password, render_env_block};
    use crate::cipher::CipherService;

    #[test]
    fn generated_block_is_loadable() {
        let hash = hash_admin_password(&SecretString::new("hunter22".into()), 4).expect("hash");
        assert!(bcrypt::verify("hunter22", &hash).expect("verify"));

        let block = render_env_block(&hash);
        let value = |key: &str| {
            block
                .lines()
                .find_map(|l| l.strip_prefix(&format!("{key}=")).map(str::to_owned))
                .expect("key present")
        };

        // single quotes keep dotenvy from expanding the `$` segments
        assert_eq!(value("ADMIN_PASSWORD_HASH"), format!("'{hash}'"));
        assert_eq!(value("REQUIRE_HTTPS"), "true");
        let key = SecretString::new(value("ENCRYPTION_KEY").into());
        CipherService::from_encoded_key(&key).expect("encryption key must be usable");
        assert_ne!(value("JWT_SECRET_KEY"), value("ENCRYPTION_KEY"));
    }
}
