use secrecy::SecretString;

use crate::{audit, ratelimit::LockoutPolicy};

/// Configuration shared across the server, built once at startup.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    /// Installation master secret; validated by
    /// [`crate::crypto::MasterKey::from_secret`] before serving.
    pub master_secret: SecretString,
    /// Issuer shown in authenticator apps (otpauth URI).
    pub issuer: String,
    pub lockout: LockoutPolicy,
    /// Audit-event retention horizon.
    pub retention: std::time::Duration,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(master_secret: SecretString, issuer: String) -> Self {
        Self {
            master_secret,
            issuer,
            lockout: LockoutPolicy::default(),
            retention: audit::DEFAULT_RETENTION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_global_args() {
        let args = GlobalArgs::new(SecretString::from("secret"), "Tessera".to_string());
        assert_eq!(args.master_secret.expose_secret(), "secret");
        assert_eq!(args.issuer, "Tessera");
        assert_eq!(args.lockout.max_failures, 5);
        assert_eq!(args.retention, audit::DEFAULT_RETENTION);
    }

    #[test]
    fn debug_redacts_master_secret() {
        let args = GlobalArgs::new(
            SecretString::from("super-secret-value"),
            "Tessera".to_string(),
        );
        let rendered = format!("{args:?}");
        assert!(!rendered.contains("super-secret-value"));
    }
}
