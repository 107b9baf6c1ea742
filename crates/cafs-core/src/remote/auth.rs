use std::env;

use anyhow::{bail, Result};

/// Pluggable credential source keyed by registry host.
pub trait Authenticator: Send + Sync {
    /// Return `(username, password)` for the registry, or `None` for
    /// anonymous access.
    fn authenticate(&self, registry: &str) -> Result<Option<(String, String)>>;
}

/// Default authenticator: reads `CAFS_REGISTRY_USERNAME` and
/// `CAFS_REGISTRY_PASSWORD`, anonymous when both are unset.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvAuthenticator;

impl Authenticator for EnvAuthenticator {
    fn authenticate(&self, _registry: &str) -> Result<Option<(String, String)>> {
        let username = env::var("CAFS_REGISTRY_USERNAME").unwrap_or_default();
        let password = env::var("CAFS_REGISTRY_PASSWORD").unwrap_or_default();
        if username.is_empty() && password.is_empty() {
            return Ok(None);
        }
        if username.is_empty() || password.is_empty() {
            bail!("registry credentials incomplete: set both CAFS_REGISTRY_USERNAME and CAFS_REGISTRY_PASSWORD");
        }
        Ok(Some((username, password)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let previous = env::var(key).ok();
            match value {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }

    #[test]
    #[serial]
    fn anonymous_when_no_credentials_are_set() {
        let _user = EnvGuard::set("CAFS_REGISTRY_USERNAME", None);
        let _pass = EnvGuard::set("CAFS_REGISTRY_PASSWORD", None);
        assert_eq!(EnvAuthenticator.authenticate("ttl.sh").unwrap(), None);
    }

    #[test]
    #[serial]
    fn basic_credentials_from_env() {
        let _user = EnvGuard::set("CAFS_REGISTRY_USERNAME", Some("robot"));
        let _pass = EnvGuard::set("CAFS_REGISTRY_PASSWORD", Some("hunter2"));
        assert_eq!(
            EnvAuthenticator.authenticate("ttl.sh").unwrap(),
            Some(("robot".to_string(), "hunter2".to_string()))
        );
    }

    #[test]
    #[serial]
    fn half_configured_credentials_fail() {
        let _user = EnvGuard::set("CAFS_REGISTRY_USERNAME", Some("robot"));
        let _pass = EnvGuard::set("CAFS_REGISTRY_PASSWORD", None);
        assert!(EnvAuthenticator.authenticate("ttl.sh").is_err());
    }
}
