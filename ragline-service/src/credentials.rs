//! Provider credential resolution.
//!
//! API keys are never persisted by the service; they are resolved from the
//! environment at call time so rotating a key does not require a restart of
//! in-flight work.

use crate::error::ExtractionError;

/// Resolves provider API keys by name at call time.
pub trait CredentialResolver: Send + Sync {
    /// Returns the credential value, or `None` if unset or empty.
    fn resolve(&self, name: &str) -> Option<String>;

    /// Like [`resolve`](Self::resolve) but fails with a non-retryable error.
    fn require(&self, name: &str) -> Result<String, ExtractionError> {
        self.resolve(name)
            .ok_or_else(|| ExtractionError::MissingCredential {
                name: name.to_string(),
            })
    }
}

/// Reads credentials from process environment variables.
pub struct EnvCredentials;

impl CredentialResolver for EnvCredentials {
    fn resolve(&self, name: &str) -> Option<String> {
        match std::env::var(name) {
            Ok(value) if !value.trim().is_empty() => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;

    /// Fixed-map resolver for tests.
    pub struct MapCredentials(pub HashMap<String, String>);

    impl CredentialResolver for MapCredentials {
        fn resolve(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_reports_missing_credential() {
        let creds = test_support::MapCredentials(Default::default());
        let err = creds.require("NO_SUCH_KEY").unwrap_err();
        assert!(matches!(err, ExtractionError::MissingCredential { name } if name == "NO_SUCH_KEY"));
        assert!(!ExtractionError::MissingCredential {
            name: "NO_SUCH_KEY".into()
        }
        .is_transient());
    }
}
