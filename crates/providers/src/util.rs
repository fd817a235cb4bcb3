//! Shared helpers for provider adapters.

use sb_domain::config::AuthConfig;
use sb_domain::error::{Error, Result};

/// Map a [`reqwest::Error`] onto the domain error, keeping timeouts distinct.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve the API key for a provider.
///
/// Order: plaintext `key` (logged as a warning), OS keychain entry for
/// `service` + `account`, then the `env` variable.
pub fn resolve_api_key(auth: &AuthConfig) -> Result<String> {
    if let Some(key) = auth.key.as_ref().filter(|k| !k.is_empty()) {
        tracing::warn!("API key read from plaintext config; prefer `env` or the keychain");
        return Ok(key.clone());
    }

    if let (Some(service), Some(account)) = (&auth.service, &auth.account) {
        match read_keychain(service, account) {
            Ok(secret) => return Ok(secret),
            Err(e) => tracing::warn!(
                service = %service,
                account = %account,
                error = %e,
                "keychain lookup failed"
            ),
        }
    }

    if let Some(var) = &auth.env {
        return std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Auth(format!("environment variable '{var}' is not set")));
    }

    Err(Error::Auth(
        "no API key configured (set auth.key, auth.env, or auth.service + auth.account)".into(),
    ))
}

fn read_keychain(service: &str, account: &str) -> Result<String> {
    keyring::Entry::new(service, account)
        .and_then(|entry| entry.get_password())
        .map_err(|e| Error::Auth(format!("keychain {service}/{account}: {e}")))
}
