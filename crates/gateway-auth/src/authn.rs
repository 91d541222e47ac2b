use std::collections::HashSet;

use dashmap::DashMap;
use gateway_core::{now_millis, AuthMode, GatewayError};

/// A resolved identity with a flat permission set. `"*"` grants everything;
/// anything else is matched exactly, so callers name capabilities
/// (`"templates:write"`, `"services:start"`) rather than encode a hierarchy.
#[derive(Clone, Debug)]
pub struct Principal {
    pub subject: String,
    pub permissions: HashSet<String>,
}

impl Principal {
    pub fn full(subject: impl Into<String>) -> Self {
        let mut permissions = HashSet::new();
        permissions.insert("*".to_string());
        Self {
            subject: subject.into(),
            permissions,
        }
    }

    pub fn scoped(subject: impl Into<String>, permissions: impl IntoIterator<Item = String>) -> Self {
        Self {
            subject: subject.into(),
            permissions: permissions.into_iter().collect(),
        }
    }

    pub fn has_permission(&self, required: &str) -> bool {
        self.permissions.contains("*") || self.permissions.contains(required)
    }
}

/// What `gateway-http` extracted from an inbound request, per §6's header
/// conventions (`Authorization: Bearer`, `X-Api-Key`, `X-Api-Token`,
/// `ApiKey`) plus the trusted-local special case.
#[derive(Clone, Debug)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
    /// The request arrived over a loopback address. Only honored when the
    /// gateway is running in [`AuthMode::LocalTrusted`].
    Loopback,
}

struct CredentialRecord {
    principal: Principal,
    expires_at: Option<u64>,
}

/// Resolves a [`Credential`] to a [`Principal`]. Known secrets are
/// registered explicitly via [`Authenticator::register`]; anything else is
/// `Unauthorized`.
pub struct Authenticator {
    mode: AuthMode,
    credentials: DashMap<String, CredentialRecord>,
}

impl Authenticator {
    pub fn new(mode: AuthMode) -> Self {
        Self {
            mode,
            credentials: DashMap::new(),
        }
    }

    /// Registers `secret` (a bearer token or API key value) as authenticating
    /// `principal`. `ttl_ms` of `None` means the credential never expires.
    pub fn register(&self, secret: impl Into<String>, principal: Principal, ttl_ms: Option<u64>) {
        let expires_at = ttl_ms.map(|ttl| now_millis() + ttl);
        self.credentials
            .insert(secret.into(), CredentialRecord { principal, expires_at });
    }

    pub fn revoke(&self, secret: &str) {
        self.credentials.remove(secret);
    }

    pub fn authenticate(&self, credential: Credential) -> Result<Principal, GatewayError> {
        match credential {
            Credential::Loopback => {
                if self.mode == AuthMode::LocalTrusted {
                    Ok(Principal::full("trusted-local"))
                } else {
                    Err(GatewayError::Unauthorized {
                        reason: "trusted-local mode is not enabled".to_string(),
                    })
                }
            }
            Credential::Bearer(token) => self.lookup(&token),
            Credential::ApiKey(key) => self.lookup(&key),
        }
    }

    fn lookup(&self, secret: &str) -> Result<Principal, GatewayError> {
        let record = self.credentials.get(secret).ok_or_else(|| GatewayError::Unauthorized {
            reason: "unknown credential".to_string(),
        })?;

        if let Some(expires_at) = record.expires_at {
            if now_millis() >= expires_at {
                drop(record);
                self.credentials.remove(secret);
                return Err(GatewayError::Unauthorized {
                    reason: "credential expired".to_string(),
                });
            }
        }

        Ok(record.principal.clone())
    }
}
