//! Credential lookup for customer-group logins.

use sha2::{Digest, Sha256};

use crate::error::SessionError;

/// A username/password pair for one customer group's warm-up account.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Capability interface for looking up warm-up account credentials.
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self, customer_group: &str) -> Result<Credentials, SessionError>;
}

/// Derives deterministic usernames from the customer group name and uses
/// one shared, preconfigured password. The warm-up accounts are expected
/// to be provisioned with the same scheme on the storefront side.
#[derive(Debug, Clone)]
pub struct PreconfiguredCredentialsProvider {
    password: String,
    domain: String,
    domain_suffix: String,
}

impl PreconfiguredCredentialsProvider {
    pub const DEFAULT_DOMAIN_SUFFIX: &'static str = ".warmup.invalid";

    pub fn new(password: impl Into<String>, domain: impl Into<String>) -> Self {
        Self::with_domain_suffix(password, domain, Self::DEFAULT_DOMAIN_SUFFIX)
    }

    pub fn with_domain_suffix(
        password: impl Into<String>,
        domain: impl Into<String>,
        domain_suffix: impl Into<String>,
    ) -> Self {
        Self {
            password: password.into(),
            domain: domain.into(),
            domain_suffix: domain_suffix.into(),
        }
    }

    fn username(&self, customer_group: &str) -> String {
        let digest = Sha256::digest(customer_group.as_bytes());
        format!(
            "{}@{}{}",
            &hex::encode(digest)[..32],
            self.domain,
            self.domain_suffix
        )
    }
}

impl CredentialsProvider for PreconfiguredCredentialsProvider {
    fn credentials(&self, customer_group: &str) -> Result<Credentials, SessionError> {
        Ok(Credentials {
            username: self.username(customer_group),
            password: self.password.clone(),
        })
    }
}
