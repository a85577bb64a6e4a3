//! Federated login through third-party OAuth2 providers.
//!
//! Providers are built once at startup into an [`OAuthRegistry`] and handed to
//! the auth use case; nothing here is global.

pub mod provider;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::OAuthConfig;

pub use provider::HttpOAuthProvider;

/// Structured provider failure forwarded to clients as `{code, message}`.
/// Messages never carry client secrets or provider tokens.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{code}: {message}")]
pub struct OAuthError {
    code: &'static str,
    pub message: String,
}

impl OAuthError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn provider_not_configured(provider: &str) -> Self {
        Self::new(
            "PROVIDER_NOT_CONFIGURED",
            format!("OAuth provider '{}' is not configured", provider),
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("INVALID_REQUEST", message)
    }

    pub fn exchange_failed(message: impl Into<String>) -> Self {
        Self::new("CODE_EXCHANGE_FAILED", message)
    }

    pub fn profile_failed(message: impl Into<String>) -> Self {
        Self::new("PROFILE_FETCH_FAILED", message)
    }

    pub fn email_required(provider: &str) -> Self {
        Self::new(
            "EMAIL_REQUIRED",
            format!("OAuth provider '{}' did not return an email address", provider),
        )
    }
}

/// Token material returned by a provider's token endpoint.
#[derive(Debug, Clone)]
pub struct ProviderToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// Identity reported by a provider's userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderProfile {
    pub provider_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn name(&self) -> &str;

    fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, OAuthError>;

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderToken, OAuthError>;

    async fn fetch_profile(&self, token: &ProviderToken) -> Result<ProviderProfile, OAuthError>;
}

#[derive(Clone, Default)]
pub struct OAuthRegistry {
    providers: HashMap<String, Arc<dyn OAuthProvider>>,
}

impl OAuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &OAuthConfig) -> Result<Self, OAuthError> {
        let mut registry = Self::new();
        for provider_config in &config.providers {
            let provider = HttpOAuthProvider::from_config(provider_config)?;
            registry.register(Arc::new(provider));
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn OAuthProvider>) {
        self.providers
            .insert(provider.name().to_lowercase(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn OAuthProvider>, OAuthError> {
        self.providers
            .get(&name.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| OAuthError::provider_not_configured(name))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthProviderConfig;

    #[test]
    fn test_registry_from_config() {
        let config = OAuthConfig {
            providers: vec![OAuthProviderConfig {
                name: "github".to_string(),
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                auth_url: None,
                token_url: None,
                userinfo_url: None,
                scopes: None,
            }],
            state_ttl_secs: 600,
        };

        let registry = OAuthRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["github"]);
        assert!(registry.get("GitHub").is_ok());
    }

    #[test]
    fn test_unknown_provider_is_structured_error() {
        let registry = OAuthRegistry::new();
        let err = registry.get("google").err().unwrap();
        assert_eq!(err.code(), "PROVIDER_NOT_CONFIGURED");
        assert!(err.message.contains("google"));
    }
}
