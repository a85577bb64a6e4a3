//! Authorization-code flow against HTTP OAuth2 providers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::{OAuthError, OAuthProvider, ProviderProfile, ProviderToken};
use crate::config::OAuthProviderConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("portcullis/", env!("CARGO_PKG_VERSION"));

/// How a provider's userinfo payload maps onto [`ProviderProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileFormat {
    /// Standard OpenID Connect claims (`sub`, `email`, `email_verified`, ...).
    Oidc,
    GitHub,
    GitLab,
    Microsoft,
}

struct Preset {
    auth_url: &'static str,
    token_url: &'static str,
    userinfo_url: &'static str,
    scopes: &'static [&'static str],
    format: ProfileFormat,
}

fn preset(name: &str) -> Option<Preset> {
    match name {
        "google" => Some(Preset {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
            token_url: "https://oauth2.googleapis.com/token",
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
            scopes: &["openid", "email", "profile"],
            format: ProfileFormat::Oidc,
        }),
        "github" => Some(Preset {
            auth_url: "https://github.com/login/oauth/authorize",
            token_url: "https://github.com/login/oauth/access_token",
            userinfo_url: "https://api.github.com/user",
            scopes: &["read:user", "user:email"],
            format: ProfileFormat::GitHub,
        }),
        "gitlab" => Some(Preset {
            auth_url: "https://gitlab.com/oauth/authorize",
            token_url: "https://gitlab.com/oauth/token",
            userinfo_url: "https://gitlab.com/api/v4/user",
            scopes: &["read_user"],
            format: ProfileFormat::GitLab,
        }),
        "microsoft" => Some(Preset {
            auth_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            userinfo_url: "https://graph.microsoft.com/oidc/userinfo",
            scopes: &["openid", "email", "profile"],
            format: ProfileFormat::Microsoft,
        }),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

pub struct HttpOAuthProvider {
    name: String,
    client_id: String,
    client_secret: String,
    auth_url: Url,
    token_url: Url,
    userinfo_url: Url,
    scopes: Vec<String>,
    format: ProfileFormat,
    http: Client,
}

impl std::fmt::Debug for HttpOAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOAuthProvider")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("auth_url", &self.auth_url.as_str())
            .finish_non_exhaustive()
    }
}

fn parse_endpoint(provider: &str, label: &str, value: &str) -> Result<Url, OAuthError> {
    Url::parse(value).map_err(|e| {
        OAuthError::invalid_request(format!("{} {} URL is invalid: {}", provider, label, e))
    })
}

impl HttpOAuthProvider {
    /// Falls back to the built-in preset for any endpoint not configured explicitly.
    pub fn from_config(config: &OAuthProviderConfig) -> Result<Self, OAuthError> {
        let name = config.name.to_lowercase();
        let preset = preset(&name);

        let pick = |explicit: &Option<String>, fallback: Option<&'static str>, label: &str| {
            explicit
                .as_deref()
                .or(fallback)
                .ok_or_else(|| {
                    OAuthError::invalid_request(format!(
                        "{} needs an explicit {} URL",
                        name, label
                    ))
                })
                .and_then(|value| parse_endpoint(&name, label, value))
        };

        let auth_url = pick(&config.auth_url, preset.as_ref().map(|p| p.auth_url), "auth")?;
        let token_url = pick(&config.token_url, preset.as_ref().map(|p| p.token_url), "token")?;
        let userinfo_url = pick(
            &config.userinfo_url,
            preset.as_ref().map(|p| p.userinfo_url),
            "userinfo",
        )?;

        let scopes = match (&config.scopes, &preset) {
            (Some(scopes), _) => scopes.clone(),
            (None, Some(preset)) => preset.scopes.iter().map(|s| s.to_string()).collect(),
            (None, None) => vec!["openid".to_string(), "email".to_string(), "profile".to_string()],
        };

        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| OAuthError::new("CLIENT_ERROR", format!("HTTP client: {}", e)))?;

        Ok(Self {
            format: preset.map(|p| p.format).unwrap_or(ProfileFormat::Oidc),
            name,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_url,
            token_url,
            userinfo_url,
            scopes,
            http,
        })
    }

    async fn github_primary_email(&self, access_token: &str) -> Result<Option<GitHubEmail>, OAuthError> {
        let mut emails_url = self.userinfo_url.clone();
        emails_url.set_path("/user/emails");

        let response = self
            .http
            .get(emails_url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| OAuthError::profile_failed(format!("github emails request: {}", e)))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "GitHub email lookup failed");
            return Ok(None);
        }

        let emails: Vec<GitHubEmail> = response
            .json()
            .await
            .map_err(|e| OAuthError::profile_failed(format!("github emails payload: {}", e)))?;

        Ok(emails.into_iter().find(|e| e.primary))
    }
}

/// Validates a client-supplied redirect URI.
pub fn validate_redirect_uri(redirect_uri: &str) -> Result<Url, OAuthError> {
    let url = Url::parse(redirect_uri)
        .map_err(|e| OAuthError::invalid_request(format!("redirect_uri is invalid: {}", e)))?;

    match url.scheme() {
        "https" | "http" => Ok(url),
        other => Err(OAuthError::invalid_request(format!(
            "redirect_uri scheme '{}' is not allowed",
            other
        ))),
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn split_name(full: Option<String>) -> (Option<String>, Option<String>) {
    match full {
        Some(full) => match full.trim().split_once(' ') {
            Some((first, last)) => (Some(first.to_string()), Some(last.trim().to_string())),
            None => (Some(full.trim().to_string()), None),
        },
        None => (None, None),
    }
}

/// Maps a raw userinfo payload onto a profile. The provider id is mandatory.
pub fn map_profile(format: ProfileFormat, payload: &Value) -> Result<ProviderProfile, OAuthError> {
    let id_field = match format {
        ProfileFormat::Oidc | ProfileFormat::Microsoft => "sub",
        ProfileFormat::GitHub | ProfileFormat::GitLab => "id",
    };

    let provider_id = string_field(payload, id_field).ok_or_else(|| {
        OAuthError::profile_failed(format!("userinfo payload is missing '{}'", id_field))
    })?;

    let email = string_field(payload, "email").map(|e| e.to_lowercase());

    let profile = match format {
        ProfileFormat::Oidc => ProviderProfile {
            provider_id,
            email_verified: payload
                .get("email_verified")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            email,
            first_name: string_field(payload, "given_name"),
            last_name: string_field(payload, "family_name"),
            avatar_url: string_field(payload, "picture"),
        },
        // The userinfo endpoint does not assert verification for work accounts.
        ProfileFormat::Microsoft => ProviderProfile {
            provider_id,
            email_verified: false,
            email,
            first_name: string_field(payload, "given_name"),
            last_name: string_field(payload, "family_name"),
            avatar_url: None,
        },
        ProfileFormat::GitHub => {
            let (first_name, last_name) = split_name(string_field(payload, "name"));
            ProviderProfile {
                provider_id,
                // Verified by the separate emails lookup.
                email_verified: false,
                email,
                first_name,
                last_name,
                avatar_url: string_field(payload, "avatar_url"),
            }
        }
        ProfileFormat::GitLab => {
            let (first_name, last_name) = split_name(string_field(payload, "name"));
            ProviderProfile {
                provider_id,
                email_verified: string_field(payload, "confirmed_at").is_some(),
                email,
                first_name,
                last_name,
                avatar_url: string_field(payload, "avatar_url"),
            }
        }
    };

    Ok(profile)
}

#[async_trait]
impl OAuthProvider for HttpOAuthProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, OAuthError> {
        let redirect = validate_redirect_uri(redirect_uri)?;

        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect.as_str())
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state);

        Ok(url.into())
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderToken, OAuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(self.token_url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| OAuthError::exchange_failed(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body: TokenResponse = response.json().await.map_err(|e| {
            OAuthError::exchange_failed(format!("token response is not JSON ({}): {}", status, e))
        })?;

        if let Some(error) = body.error {
            let description = body.error_description.unwrap_or_default();
            debug!(provider = %self.name, error = %error, "Provider rejected authorization code");
            return Err(OAuthError::exchange_failed(format!("{} {}", error, description).trim_end().to_string()));
        }

        if !status.is_success() {
            return Err(OAuthError::exchange_failed(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let access_token = body
            .access_token
            .ok_or_else(|| OAuthError::exchange_failed("token response has no access_token"))?;

        Ok(ProviderToken {
            access_token,
            refresh_token: body.refresh_token,
            expires_in: body.expires_in,
        })
    }

    async fn fetch_profile(&self, token: &ProviderToken) -> Result<ProviderProfile, OAuthError> {
        let response = self
            .http
            .get(self.userinfo_url.clone())
            .bearer_auth(&token.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| OAuthError::profile_failed(format!("userinfo request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(OAuthError::profile_failed(format!(
                "userinfo endpoint returned {}",
                response.status()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| OAuthError::profile_failed(format!("userinfo payload: {}", e)))?;

        let mut profile = map_profile(self.format, &payload)?;

        if self.format == ProfileFormat::GitHub {
            if let Some(primary) = self.github_primary_email(&token.access_token).await? {
                profile.email = Some(primary.email.to_lowercase());
                profile.email_verified = primary.verified;
            }
        }

        Ok(profile)
    }
}
