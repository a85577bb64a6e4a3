//! Shared harness for the integration tests.
//!
//! Everything runs against the in-memory stores; the concrete handles are
//! kept so tests can inspect or tamper with stored state.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tonic::Request;
use uuid::Uuid;

use portcullis::models::{ClientInfo, User};
use portcullis::oauth::{
    OAuthError, OAuthProvider, OAuthRegistry, ProviderProfile, ProviderToken,
};
use portcullis::repository::memory::{
    MemoryRoleRepository, MemorySessionStore, MemoryUserRepository,
};
use portcullis::usecase::{LoginOutcome, RegisterInput};
use portcullis::{App, Config, Stores};

pub const TEST_PASSWORD: &str = "correct-horse-battery";

/// Code that makes [`FakeOAuthProvider::exchange_code`] fail.
pub const REJECTED_CODE: &str = "rejected-code";

/// OAuth provider double with a profile the test controls.
pub struct FakeOAuthProvider {
    name: String,
    profile: Mutex<ProviderProfile>,
}

impl FakeOAuthProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            profile: Mutex::new(ProviderProfile {
                provider_id: "fake-subject-1".to_string(),
                email: Some("oauth.user@example.com".to_string()),
                email_verified: true,
                first_name: Some("Oauth".to_string()),
                last_name: Some("User".to_string()),
                avatar_url: None,
            }),
        }
    }

    pub fn set_profile(&self, profile: ProviderProfile) {
        *self.profile.lock().unwrap() = profile;
    }

    pub fn profile(&self) -> ProviderProfile {
        self.profile.lock().unwrap().clone()
    }
}

#[async_trait]
impl OAuthProvider for FakeOAuthProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, OAuthError> {
        let mut url = url::Url::parse("https://provider.example/authorize")
            .map_err(|e| OAuthError::invalid_request(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state);
        Ok(url.to_string())
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<ProviderToken, OAuthError> {
        if code == REJECTED_CODE {
            return Err(OAuthError::exchange_failed("provider rejected the code"));
        }
        Ok(ProviderToken {
            access_token: format!("provider-access-{}", code),
            refresh_token: Some(format!("provider-refresh-{}", code)),
            expires_in: Some(3600),
        })
    }

    async fn fetch_profile(&self, _token: &ProviderToken) -> Result<ProviderProfile, OAuthError> {
        Ok(self.profile())
    }
}

/// A registered user holding a live session.
#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: Uuid,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
}

pub struct TestApp {
    pub app: App,
    pub config: Config,
    pub users: Arc<MemoryUserRepository>,
    pub sessions: Arc<MemorySessionStore>,
    pub provider: Arc<FakeOAuthProvider>,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::with_config(Config::default_for_testing())
    }

    pub fn with_config(config: Config) -> Self {
        let users = Arc::new(MemoryUserRepository::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let provider = Arc::new(FakeOAuthProvider::new("github"));

        let stores = Stores {
            users: users.clone(),
            roles: Arc::new(MemoryRoleRepository::with_users(users.clone())),
            sessions: sessions.clone(),
            ..Stores::in_memory()
        };

        let mut registry = OAuthRegistry::new();
        registry.register(provider.clone());

        let app = App::build_with_oauth(&config, stores, registry)
            .expect("in-memory app should build");

        Self {
            app,
            config,
            users,
            sessions,
            provider,
        }
    }

    pub async fn register(&self, email: &str) -> User {
        self.app
            .auth
            .register(RegisterInput {
                email: email.to_string(),
                password: TEST_PASSWORD.to_string(),
                first_name: Some("Test".to_string()),
                last_name: Some("User".to_string()),
            })
            .await
            .expect("registration should succeed")
    }

    pub async fn login(&self, email: &str) -> LoginOutcome {
        self.app
            .auth
            .login(email, TEST_PASSWORD, client())
            .await
            .expect("login should succeed")
    }

    pub async fn register_and_login(&self, email: &str) -> TestUser {
        let user = self.register(email).await;
        let outcome = self.login(email).await;
        TestUser {
            id: user.id,
            email: user.email,
            access_token: outcome.tokens.access_token,
            refresh_token: outcome.tokens.refresh_token,
        }
    }
}

pub fn client() -> ClientInfo {
    ClientInfo {
        user_agent: Some("portcullis-tests/1.0".to_string()),
        ip_address: Some("127.0.0.1".to_string()),
    }
}

pub fn unique_email(prefix: &str) -> String {
    format!("{}-{}@example.com", prefix, Uuid::new_v4().simple())
}

/// Wraps a message with `authorization: Bearer <token>` metadata.
pub fn authed<T>(message: T, token: &str) -> Request<T> {
    let mut request = Request::new(message);
    request.metadata_mut().insert(
        "authorization",
        format!("Bearer {}", token)
            .parse()
            .expect("token is valid metadata"),
    );
    request
}
