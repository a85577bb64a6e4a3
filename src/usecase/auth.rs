//! Registration, credential login, token refresh, sessions and OAuth sign-in.

use std::sync::Arc;

use base64::Engine;
use chrono::{Duration, Utc};
use rand::RngCore;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;
use validator::Validate;

use crate::auth::{LoginAttemptGuard, PasswordHasher, PasswordPolicy, TokenIssuer, TokenPair};
use crate::error::{AuthError, AuthResult, StoreError};
use crate::models::{
    ClientInfo, NewOAuthAccount, NewUser, OAuthIdentity, OAuthTokens, Session, User,
    UserProfileUpdate,
};
use crate::oauth::{OAuthError, OAuthRegistry};
use crate::repository::{SessionStore, UserRepository};
use crate::telemetry::{record_auth_attempt, AuthOutcome};

const OAUTH_STATE_BYTES: usize = 32;

#[derive(Debug, Clone, Validate)]
pub struct RegisterInput {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
    pub password: String,
    #[validate(length(max = 100, message = "First name is too long"))]
    pub first_name: Option<String>,
    #[validate(length(max = 100, message = "Last name is too long"))]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Default, Validate)]
pub struct ProfileInput {
    #[validate(length(max = 100, message = "First name is too long"))]
    pub first_name: Option<String>,
    #[validate(length(max = 100, message = "Last name is too long"))]
    pub last_name: Option<String>,
    #[validate(url(message = "Avatar must be a valid URL"))]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    pub tokens: TokenPair,
    pub session: Session,
}

#[derive(Debug, Clone)]
pub struct OAuthStart {
    pub authorization_url: String,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct OAuthCompletion {
    pub user: User,
    pub tokens: TokenPair,
    pub session: Session,
    pub is_new_user: bool,
}

pub struct AuthUseCase {
    users: Arc<dyn UserRepository>,
    sessions: Arc<dyn SessionStore>,
    attempts: LoginAttemptGuard,
    tokens: TokenIssuer,
    hasher: PasswordHasher,
    policy: PasswordPolicy,
    oauth: OAuthRegistry,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AuthUseCase {
    pub fn new(
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn SessionStore>,
        attempts: LoginAttemptGuard,
        tokens: TokenIssuer,
        hasher: PasswordHasher,
        policy: PasswordPolicy,
        oauth: OAuthRegistry,
    ) -> Self {
        Self {
            users,
            sessions,
            attempts,
            tokens,
            hasher,
            policy,
            oauth,
        }
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn oauth(&self) -> &OAuthRegistry {
        &self.oauth
    }

    pub async fn register(&self, input: RegisterInput) -> AuthResult<User> {
        let input = RegisterInput {
            email: normalize_email(&input.email),
            first_name: trimmed(input.first_name),
            last_name: trimmed(input.last_name),
            ..input
        };
        input.validate()?;
        self.policy.validate(&input.password)?;

        if self.users.find_by_email(&input.email).await?.is_some() {
            record_auth_attempt("register", AuthOutcome::Rejected);
            return Err(AuthError::UserExists);
        }

        let password_hash = self.hash_password(input.password).await?;

        let user = self
            .users
            .create(NewUser {
                email: input.email,
                password_hash: Some(password_hash),
                first_name: input.first_name,
                last_name: input.last_name,
                avatar_url: None,
                email_verified: false,
            })
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => AuthError::UserExists,
                other => AuthError::Store(other),
            })?;

        record_auth_attempt("register", AuthOutcome::Success);
        info!(user_id = %user.id, "User registered");

        Ok(user)
    }

    /// Unknown email, missing password hash and wrong password are
    /// indistinguishable to the caller and all count as a failed attempt.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client: ClientInfo,
    ) -> AuthResult<LoginOutcome> {
        let email = normalize_email(email);

        if self.attempts.is_locked(&email).await? {
            let retry_after_secs = self.attempts.lockout_remaining(&email).await?.unwrap_or(0);
            record_auth_attempt("login", AuthOutcome::AccountLocked);
            return Err(AuthError::AccountLocked { retry_after_secs });
        }

        let user = self.users.find_by_email(&email).await?;
        let verified = match user.as_ref().and_then(|u| u.password_hash.clone()) {
            Some(hash) => self.verify_password(password.to_string(), hash).await?,
            None => false,
        };

        let user = match user {
            Some(user) if verified => user,
            _ => {
                let attempts = self.attempts.record(&email).await?;
                record_auth_attempt("login", AuthOutcome::InvalidCredentials);
                warn!(attempts = attempts, "Login failed: invalid credentials");
                return Err(AuthError::InvalidCredentials);
            }
        };

        if !user.active {
            record_auth_attempt("login", AuthOutcome::AccountInactive);
            warn!(user_id = %user.id, "Login rejected: account inactive");
            return Err(AuthError::AccountInactive);
        }

        self.attempts.reset(&email).await?;
        let (tokens, session) = self.start_session(user.id, client).await?;

        record_auth_attempt("login", AuthOutcome::Success);
        info!(user_id = %user.id, session_id = %session.id, "User logged in");

        Ok(LoginOutcome {
            user,
            tokens,
            session,
        })
    }

    /// Signature and claims only; no store round trip.
    pub fn validate_token(&self, access_token: &str) -> AuthResult<Uuid> {
        self.tokens
            .verify_access_token(access_token)
            .map(|verified| verified.user_id)
    }

    /// Rotates the session: the presented refresh token works exactly once.
    pub async fn refresh_token(&self, refresh_token: &str) -> AuthResult<TokenPair> {
        let Some(session) = self.sessions.get_by_refresh_token(refresh_token).await? else {
            record_auth_attempt("refresh", AuthOutcome::InvalidToken);
            return Err(AuthError::InvalidToken);
        };

        if session.is_expired_at(Utc::now()) {
            if let Err(e) = self.sessions.delete(&session).await {
                warn!(session_id = %session.id, error = %e, "Failed to delete expired session");
            }
            record_auth_attempt("refresh", AuthOutcome::TokenExpired);
            return Err(AuthError::TokenExpired);
        }

        let verified = match self.tokens.verify_refresh_token(refresh_token) {
            Ok(verified) if verified.user_id == session.user_id => verified,
            _ => {
                record_auth_attempt("refresh", AuthOutcome::InvalidToken);
                return Err(AuthError::InvalidToken);
            }
        };

        let user = self
            .users
            .find_by_id(verified.user_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if !user.active {
            self.sessions.delete(&session).await?;
            record_auth_attempt("refresh", AuthOutcome::AccountInactive);
            return Err(AuthError::AccountInactive);
        }

        // Whoever removes the old record owns the rotation.
        if !self.sessions.delete(&session).await? {
            record_auth_attempt("refresh", AuthOutcome::InvalidToken);
            return Err(AuthError::InvalidToken);
        }

        let client = ClientInfo {
            user_agent: session.user_agent.clone(),
            ip_address: session.ip_address.clone(),
        };
        let (tokens, new_session) = self.start_session(user.id, client).await?;

        record_auth_attempt("refresh", AuthOutcome::Success);
        info!(
            user_id = %user.id,
            old_session_id = %session.id,
            session_id = %new_session.id,
            "Session rotated"
        );

        Ok(tokens)
    }

    /// Idempotent: an unknown token is a successful no-op.
    pub async fn logout(&self, access_token: &str, user_id: Option<Uuid>) -> AuthResult<()> {
        let Some(session) = self.sessions.get_by_access_token(access_token).await? else {
            return Ok(());
        };

        if user_id.is_some_and(|id| id != session.user_id) {
            return Err(AuthError::InvalidToken);
        }

        self.sessions.delete(&session).await?;
        info!(user_id = %session.user_id, session_id = %session.id, "User logged out");
        Ok(())
    }

    pub async fn logout_all(&self, access_token: &str) -> AuthResult<usize> {
        let user_id = self.validate_token(access_token)?;
        let removed = self.sessions.delete_all_for_user(user_id).await?;
        info!(user_id = %user_id, sessions = removed, "Logged out of all sessions");
        Ok(removed)
    }

    pub async fn list_sessions(&self, access_token: &str) -> AuthResult<Vec<Session>> {
        let user_id = self.validate_token(access_token)?;
        Ok(self.sessions.get_by_user_id(user_id).await?)
    }

    /// The caller persists `state` and checks it on the callback.
    pub fn initiate_oauth(&self, provider: &str, redirect_uri: &str) -> AuthResult<OAuthStart> {
        let provider = self.oauth.get(provider)?;

        let mut bytes = [0u8; OAUTH_STATE_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let state = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

        let authorization_url = provider.authorization_url(redirect_uri, &state)?;
        Ok(OAuthStart {
            authorization_url,
            state,
        })
    }

    /// Links by provider identity first, then by verified email, and
    /// otherwise creates the user and the account together.
    pub async fn complete_oauth(
        &self,
        provider_name: &str,
        code: &str,
        redirect_uri: &str,
        client: ClientInfo,
    ) -> AuthResult<OAuthCompletion> {
        let provider = self.oauth.get(provider_name)?;
        let token = provider.exchange_code(code, redirect_uri).await?;
        let profile = provider.fetch_profile(&token).await?;

        let identity = OAuthIdentity {
            provider: provider.name().to_lowercase(),
            provider_id: profile.provider_id.clone(),
            email: profile.email.as_deref().map(normalize_email),
            tokens: OAuthTokens {
                access_token: token.access_token.clone(),
                refresh_token: token.refresh_token.clone(),
                expires_at: token
                    .expires_in
                    .map(|secs| (Utc::now() + Duration::seconds(secs as i64)).naive_utc()),
            },
        };

        let existing = self
            .users
            .find_oauth_account(&identity.provider, &identity.provider_id)
            .await?;

        let (user, is_new_user) = match existing {
            Some(account) => {
                self.users
                    .update_oauth_tokens(account.id, identity.tokens.clone())
                    .await?;
                let user = self
                    .users
                    .find_by_id(account.user_id)
                    .await?
                    .ok_or(AuthError::UserNotFound)?;
                (user, false)
            }
            None => {
                let email = identity
                    .email
                    .clone()
                    .ok_or_else(|| OAuthError::email_required(&identity.provider))?;

                match self.users.find_by_email(&email).await? {
                    Some(user) if profile.email_verified => {
                        self.users
                            .link_oauth_account(NewOAuthAccount::for_user(user.id, &identity))
                            .await
                            .map_err(|e| match e {
                                StoreError::Conflict(_) => AuthError::UserExists,
                                other => AuthError::Store(other),
                            })?;
                        info!(user_id = %user.id, provider = %identity.provider, "Linked OAuth account");
                        (user, false)
                    }
                    Some(_) => {
                        warn!(provider = %identity.provider, "OAuth email matches an account but is unverified");
                        record_auth_attempt("oauth", AuthOutcome::Rejected);
                        return Err(AuthError::UserExists);
                    }
                    None => {
                        let new_user = NewUser {
                            email,
                            password_hash: None,
                            first_name: trimmed(profile.first_name.clone()),
                            last_name: trimmed(profile.last_name.clone()),
                            avatar_url: profile.avatar_url.clone(),
                            email_verified: profile.email_verified,
                        };
                        let (user, _account) = self
                            .users
                            .create_with_oauth_account(new_user, identity.clone())
                            .await
                            .map_err(|e| match e {
                                StoreError::Conflict(_) => AuthError::UserExists,
                                other => AuthError::Store(other),
                            })?;
                        info!(user_id = %user.id, provider = %identity.provider, "User created via OAuth");
                        (user, true)
                    }
                }
            }
        };

        if !user.active {
            record_auth_attempt("oauth", AuthOutcome::AccountInactive);
            return Err(AuthError::AccountInactive);
        }

        let (tokens, session) = self.start_session(user.id, client).await?;
        record_auth_attempt("oauth", AuthOutcome::Success);

        Ok(OAuthCompletion {
            user,
            tokens,
            session,
            is_new_user,
        })
    }

    pub async fn get_user_profile(&self, user_id: Uuid) -> AuthResult<User> {
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    pub async fn update_user_profile(&self, user_id: Uuid, input: ProfileInput) -> AuthResult<User> {
        let input = ProfileInput {
            first_name: trimmed(input.first_name),
            last_name: trimmed(input.last_name),
            avatar_url: trimmed(input.avatar_url),
        };
        input.validate()?;

        if let Some(avatar) = &input.avatar_url {
            let scheme = Url::parse(avatar)
                .map(|u| u.scheme().to_string())
                .unwrap_or_default();
            if scheme != "https" && scheme != "http" {
                return Err(AuthError::Validation(
                    "avatar_url: must be an http or https URL".to_string(),
                ));
            }
        }

        let update = UserProfileUpdate {
            first_name: input.first_name,
            last_name: input.last_name,
            avatar_url: input.avatar_url,
        };
        if update.is_empty() {
            return self.get_user_profile(user_id).await;
        }

        self.users
            .update_profile(user_id, update)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    async fn start_session(
        &self,
        user_id: Uuid,
        client: ClientInfo,
    ) -> AuthResult<(TokenPair, Session)> {
        let tokens = self.tokens.issue_pair(user_id)?;
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            expires_at: tokens.refresh_expires_at,
            user_agent: client.user_agent,
            ip_address: client.ip_address,
            created_at: Utc::now(),
        };
        self.sessions.create(&session).await?;
        Ok((tokens, session))
    }

    async fn hash_password(&self, password: String) -> AuthResult<String> {
        let hasher = self.hasher;
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::internal("join hashing task", e))?
            .map_err(|e| AuthError::internal("hash password", e))
    }

    async fn verify_password(&self, password: String, hash: String) -> AuthResult<bool> {
        let hasher = self.hasher;
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AuthError::internal("join verification task", e))?
            .map_err(|e| AuthError::internal("verify password", e))
    }
}
