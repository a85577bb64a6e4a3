//! gRPC AuthService implementation.

use std::sync::Arc;

use chrono::Utc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::proto::auth_service_server::AuthService;
use super::proto::health_check_response::ServingStatus;
use super::proto::{
    CompleteOAuthRequest, CompleteOAuthResponse, GetUserProfileRequest, HealthCheckRequest,
    HealthCheckResponse, InitiateOAuthRequest, InitiateOAuthResponse, ListSessionsRequest,
    ListSessionsResponse, LoginRequest, LoginResponse, LogoutAllRequest, LogoutRequest,
    LogoutResponse, RefreshTokenRequest, RegisterRequest, TokenPairResponse,
    UpdateUserProfileRequest, UserProfile, UserResponse, ValidateTokenRequest,
    ValidateTokenResponse,
};
use super::{bearer_token, client_info, envelope_or_status, non_empty, parse_uuid, peer_ip};
use crate::error::AuthError;
use crate::middleware::CredentialRateLimiter;
use crate::models::PendingOAuth;
use crate::repository::{HealthProbe, OAuthStateStore};
use crate::usecase::{AuthUseCase, ProfileInput, RegisterInput};

pub struct AuthServiceImpl {
    auth: Arc<AuthUseCase>,
    oauth_states: Arc<dyn OAuthStateStore>,
    limiter: CredentialRateLimiter,
    oauth_state_ttl_secs: u64,
    probes: Vec<Arc<dyn HealthProbe>>,
}

impl AuthServiceImpl {
    pub fn new(
        auth: Arc<AuthUseCase>,
        oauth_states: Arc<dyn OAuthStateStore>,
        limiter: CredentialRateLimiter,
        oauth_state_ttl_secs: u64,
        probes: Vec<Arc<dyn HealthProbe>>,
    ) -> Self {
        Self {
            auth,
            oauth_states,
            limiter,
            oauth_state_ttl_secs,
            probes,
        }
    }

    /// Profile calls need a bearer token issued to `user_id`.
    #[allow(clippy::result_large_err)]
    fn check_caller<T>(&self, request: &Request<T>, user_id: Uuid) -> Result<(), Status> {
        let token = bearer_token(request)
            .ok_or_else(|| Status::unauthenticated("Missing bearer token"))?;
        if self.auth.validate_token(&token)? != user_id {
            return Err(Status::permission_denied(
                "Token does not belong to the requested user",
            ));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl AuthService for AuthServiceImpl {
    #[instrument(skip(self, request))]
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<UserResponse>, Status> {
        self.limiter.enforce(peer_ip(&request), "Register")?;
        let req = request.into_inner();

        let user = self
            .auth
            .register(RegisterInput {
                email: req.email,
                password: req.password,
                first_name: non_empty(req.first_name),
                last_name: non_empty(req.last_name),
            })
            .await?;

        Ok(Response::new(UserResponse {
            user: Some(user.into()),
        }))
    }

    #[instrument(skip(self, request))]
    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> Result<Response<LoginResponse>, Status> {
        self.limiter.enforce(peer_ip(&request), "Login")?;
        let client = client_info(&request);
        let req = request.into_inner();

        let outcome = self.auth.login(&req.email, &req.password, client).await?;

        Ok(Response::new(LoginResponse {
            access_token: outcome.tokens.access_token,
            refresh_token: outcome.tokens.refresh_token,
            user: Some(outcome.user.into()),
        }))
    }

    #[instrument(skip(self, request), fields(token_len = request.get_ref().token.len()))]
    async fn validate_token(
        &self,
        request: Request<ValidateTokenRequest>,
    ) -> Result<Response<ValidateTokenResponse>, Status> {
        let req = request.into_inner();

        let response = match self.auth.validate_token(&req.token) {
            Ok(user_id) => ValidateTokenResponse {
                valid: true,
                user_id: user_id.to_string(),
            },
            Err(e) => {
                debug!(error = %e, "Token rejected");
                ValidateTokenResponse {
                    valid: false,
                    user_id: String::new(),
                }
            }
        };

        Ok(Response::new(response))
    }

    #[instrument(skip(self, request))]
    async fn refresh_token(
        &self,
        request: Request<RefreshTokenRequest>,
    ) -> Result<Response<TokenPairResponse>, Status> {
        self.limiter.enforce(peer_ip(&request), "RefreshToken")?;
        let req = request.into_inner();

        let tokens = self.auth.refresh_token(&req.refresh_token).await?;

        Ok(Response::new(TokenPairResponse {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        }))
    }

    #[instrument(skip(self, request))]
    async fn logout(
        &self,
        request: Request<LogoutRequest>,
    ) -> Result<Response<LogoutResponse>, Status> {
        let req = request.into_inner();

        let result = match non_empty(req.user_id) {
            Some(raw) => match parse_uuid("user_id", &raw) {
                Ok(user_id) => self.auth.logout(&req.access_token, Some(user_id)).await,
                Err(e) => Err(e),
            },
            None => self.auth.logout(&req.access_token, None).await,
        };

        let response = match result {
            Ok(()) => LogoutResponse {
                success: true,
                error: None,
                sessions_removed: 0,
            },
            Err(e) => LogoutResponse {
                success: false,
                error: Some(envelope_or_status(e)?),
                sessions_removed: 0,
            },
        };
        Ok(Response::new(response))
    }

    #[instrument(skip(self, request))]
    async fn logout_all(
        &self,
        request: Request<LogoutAllRequest>,
    ) -> Result<Response<LogoutResponse>, Status> {
        let req = request.into_inner();

        let response = match self.auth.logout_all(&req.access_token).await {
            Ok(removed) => LogoutResponse {
                success: true,
                error: None,
                sessions_removed: u32::try_from(removed).unwrap_or(u32::MAX),
            },
            Err(e) => LogoutResponse {
                success: false,
                error: Some(envelope_or_status(e)?),
                sessions_removed: 0,
            },
        };
        Ok(Response::new(response))
    }

    #[instrument(skip(self, request))]
    async fn list_sessions(
        &self,
        request: Request<ListSessionsRequest>,
    ) -> Result<Response<ListSessionsResponse>, Status> {
        let req = request.into_inner();
        let sessions = self.auth.list_sessions(&req.access_token).await?;

        Ok(Response::new(ListSessionsResponse {
            sessions: sessions.into_iter().map(Into::into).collect(),
        }))
    }

    #[instrument(skip(self, request), fields(provider = %request.get_ref().provider))]
    async fn initiate_o_auth(
        &self,
        request: Request<InitiateOAuthRequest>,
    ) -> Result<Response<InitiateOAuthResponse>, Status> {
        let req = request.into_inner();

        let start = match self.auth.initiate_oauth(&req.provider, &req.redirect_uri) {
            Ok(start) => start,
            Err(e) => {
                return Ok(Response::new(InitiateOAuthResponse {
                    success: false,
                    auth_url: String::new(),
                    state: String::new(),
                    error: Some(envelope_or_status(e)?),
                }));
            }
        };

        let pending = PendingOAuth {
            provider: req.provider.trim().to_lowercase(),
            redirect_uri: req.redirect_uri,
            created_at: Utc::now(),
        };
        self.oauth_states
            .save(&start.state, &pending, self.oauth_state_ttl_secs)
            .await
            .map_err(AuthError::from)?;

        Ok(Response::new(InitiateOAuthResponse {
            success: true,
            auth_url: start.authorization_url,
            state: start.state,
            error: None,
        }))
    }

    /// The state is consumed before anything else, so a replayed or
    /// mismatched callback can never reach the provider.
    #[instrument(skip(self, request), fields(provider = %request.get_ref().provider))]
    async fn complete_o_auth(
        &self,
        request: Request<CompleteOAuthRequest>,
    ) -> Result<Response<CompleteOAuthResponse>, Status> {
        self.limiter.enforce(peer_ip(&request), "CompleteOAuth")?;
        let client = client_info(&request);
        let req = request.into_inner();

        let failure = |e: AuthError| -> Result<Response<CompleteOAuthResponse>, Status> {
            Ok(Response::new(CompleteOAuthResponse {
                success: false,
                access_token: String::new(),
                refresh_token: String::new(),
                is_new_user: false,
                user: None,
                error: Some(envelope_or_status(e)?),
            }))
        };

        let pending = self
            .oauth_states
            .take(&req.state)
            .await
            .map_err(AuthError::from)?;
        let pending = match pending {
            Some(pending) if pending.provider == req.provider.trim().to_lowercase() => pending,
            Some(pending) => {
                warn!(expected = %pending.provider, "OAuth state presented for another provider");
                return failure(AuthError::InvalidOAuthState);
            }
            None => return failure(AuthError::InvalidOAuthState),
        };

        match self
            .auth
            .complete_oauth(&pending.provider, &req.code, &pending.redirect_uri, client)
            .await
        {
            Ok(completion) => Ok(Response::new(CompleteOAuthResponse {
                success: true,
                access_token: completion.tokens.access_token,
                refresh_token: completion.tokens.refresh_token,
                is_new_user: completion.is_new_user,
                user: Some(completion.user.into()),
                error: None,
            })),
            Err(e) => failure(e),
        }
    }

    #[instrument(skip(self, request))]
    async fn get_user_profile(
        &self,
        request: Request<GetUserProfileRequest>,
    ) -> Result<Response<UserProfile>, Status> {
        let user_id = parse_uuid("user_id", &request.get_ref().user_id)?;
        self.check_caller(&request, user_id)?;

        let user = self.auth.get_user_profile(user_id).await?;
        Ok(Response::new(UserProfile {
            user: Some(user.into()),
        }))
    }

    #[instrument(skip(self, request))]
    async fn update_user_profile(
        &self,
        request: Request<UpdateUserProfileRequest>,
    ) -> Result<Response<UserProfile>, Status> {
        let user_id = parse_uuid("user_id", &request.get_ref().user_id)?;
        self.check_caller(&request, user_id)?;
        let req = request.into_inner();

        let user = self
            .auth
            .update_user_profile(
                user_id,
                ProfileInput {
                    first_name: req.first_name,
                    last_name: req.last_name,
                    avatar_url: req.avatar_url,
                },
            )
            .await?;

        Ok(Response::new(UserProfile {
            user: Some(user.into()),
        }))
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let mut serving = true;
        for probe in &self.probes {
            if let Err(e) = probe.ping().await {
                warn!(component = probe.component(), error = %e, "Health probe failed");
                serving = false;
            }
        }

        let status = if serving {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        };
        Ok(Response::new(HealthCheckResponse {
            status: status as i32,
        }))
    }
}
