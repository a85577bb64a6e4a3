//! Service-level tests calling the tonic handlers directly.

mod common;

use common::*;
use tonic::{Code, Request};

use portcullis::grpc::proto::auth_service_server::AuthService;
use portcullis::repository::UserRepository;
use portcullis::grpc::proto::health_check_response::ServingStatus;
use portcullis::grpc::proto::workspace_service_server::WorkspaceService;
use portcullis::grpc::proto::{
    AssignRoleRequest, CheckPermissionRequest, CompleteOAuthRequest, CreateWorkspaceRequest,
    GenerateApiKeyRequest, GetUserProfileRequest, HealthCheckRequest, InitiateOAuthRequest,
    ListSessionsRequest, LoginRequest, LogoutAllRequest, LogoutRequest, RefreshTokenRequest,
    RegisterRequest, UpdateUserProfileRequest, UpdateWorkspaceRequest, ValidateApiKeyRequest,
    ValidateTokenRequest,
};

fn register_request(email: &str) -> RegisterRequest {
    RegisterRequest {
        email: email.to_string(),
        password: TEST_PASSWORD.to_string(),
        first_name: "Grpc".to_string(),
        last_name: String::new(),
    }
}

#[tokio::test]
async fn test_register_login_and_validate() {
    let app = TestApp::spawn();
    let service = app.app.auth_service();
    let email = unique_email("grpc");

    let registered = service
        .register(Request::new(register_request(&email)))
        .await
        .unwrap()
        .into_inner()
        .user
        .unwrap();
    assert_eq!(registered.email, email);
    assert_eq!(registered.first_name, "Grpc");
    assert!(registered.last_name.is_empty());

    let login = service
        .login(Request::new(LoginRequest {
            email: email.clone(),
            password: TEST_PASSWORD.to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(login.user.unwrap().id, registered.id);

    let validated = service
        .validate_token(Request::new(ValidateTokenRequest {
            token: login.access_token,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(validated.valid);
    assert_eq!(validated.user_id, registered.id);

    let rejected = service
        .validate_token(Request::new(ValidateTokenRequest {
            token: login.refresh_token,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!rejected.valid);
    assert!(rejected.user_id.is_empty());
}

#[tokio::test]
async fn test_errors_map_to_status_codes() {
    let app = TestApp::spawn();
    let service = app.app.auth_service();
    let email = unique_email("codes");
    service
        .register(Request::new(register_request(&email)))
        .await
        .unwrap();

    let duplicate = service
        .register(Request::new(register_request(&email)))
        .await
        .unwrap_err();
    assert_eq!(duplicate.code(), Code::AlreadyExists);

    let bad_login = service
        .login(Request::new(LoginRequest {
            email,
            password: "nope-nope-nope".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(bad_login.code(), Code::Unauthenticated);

    let bad_refresh = service
        .refresh_token(Request::new(RefreshTokenRequest {
            refresh_token: "not-a-token".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(bad_refresh.code(), Code::Unauthenticated);

    let weak = service
        .register(Request::new(RegisterRequest {
            password: "short".to_string(),
            ..register_request(&unique_email("weak"))
        }))
        .await
        .unwrap_err();
    assert_eq!(weak.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_logout_reports_through_envelope() {
    let app = TestApp::spawn();
    let service = app.app.auth_service();
    let user = app.register_and_login(&unique_email("logout")).await;

    let malformed = service
        .logout(Request::new(LogoutRequest {
            access_token: user.access_token.clone(),
            user_id: "not-a-uuid".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!malformed.success);
    assert_eq!(malformed.error.unwrap().code, "VALIDATION_ERROR");

    let ok = service
        .logout(Request::new(LogoutRequest {
            access_token: user.access_token,
            user_id: user.id.to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(ok.success);
    assert!(ok.error.is_none());
    assert_eq!(app.sessions.session_count().await, 0);
}

#[tokio::test]
async fn test_logout_all_and_list_sessions() {
    let app = TestApp::spawn();
    let service = app.app.auth_service();
    let email = unique_email("sessions");
    let user = app.register_and_login(&email).await;
    app.login(&email).await;

    let listed = service
        .list_sessions(Request::new(ListSessionsRequest {
            access_token: user.access_token.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listed.sessions.len(), 2);
    assert!(listed
        .sessions
        .iter()
        .all(|s| s.user_agent == "portcullis-tests/1.0"));

    let response = service
        .logout_all(Request::new(LogoutAllRequest {
            access_token: user.access_token,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(response.success);
    assert_eq!(response.sessions_removed, 2);

    let invalid = service
        .logout_all(Request::new(LogoutAllRequest {
            access_token: "garbage".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!invalid.success);
    assert_eq!(invalid.error.unwrap().code, "INVALID_TOKEN");
}

async fn initiate(app: &TestApp, provider: &str) -> String {
    let response = app
        .app
        .auth_service()
        .initiate_o_auth(Request::new(InitiateOAuthRequest {
            provider: provider.to_string(),
            redirect_uri: "https://app.example/callback".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(response.success, "initiate failed: {:?}", response.error);
    assert!(response.auth_url.contains(&response.state));
    response.state
}

#[tokio::test]
async fn test_oauth_state_is_single_use() {
    let app = TestApp::spawn();
    let service = app.app.auth_service();
    let state = initiate(&app, "github").await;

    let completion = service
        .complete_o_auth(Request::new(CompleteOAuthRequest {
            provider: "github".to_string(),
            code: "code-1".to_string(),
            state: state.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(completion.success);
    assert!(completion.is_new_user);
    assert!(!completion.access_token.is_empty());
    assert_eq!(
        completion.user.unwrap().email,
        app.provider.profile().email.unwrap()
    );

    let replay = service
        .complete_o_auth(Request::new(CompleteOAuthRequest {
            provider: "github".to_string(),
            code: "code-1".to_string(),
            state,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!replay.success);
    assert!(replay.access_token.is_empty());
    assert_eq!(replay.error.unwrap().code, "INVALID_OAUTH_STATE");
}

#[tokio::test]
async fn test_oauth_state_is_bound_to_provider() {
    let app = TestApp::spawn();
    let service = app.app.auth_service();
    let state = initiate(&app, "github").await;

    let mismatch = service
        .complete_o_auth(Request::new(CompleteOAuthRequest {
            provider: "google".to_string(),
            code: "code".to_string(),
            state: state.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!mismatch.success);
    assert_eq!(mismatch.error.unwrap().code, "INVALID_OAUTH_STATE");

    // The mismatched attempt consumed the state.
    let retry = service
        .complete_o_auth(Request::new(CompleteOAuthRequest {
            provider: "github".to_string(),
            code: "code".to_string(),
            state,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!retry.success);
    assert_eq!(app.users.account_count().await, 0);
}

#[tokio::test]
async fn test_oauth_provider_failure_is_enveloped() {
    let app = TestApp::spawn();
    let service = app.app.auth_service();

    let unknown = service
        .initiate_o_auth(Request::new(InitiateOAuthRequest {
            provider: "myspace".to_string(),
            redirect_uri: "https://app.example/callback".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!unknown.success);
    assert_eq!(unknown.error.unwrap().code, "PROVIDER_NOT_CONFIGURED");

    let state = initiate(&app, "github").await;
    let failed = service
        .complete_o_auth(Request::new(CompleteOAuthRequest {
            provider: "github".to_string(),
            code: REJECTED_CODE.to_string(),
            state,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!failed.success);
    assert_eq!(failed.error.unwrap().code, "CODE_EXCHANGE_FAILED");
}

#[tokio::test]
async fn test_profile_calls_require_owner_bearer() {
    let app = TestApp::spawn();
    let service = app.app.auth_service();
    let alice = app.register_and_login(&unique_email("alice")).await;
    let bob = app.register_and_login(&unique_email("bob")).await;

    let own = service
        .get_user_profile(authed(
            GetUserProfileRequest {
                user_id: alice.id.to_string(),
            },
            &alice.access_token,
        ))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(own.user.unwrap().email, alice.email);

    let foreign = service
        .update_user_profile(authed(
            UpdateUserProfileRequest {
                user_id: bob.id.to_string(),
                first_name: Some("Mallory".to_string()),
                last_name: None,
                avatar_url: None,
            },
            &alice.access_token,
        ))
        .await
        .unwrap_err();
    assert_eq!(foreign.code(), Code::PermissionDenied);

    let anonymous_read = service
        .get_user_profile(Request::new(GetUserProfileRequest {
            user_id: bob.id.to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(anonymous_read.code(), Code::Unauthenticated);

    let anonymous_write = service
        .update_user_profile(Request::new(UpdateUserProfileRequest {
            user_id: bob.id.to_string(),
            first_name: Some("Mallory".to_string()),
            last_name: None,
            avatar_url: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(anonymous_write.code(), Code::Unauthenticated);

    let untouched = app.users.find_by_id(bob.id).await.unwrap().unwrap();
    assert_ne!(untouched.first_name.as_deref(), Some("Mallory"));
}

#[tokio::test]
async fn test_health_check_serving() {
    let app = TestApp::spawn();
    let response = app
        .app
        .auth_service()
        .health_check(Request::new(HealthCheckRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.status, ServingStatus::Serving as i32);
}

#[tokio::test]
async fn test_workspace_calls_require_bearer() {
    let app = TestApp::spawn();
    let service = app.app.workspace_service();

    let err = service
        .create_workspace(Request::new(CreateWorkspaceRequest {
            name: "Acme".to_string(),
            description: String::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let err = service
        .create_workspace(authed(
            CreateWorkspaceRequest {
                name: "Acme".to_string(),
                description: String::new(),
            },
            "not-a-jwt",
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn test_workspace_lifecycle_over_grpc() {
    let app = TestApp::spawn();
    let service = app.app.workspace_service();
    let owner = app.register_and_login(&unique_email("owner")).await;
    let member = app.register_and_login(&unique_email("member")).await;

    let workspace = service
        .create_workspace(authed(
            CreateWorkspaceRequest {
                name: "Acme".to_string(),
                description: "Rockets".to_string(),
            },
            &owner.access_token,
        ))
        .await
        .unwrap()
        .into_inner()
        .workspace
        .unwrap();
    assert_eq!(workspace.owner_id, owner.id.to_string());
    assert_eq!(workspace.settings_json, "{}");

    let bad_settings = service
        .update_workspace(authed(
            UpdateWorkspaceRequest {
                workspace_id: workspace.id.clone(),
                name: None,
                description: None,
                plan: None,
                settings_json: Some("{not json".to_string()),
            },
            &owner.access_token,
        ))
        .await
        .unwrap_err();
    assert_eq!(bad_settings.code(), Code::InvalidArgument);

    let check = |user_id: String, permission: &str| CheckPermissionRequest {
        user_id,
        workspace_id: workspace.id.clone(),
        permission: permission.to_string(),
    };

    let before = service
        .check_permission(Request::new(check(member.id.to_string(), "workflow:write")))
        .await
        .unwrap()
        .into_inner();
    assert!(!before.allowed);

    let assigned = service
        .assign_role(authed(
            AssignRoleRequest {
                target_user_id: member.id.to_string(),
                workspace_id: workspace.id.clone(),
                role: "developer".to_string(),
                custom_permissions: vec![],
            },
            &owner.access_token,
        ))
        .await
        .unwrap()
        .into_inner()
        .member
        .unwrap();
    assert_eq!(assigned.role, "developer");
    assert_eq!(assigned.created_by, owner.id.to_string());

    let after = service
        .check_permission(Request::new(check(member.id.to_string(), "workflow:write")))
        .await
        .unwrap()
        .into_inner();
    assert!(after.allowed);

    let bad_role = service
        .assign_role(authed(
            AssignRoleRequest {
                target_user_id: member.id.to_string(),
                workspace_id: workspace.id.clone(),
                role: "overlord".to_string(),
                custom_permissions: vec![],
            },
            &owner.access_token,
        ))
        .await
        .unwrap_err();
    assert_eq!(bad_role.code(), Code::InvalidArgument);

    let stranger = service
        .assign_role(authed(
            AssignRoleRequest {
                target_user_id: uuid::Uuid::new_v4().to_string(),
                workspace_id: workspace.id.clone(),
                role: "viewer".to_string(),
                custom_permissions: vec![],
            },
            &owner.access_token,
        ))
        .await
        .unwrap_err();
    assert_eq!(stranger.code(), Code::NotFound);

    let generated = service
        .generate_api_key(authed(
            GenerateApiKeyRequest {
                workspace_id: workspace.id.clone(),
                name: "deploy".to_string(),
                scopes: vec!["workflow:execute".to_string()],
                rate_limit: 0,
                expires_at: None,
            },
            &member.access_token,
        ))
        .await
        .unwrap()
        .into_inner();
    let key = generated.api_key.unwrap();
    assert_eq!(key.rate_limit, 1000);
    assert_eq!(key.expires_at, 0);

    let validated = service
        .validate_api_key(Request::new(ValidateApiKeyRequest {
            key: generated.plaintext_key,
        }))
        .await
        .unwrap()
        .into_inner()
        .api_key
        .unwrap();
    assert_eq!(validated.id, key.id);
    assert_eq!(validated.workspace_id, workspace.id);
}
