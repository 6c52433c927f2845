//! End-to-end flows through the router with in-memory backends.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode, header};
use optik_api::config::{ApiConfig, StateBackend};
use optik_api::{AppState, router};
use optik_core::auth::attempts::MemoryAttemptLog;
use optik_core::auth::credentials::MemoryCredentialStore;
use optik_core::auth::password::PasswordHasher;
use optik_core::auth::permissions::Role;
use optik_core::auth::service::{AuthBackends, AuthService};
use optik_core::clock::ManualClock;
use optik_core::config::{AuthConfig, TierLimits};
use optik_core::models::auth::Credential;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    router: Router,
    credentials: MemoryCredentialStore,
    clock: ManualClock,
    user_id: Uuid,
}

async fn app_with(config: AuthConfig) -> TestApp {
    app_behind(config, Vec::new()).await
}

async fn app_behind(config: AuthConfig, trusted_proxies: Vec<IpAddr>) -> TestApp {
    let clock = ManualClock::new();
    let credentials = MemoryCredentialStore::new();
    let user_id = Uuid::new_v4();
    credentials.insert(Credential {
        user_id,
        user_code: "U1".into(),
        full_name: "Ulla One".into(),
        store_id: Uuid::new_v4(),
        store_code: "S1".into(),
        role: Role::Staff,
        password_hash: PasswordHasher::new(4).hash("P").await.unwrap(),
        is_active: true,
        failed_attempts: 0,
        locked_until: None,
        last_login_at: None,
    });
    let backends = AuthBackends::in_memory(
        credentials.clone(),
        MemoryAttemptLog::new(),
        Arc::new(clock.clone()),
        &config,
    );
    let auth = AuthService::new(config, Arc::new(clock.clone()), backends);
    let state = AppState {
        auth: Arc::new(auth),
        config: ApiConfig {
            bind_addr: "127.0.0.1:0".into(),
            database_url: String::new(),
            state_backend: StateBackend::Memory,
            trusted_proxies,
        },
    };
    TestApp {
        router: router(state),
        credentials,
        clock,
        user_id,
    }
}

fn test_config() -> AuthConfig {
    AuthConfig {
        access_secret: "integration-access".into(),
        refresh_secret: "integration-refresh".into(),
        bcrypt_cost: 4,
        ..AuthConfig::default()
    }
}

async fn app() -> TestApp {
    app_with(test_config()).await
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let (status, _, body) = self
            .send(builder.body(Body::from(body.to_string())).unwrap())
            .await;
        (status, body)
    }

    async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        let request = Request::get(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = self.send(request).await;
        (status, body)
    }

    async fn login(&self, password: &str) -> (StatusCode, Value) {
        self.post(
            "/auth/login",
            None,
            json!({ "userCode": "U1", "storeCode": "S1", "password": password }),
        )
        .await
    }
}

#[tokio::test]
async fn login_me_logout_me() {
    let app = app().await;
    let (status, body) = app.login("P").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokenType"], "Bearer");
    assert!(body["expiresIn"].as_i64().unwrap() > 0);
    assert_eq!(body["user"]["userCode"], "U1");
    assert_eq!(body["user"]["role"], "staff");
    let access = body["accessToken"].as_str().unwrap().to_string();

    let (status, me) = app.get("/auth/me", &access).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["id"], app.user_id.to_string());
    assert_eq!(me["storeCode"], "S1");

    let (status, body) = app.post("/auth/logout", Some(&access), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = app.get("/auth/me", &access).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    // A repeated logout is not an error.
    let (status, _) = app.post("/auth/logout", Some(&access), json!({})).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn sixth_login_is_locked() {
    let app = app().await;
    for _ in 0..5 {
        let (status, body) = app.login("wrong").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid credentials");
    }
    let (status, body) = app.login("P").await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["error"], "account_locked");
}

#[tokio::test]
async fn unknown_user_and_wrong_password_look_the_same() {
    let app = app().await;
    let (_, wrong) = app.login("wrong").await;
    let (_, unknown) = app
        .post(
            "/auth/login",
            None,
            json!({ "userCode": "nobody", "storeCode": "S1", "password": "P" }),
        )
        .await;
    assert_eq!(wrong, unknown);
}

#[tokio::test]
async fn refresh_rotates_tokens() {
    let app = app().await;
    let (_, login) = app.login("P").await;
    let first = login["refreshToken"].as_str().unwrap().to_string();

    let (status, body) = app
        .post("/auth/refresh", None, json!({ "refreshToken": first }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["refreshToken"], first.as_str());
    assert_ne!(body["accessToken"], login["accessToken"]);

    let (status, body) = app
        .post("/auth/refresh", None, json!({ "refreshToken": first }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid token");
}

#[tokio::test]
async fn refresh_tier_answers_429_with_retry_after() {
    let mut config = test_config();
    config.rate_limits.refresh = TierLimits::new(1, Duration::from_secs(60), Duration::ZERO);
    let app = app_with(config).await;

    let request = || {
        Request::post("/auth/refresh")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "198.51.100.7")
            .body(Body::from(json!({ "refreshToken": "bogus" }).to_string()))
            .unwrap()
    };
    let (status, _, _) = app.send(request()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, headers, body) = app.send(request()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate_limit_exceeded");
    let retry_after: u64 = headers[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 60);
}

fn refresh_from(peer: [u8; 4], forwarded_for: &str) -> Request<Body> {
    let mut request = Request::post("/auth/refresh")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", forwarded_for)
        .body(Body::from(json!({ "refreshToken": "bogus" }).to_string()))
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((peer, 40000))));
    request
}

fn api_tier_of_two() -> AuthConfig {
    let mut config = test_config();
    config.rate_limits.api = TierLimits::new(2, Duration::from_secs(60), Duration::ZERO);
    config
}

#[tokio::test]
async fn rotating_forwarded_for_does_not_reset_the_budget() {
    let app = app_with(api_tier_of_two()).await;
    let mut statuses = Vec::new();
    for i in 0..4 {
        let (status, _, _) = app
            .send(refresh_from([203, 0, 113, 5], &format!("10.9.9.{i}")))
            .await;
        statuses.push(status);
    }
    assert_eq!(
        statuses,
        vec![
            StatusCode::UNAUTHORIZED,
            StatusCode::UNAUTHORIZED,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
        ]
    );
}

#[tokio::test]
async fn trusted_proxies_forward_the_client_address() {
    let proxy = [10, 0, 0, 1];
    let app = app_behind(api_tier_of_two(), vec![IpAddr::from(proxy)]).await;
    for _ in 0..2 {
        let (status, _, _) = app.send(refresh_from(proxy, "198.51.100.1")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (status, _, _) = app.send(refresh_from(proxy, "198.51.100.1")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // A different client behind the same proxy has its own budget.
    let (status, _, _) = app.send(refresh_from(proxy, "198.51.100.2")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sessions_can_be_listed_and_revoked() {
    let app = app().await;
    let (_, first) = app.login("P").await;
    app.clock.advance(chrono::Duration::seconds(1));
    let (_, second) = app.login("P").await;
    let access = second["accessToken"].as_str().unwrap();

    let (status, list) = app.get("/auth/sessions", access).await;
    assert_eq!(status, StatusCode::OK);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["id"], second["sessionId"]);
    assert_eq!(list[0]["current"], true);
    assert_eq!(list[1]["current"], false);

    let revoke = |id: &str| {
        Request::delete(format!("/auth/sessions/{id}"))
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(Body::empty())
            .unwrap()
    };
    let first_id = first["sessionId"].as_str().unwrap();
    let (status, _, _) = app.send(revoke(first_id)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, body) = app.send(revoke(first_id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    // The revoked session's token no longer reaches a live session.
    let (status, body) = app
        .get("/auth/me", first["accessToken"].as_str().unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "session_expired");
}

#[tokio::test]
async fn deactivated_users_are_forbidden() {
    let app = app().await;
    let (_, login) = app.login("P").await;
    app.credentials.set_active(app.user_id, false);
    let (status, body) = app
        .get("/auth/me", login["accessToken"].as_str().unwrap())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn requests_are_validated() {
    let app = app().await;
    let (status, body) = app
        .post(
            "/auth/login",
            None,
            json!({ "userCode": " ", "storeCode": "S1", "password": "P" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let request = Request::get("/auth/me").body(Body::empty()).unwrap();
    let (status, _, body) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Missing authorization header");
}
