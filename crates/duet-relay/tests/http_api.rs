//! REST surface exercised in-process through the router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use duet_crypto::IdentityKeypair;
use duet_proto::{SessionClaims, UserId, UserSummary};
use duet_relay::store::{SqliteStore, Store};
use duet_relay::{RelayServer, ServerConfig};

struct Fixture {
    server: RelayServer,
    alice: (UserSummary, String),
    bob: (UserSummary, String),
}

impl Fixture {
    async fn new() -> Self {
        let config = ServerConfig {
            jwt_secret: "http-api-test-secret".to_string(),
            max_ciphertext_bytes: 256,
            ..ServerConfig::default()
        };
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let server = RelayServer::with_store(config, store).unwrap();
        let alice = Self::user(&server, "alice").await;
        let bob = Self::user(&server, "bob").await;
        Self { server, alice, bob }
    }

    async fn user(server: &RelayServer, name: &str) -> (UserSummary, String) {
        let user = server.state().store.create_user(name).await.unwrap();
        let token = server
            .state()
            .auth
            .issue(user.id, Duration::from_secs(3600))
            .unwrap();
        (user, token)
    }

    fn app(&self) -> Router {
        self.server.router()
    }

    async fn call(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn start(&self) -> String {
        let (status, body) = self
            .call(
                "POST",
                "/conversations",
                Some(&self.alice.1),
                Some(json!({ "peerId": self.bob.0.id })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn missing_or_bad_credentials_are_rejected() {
    let f = Fixture::new().await;
    let (status, body) = f.call("GET", "/conversations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = f.call("GET", "/users", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let now = chrono::Utc::now().timestamp();
    let expired = f
        .server
        .state()
        .auth
        .sign(&SessionClaims {
            sub: f.alice.0.id,
            iat: now - 7200,
            exp: now - 3600,
        })
        .unwrap();
    let (status, _) = f.call("GET", "/conversations", Some(&expired), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // a valid signature for a user that does not exist
    let ghost = f
        .server
        .state()
        .auth
        .issue(UserId::new(), Duration::from_secs(60))
        .unwrap();
    let (status, _) = f.call("GET", "/conversations", Some(&ghost), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_and_metrics_are_public() {
    let f = Fixture::new().await;
    let (status, body) = f.call("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let response = f
        .app()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&text).contains("duet_relay_messages_persisted_total"));
}

#[tokio::test]
async fn key_publish_and_lookup() {
    let f = Fixture::new().await;
    let identity = IdentityKeypair::generate();
    let lookup = format!("/keys/{}", f.alice.0.id);

    let (status, body) = f.call("GET", &lookup, Some(&f.bob.1), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = f
        .call(
            "POST",
            "/keys",
            Some(&f.alice.1),
            Some(json!({ "publicKeyMaterial": identity.public_portable() })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = f.call("GET", &lookup, Some(&f.bob.1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["publicKeyMaterial"],
        serde_json::to_value(identity.public_portable()).unwrap()
    );
}

#[tokio::test]
async fn private_key_material_is_refused() {
    let f = Fixture::new().await;
    let identity = IdentityKeypair::generate();
    let (status, body) = f
        .call(
            "POST",
            "/keys",
            Some(&f.alice.1),
            Some(json!({ "publicKeyMaterial": identity.to_portable() })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_operation");

    let (status, _) = f
        .call("POST", "/keys", Some(&f.alice.1), Some(json!({ "unrelated": 1 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_or_get_answers_201_then_200() {
    let f = Fixture::new().await;
    let id = f.start().await;

    let (status, body) = f
        .call(
            "POST",
            "/conversations",
            Some(&f.bob.1),
            Some(json!({ "peerId": f.alice.0.id })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["participants"].as_array().unwrap().len(), 2);

    let (status, _) = f
        .call(
            "POST",
            "/conversations",
            Some(&f.alice.1),
            Some(json!({ "peerId": f.alice.0.id })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = f
        .call(
            "POST",
            "/conversations",
            Some(&f.alice.1),
            Some(json!({ "peerId": UserId::new() })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn messages_round_trip_over_rest() {
    let f = Fixture::new().await;
    let id = f.start().await;
    let uri = format!("/messages/{id}");

    let (status, posted) = f
        .call(
            "POST",
            &uri,
            Some(&f.alice.1),
            Some(json!({ "nonce": vec![3u8; 24], "ciphertext": vec![4u8; 20] })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(posted["sender"]["username"], "alice");

    let (status, history) = f.call("GET", &uri, Some(&f.bob.1), None).await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["id"], posted["id"]);
    assert_eq!(history[0]["nonce"], json!(vec![3u8; 24]));

    let (status, listed) = f.call("GET", "/conversations", Some(&f.bob.1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed[0]["updatedAt"], posted["createdAt"]);
}

#[tokio::test]
async fn payload_limits_are_enforced() {
    let f = Fixture::new().await;
    let id = f.start().await;
    let uri = format!("/messages/{id}");

    for (nonce, ct) in [(12usize, 20usize), (24, 4), (24, 257)] {
        let (status, body) = f
            .call(
                "POST",
                &uri,
                Some(&f.alice.1),
                Some(json!({ "nonce": vec![0u8; nonce], "ciphertext": vec![0u8; ct] })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "nonce {nonce} ct {ct}");
        assert_eq!(body["error"], "invalid_operation");
    }
}

#[tokio::test]
async fn outsiders_get_not_found() {
    let f = Fixture::new().await;
    let id = f.start().await;
    let (_, mallory) = Fixture::user(&f.server, "mallory").await;

    for uri in [format!("/conversations/{id}"), format!("/messages/{id}")] {
        let (status, body) = f.call("GET", &uri, Some(&mallory), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }
    let (status, _) = f
        .call(
            "POST",
            &format!("/messages/{id}"),
            Some(&mallory),
            Some(json!({ "nonce": vec![0u8; 24], "ciphertext": vec![0u8; 16] })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, listed) = f.call("GET", "/conversations", Some(&mallory), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn users_lists_everyone_else() {
    let f = Fixture::new().await;
    let (status, body) = f.call("GET", "/users", Some(&f.alice.1), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{ "id": f.bob.0.id, "username": "bob" }]));

    let (status, _) = f.call("GET", "/keys/not-a-uuid", Some(&f.alice.1), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
