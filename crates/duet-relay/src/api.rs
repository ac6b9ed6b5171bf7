//! HTTP API endpoints

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use tokio::sync::watch;

use duet_proto::{
    ConversationId, ConversationView, KeyResponse, MessageView, PostMessageRequest,
    PublishKeyRequest, StartConversationRequest, UserId, UserSummary,
};

use crate::auth::{auth_middleware, AuthUser, TokenVerifier};
use crate::config::ServerConfig;
use crate::directory::KeyDirectory;
use crate::error::RelayError;
use crate::hub::ChannelHub;
use crate::metrics::RelayMetrics;
use crate::relay::ConversationRelay;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<KeyDirectory>,
    pub relay: Arc<ConversationRelay>,
    pub hub: Arc<ChannelHub>,
    pub auth: Arc<TokenVerifier>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<RelayMetrics>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn Store>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, prometheus::Error> {
        let metrics = Arc::new(RelayMetrics::new()?);
        let hub = Arc::new(ChannelHub::new(config.outbound_queue_len, metrics.clone()));
        Ok(Self {
            directory: Arc::new(KeyDirectory::new(store.clone(), metrics.clone())),
            relay: Arc::new(ConversationRelay::new(
                store.clone(),
                hub.clone(),
                metrics.clone(),
                config.max_ciphertext_bytes,
            )),
            hub,
            auth: Arc::new(TokenVerifier::new(config.jwt_secret.as_bytes())),
            store,
            metrics,
            shutdown,
        })
    }
}

/// Create API router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/keys", axum::routing::post(publish_key))
        .route("/keys/:user_id", get(lookup_key))
        .route("/users", get(list_users))
        .route("/conversations", get(list_conversations).post(start_conversation))
        .route("/conversations/:conversation_id", get(get_conversation))
        .route("/messages/:conversation_id", get(get_history).post(post_message))
        .route("/ws", get(crate::ws::ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(protected)
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, RelayError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| RelayError::InvalidOperation(e.body_text()))
}

fn parse_id<T: FromStr>(raw: &str) -> Result<T, RelayError> {
    raw.parse()
        .map_err(|_| RelayError::InvalidOperation("malformed identifier".to_string()))
}

/// POST /keys
async fn publish_key(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<PublishKeyRequest>, JsonRejection>,
) -> Result<StatusCode, RelayError> {
    let request = body(payload)?;
    state
        .directory
        .publish(user.id(), &request.public_key_material)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /keys/:user_id
async fn lookup_key(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<KeyResponse>, RelayError> {
    let user_id: UserId = parse_id(&user_id)?;
    let public_key_material = state.directory.lookup(user_id).await?;
    Ok(Json(KeyResponse { public_key_material }))
}

/// GET /users
async fn list_users(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<UserSummary>>, RelayError> {
    Ok(Json(state.relay.list_users(user.id()).await?))
}

/// GET /conversations
async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<ConversationView>>, RelayError> {
    Ok(Json(state.relay.list_for_user(user.id()).await?))
}

/// POST /conversations - 201 when created, 200 when it already existed
async fn start_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<StartConversationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ConversationView>), RelayError> {
    let request = body(payload)?;
    let (conversation, created) = state.relay.create_or_get(user.id(), request.peer_id).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(conversation)))
}

/// GET /conversations/:conversation_id
async fn get_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationView>, RelayError> {
    let conversation_id: ConversationId = parse_id(&conversation_id)?;
    Ok(Json(state.relay.get(user.id(), conversation_id).await?))
}

/// GET /messages/:conversation_id
async fn get_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<MessageView>>, RelayError> {
    let conversation_id: ConversationId = parse_id(&conversation_id)?;
    Ok(Json(state.relay.fetch_history(user.id(), conversation_id).await?))
}

/// POST /messages/:conversation_id - non-live path, still broadcast
async fn post_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<String>,
    payload: Result<Json<PostMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageView>), RelayError> {
    let conversation_id: ConversationId = parse_id(&conversation_id)?;
    let request = body(payload)?;
    let message = state
        .relay
        .append_message(conversation_id, user.id(), request.nonce, request.ciphertext)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /health
async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.hub.connection_count(),
    }))
}

/// GET /metrics
async fn get_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.export_prometheus() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => RelayError::Internal(e.to_string()).into_response(),
    }
}
