//! REST API handlers.
//!
//! Every endpoint answers with the same `{ ok, data, error }` envelope.
//! Failures come back as [`Error`], which renders the envelope itself.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::dispatch::DeliveryOutcome;
use crate::error::{Error, Result};
use crate::messaging::{SendMessageRequest, SendOutcome};
use crate::protocol::{ParticipantKey, Role};
use crate::state::RelayState;
use crate::store::{ConversationRecord, MessageRecord};

// ── Request / Response Types ─────────────────────────────────────────────────

/// POST /api/conversations
#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub user_id: i64,
    pub shop_id: i64,
}

/// GET /api/messages/conversation/:id/new?since=
#[derive(Debug, Deserialize)]
pub struct NewMessagesQuery {
    /// Milliseconds since the epoch. Only strictly newer messages are returned.
    pub since: i64,
}

/// PUT /api/messages/:id
#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

/// POST /api/notifications
#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    pub role: Role,
    pub id: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub outcome: DeliveryOutcome,
}

/// Generic response envelope.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Json<Self> {
        Json(Self {
            ok: true,
            data: Some(data),
            error: None,
        })
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>>;

// ── Router ───────────────────────────────────────────────────────────────────

/// All `/api` routes.
pub fn routes() -> Router<RelayState> {
    Router::new()
        .route("/api/messages/from-user", post(send_from_user))
        .route("/api/messages/from-shop", post(send_from_shop))
        .route(
            "/api/messages/conversation/:id",
            get(conversation_messages),
        )
        .route("/api/messages/conversation/:id/new", get(new_messages))
        .route(
            "/api/messages/user/:user_id/shop/:shop_id",
            get(messages_between),
        )
        .route(
            "/api/messages/:id",
            put(edit_message).delete(delete_message),
        )
        .route("/api/conversations", post(create_conversation))
        .route("/api/conversations/all", get(all_conversations))
        .route("/api/conversations/user/:id", get(user_conversations))
        .route("/api/conversations/shop/:id", get(shop_conversations))
        .route("/api/conversations/unseen-admin", get(unseen_admin))
        .route("/api/conversations/:id", axum::routing::delete(delete_conversation))
        .route("/api/conversations/:id/last-message", get(last_message))
        .route("/api/conversations/:id/set-is-seen", put(set_is_seen))
        .route(
            "/api/conversations/:id/set-is-adminseen",
            put(set_is_admin_seen),
        )
        .route("/api/notifications", post(notify))
        .route("/api/hub/hub-url", get(hub_url))
}

// ── Messages ─────────────────────────────────────────────────────────────────

fn send_as(state: &RelayState, sender: Role, req: SendMessageRequest) -> Result<Response> {
    let sent: SendOutcome = state.messages.send_message(sender, req)?;
    Ok((StatusCode::CREATED, ApiResponse::success(sent)).into_response())
}

/// POST /api/messages/from-user: A user writes to a shop.
pub async fn send_from_user(
    State(state): State<RelayState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Response> {
    send_as(&state, Role::User, req)
}

/// POST /api/messages/from-shop: A shop writes to a user.
pub async fn send_from_shop(
    State(state): State<RelayState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Response> {
    send_as(&state, Role::Shop, req)
}

/// GET /api/messages/conversation/:id: Full history, oldest first.
pub async fn conversation_messages(
    State(state): State<RelayState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<MessageRecord>> {
    state.store.require_conversation(id)?;
    Ok(ApiResponse::success(state.store.messages_for_conversation(id)?))
}

/// GET /api/messages/conversation/:id/new: Messages newer than `since`.
/// 204 when there is nothing new, so polling clients can skip parsing.
pub async fn new_messages(
    State(state): State<RelayState>,
    Path(id): Path<i64>,
    Query(query): Query<NewMessagesQuery>,
) -> Result<Response> {
    state.store.require_conversation(id)?;
    let messages = state.store.messages_since(id, query.since)?;
    if messages.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(ApiResponse::success(messages).into_response())
}

/// GET /api/messages/user/:user_id/shop/:shop_id: Newest first.
pub async fn messages_between(
    State(state): State<RelayState>,
    Path((user_id, shop_id)): Path<(i64, i64)>,
) -> ApiResult<Vec<MessageRecord>> {
    Ok(ApiResponse::success(
        state.store.messages_between(user_id, shop_id)?,
    ))
}

/// PUT /api/messages/:id: Replace message content.
pub async fn edit_message(
    State(state): State<RelayState>,
    Path(id): Path<i64>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<MessageRecord> {
    Ok(ApiResponse::success(
        state.messages.edit_message(id, &req.content)?,
    ))
}

/// DELETE /api/messages/:id
pub async fn delete_message(
    State(state): State<RelayState>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.store.delete_message(id)?;
    tracing::info!(message_id = id, "Message deleted");
    Ok(ApiResponse::success(json!({ "id": id })))
}

// ── Conversations ────────────────────────────────────────────────────────────

/// POST /api/conversations: Open a conversation between a user and a shop.
pub async fn create_conversation(
    State(state): State<RelayState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Response> {
    let conversation = state.store.create_conversation(
        req.user_id,
        req.shop_id,
        Utc::now().timestamp_millis(),
    )?;
    tracing::info!(
        conversation_id = conversation.id,
        user_id = req.user_id,
        shop_id = req.shop_id,
        "Conversation created"
    );
    Ok((StatusCode::CREATED, ApiResponse::success(conversation)).into_response())
}

/// GET /api/conversations/all
pub async fn all_conversations(
    State(state): State<RelayState>,
) -> ApiResult<Vec<ConversationRecord>> {
    Ok(ApiResponse::success(state.store.all_conversations()?))
}

/// GET /api/conversations/user/:id
pub async fn user_conversations(
    State(state): State<RelayState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<ConversationRecord>> {
    Ok(ApiResponse::success(state.store.conversations_for_user(id)?))
}

/// GET /api/conversations/shop/:id
pub async fn shop_conversations(
    State(state): State<RelayState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<ConversationRecord>> {
    Ok(ApiResponse::success(state.store.conversations_for_shop(id)?))
}

/// GET /api/conversations/unseen-admin: Conversations with a user message
/// the shop side has not seen yet.
pub async fn unseen_admin(
    State(state): State<RelayState>,
) -> ApiResult<Vec<ConversationRecord>> {
    Ok(ApiResponse::success(state.store.unseen_for_admin()?))
}

/// GET /api/conversations/:id/last-message
pub async fn last_message(
    State(state): State<RelayState>,
    Path(id): Path<i64>,
) -> ApiResult<Option<MessageRecord>> {
    state.store.require_conversation(id)?;
    Ok(ApiResponse::success(state.store.last_message(id)?))
}

/// PUT /api/conversations/:id/set-is-seen: The user opened the conversation.
pub async fn set_is_seen(
    State(state): State<RelayState>,
    Path(id): Path<i64>,
) -> ApiResult<ConversationRecord> {
    state.seen.mark_seen(id, Role::User)?;
    Ok(ApiResponse::success(state.store.require_conversation(id)?))
}

/// PUT /api/conversations/:id/set-is-adminseen: The shop opened the conversation.
pub async fn set_is_admin_seen(
    State(state): State<RelayState>,
    Path(id): Path<i64>,
) -> ApiResult<ConversationRecord> {
    state.seen.mark_seen(id, Role::Shop)?;
    Ok(ApiResponse::success(state.store.require_conversation(id)?))
}

/// DELETE /api/conversations/:id: Removes the conversation and its messages.
pub async fn delete_conversation(
    State(state): State<RelayState>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    let deleted_messages = state.store.delete_conversation(id)?;
    Ok(ApiResponse::success(json!({
        "id": id,
        "deleted_messages": deleted_messages,
    })))
}

// ── Notifications / Hub ──────────────────────────────────────────────────────

/// POST /api/notifications: Push a notification to a participant if online.
pub async fn notify(
    State(state): State<RelayState>,
    Json(req): Json<NotificationRequest>,
) -> ApiResult<NotificationResponse> {
    if req.message.trim().is_empty() {
        return Err(Error::InvalidContent(
            "Notification message is required.".to_string(),
        ));
    }
    let outcome = state
        .dispatcher
        .notify(ParticipantKey::new(req.role, req.id), &req.message);
    Ok(ApiResponse::success(NotificationResponse { outcome }))
}

/// GET /api/hub/hub-url: Where clients should open their WebSocket.
pub async fn hub_url(State(state): State<RelayState>) -> ApiResult<serde_json::Value> {
    Ok(ApiResponse::success(json!({
        "url": state.config.public_url,
    })))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::presence::ConnectionHandle;
    use crate::protocol::ServerMessage;
    use crate::state::RelayConfig;
    use crate::store::Store;

    fn setup() -> (RelayState, Router) {
        let state = RelayState::new(RelayConfig::default(), Store::open(None).unwrap());
        let app = routes().with_state(state.clone());
        (state, app)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_send_from_user_flow() {
        let (state, app) = setup();
        let (status, body) = call(
            &app,
            "POST",
            "/api/conversations",
            Some(json!({ "user_id": 1, "shop_id": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let conversation_id = body["data"]["id"].as_i64().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        state
            .presence
            .connect(ParticipantKey::shop(5), ConnectionHandle::new(tx));

        let (status, body) = call(
            &app,
            "POST",
            "/api/messages/from-user",
            Some(json!({
                "user_id": 1,
                "shop_id": 5,
                "content": "is this still available?",
                "conversation_id": conversation_id,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["outcome"], "delivered");
        assert_eq!(body["data"]["message"]["is_user"], true);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::ReceiveMessage { .. }
        ));

        let (status, body) = call(
            &app,
            "GET",
            &format!("/api/messages/conversation/{}", conversation_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let conv = state.store.require_conversation(conversation_id).unwrap();
        assert!(conv.is_admin_seen);
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_404() {
        let (state, app) = setup();
        let (status, body) = call(
            &app,
            "POST",
            "/api/messages/from-shop",
            Some(json!({
                "user_id": 1,
                "shop_id": 5,
                "content": "hello",
                "conversation_id": 404,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("404"));
        assert_eq!(state.store.message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_into_other_pairs_conversation_is_400() {
        let (state, app) = setup();
        let conv = state.store.create_conversation(1, 5, 0).unwrap();

        let (status, body) = call(
            &app,
            "POST",
            "/api/messages/from-user",
            Some(json!({
                "user_id": 2,
                "shop_id": 7,
                "content": "hello",
                "conversation_id": conv.id,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert_eq!(state.store.message_count().unwrap(), 0);
        assert!(!state.store.require_conversation(conv.id).unwrap().is_admin_seen);
    }

    #[tokio::test]
    async fn test_empty_content_is_400() {
        let (_state, app) = setup();
        let (status, _) = call(
            &app,
            "POST",
            "/api/messages/from-user",
            Some(json!({ "user_id": 1, "shop_id": 5, "content": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_conversation_is_409() {
        let (_state, app) = setup();
        let body = json!({ "user_id": 1, "shop_id": 5 });
        let (status, _) = call(&app, "POST", "/api/conversations", Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = call(&app, "POST", "/api/conversations", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_set_is_adminseen_leaves_user_flag() {
        let (state, app) = setup();
        let conv = state.store.create_conversation(1, 5, 0).unwrap();

        let (status, body) = call(
            &app,
            "PUT",
            &format!("/api/conversations/{}/set-is-adminseen", conv.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["is_admin_seen"], true);
        assert_eq!(body["data"]["is_seen"], false);

        let (status, _) = call(&app, "PUT", "/api/conversations/999/set-is-seen", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_new_messages_empty_is_204() {
        let (state, app) = setup();
        let conv = state.store.create_conversation(1, 5, 0).unwrap();
        let uri = format!(
            "/api/messages/conversation/{}/new?since={}",
            conv.id,
            Utc::now().timestamp_millis() + 60_000
        );
        let (status, body) = call(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn test_notification_outcome() {
        let (state, app) = setup();
        let request = json!({ "role": "user", "id": 3, "message": "order shipped" });

        let (status, body) = call(&app, "POST", "/api/notifications", Some(request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["outcome"], "offline");

        let (tx, mut rx) = mpsc::unbounded_channel();
        state
            .presence
            .connect(ParticipantKey::user(3), ConnectionHandle::new(tx));
        let (_, body) = call(&app, "POST", "/api/notifications", Some(request)).await;
        assert_eq!(body["data"]["outcome"], "delivered");
        match rx.try_recv().unwrap() {
            ServerMessage::ReceiveNotification { message } => assert_eq!(message, "order shipped"),
            other => panic!("Expected ReceiveNotification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades() {
        let (state, app) = setup();
        let conv = state.store.create_conversation(1, 5, 0).unwrap();
        state
            .messages
            .send_message(
                Role::User,
                SendMessageRequest {
                    user_id: 1,
                    shop_id: 5,
                    content: "hello".into(),
                    conversation_id: Some(conv.id),
                },
            )
            .unwrap();

        let (status, body) = call(
            &app,
            "DELETE",
            &format!("/api/conversations/{}", conv.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["deleted_messages"], 1);
        assert_eq!(state.store.message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hub_url() {
        let (_state, app) = setup();
        let (status, body) = call(&app, "GET", "/api/hub/hub-url", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["url"], "ws://localhost:8080/ws");
    }
}
