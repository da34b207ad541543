use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use courier_types::api::{
    Claims, ConversationIdResponse, MarkReadResponse, SendMessageRequest, UnreadCountResponse,
};
use courier_types::models::Role;
use courier_types::{ConversationId, ParticipantId, resolve};

use crate::error::ApiError;
use crate::{AppState, with_db};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: timestamp of the oldest message of the previous page.
    pub before: Option<DateTime<Utc>>,
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct PeerQuery {
    pub peer: ParticipantId,
}

/// Persist a message. The caller publishes the delivery event itself once
/// this returns.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender = claims.sub.clone();
    let stored = with_db(&state, move |db| {
        db.persist_message(&sender, &req.receiver_id, &req.draft)
    })
    .await?;

    debug!("{} sent {} in {}", claims.sub, stored.id, stored.conversation_id);
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = with_db(&state, move |db| db.list_conversations(&claims.sub)).await?;
    Ok(Json(conversations))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_member(&claims, &conversation_id)?;
    let limit = query.limit.clamp(1, 200);
    let messages = with_db(&state, move |db| {
        db.get_messages(&conversation_id, limit, query.before)
    })
    .await?;
    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    if !conversation_id.involves(&claims.sub) {
        return Err(ApiError::Forbidden("not a participant of this conversation".into()));
    }
    let modified_count = with_db(&state, move |db| db.mark_read(&conversation_id, &claims.sub)).await?;
    Ok(Json(MarkReadResponse { modified_count }))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let unread_count = with_db(&state, move |db| db.unread_count(&claims.sub)).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub async fn conversation_id(
    Query(query): Query<PeerQuery>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    Json(ConversationIdResponse {
        conversation_id: resolve(&claims.sub, &query.peer),
    })
}

/// Participants read their own history; admins may read any.
fn ensure_member(claims: &Claims, conversation_id: &ConversationId) -> Result<(), ApiError> {
    if claims.role == Role::Admin || conversation_id.involves(&claims.sub) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("not a participant of this conversation".into()))
    }
}
