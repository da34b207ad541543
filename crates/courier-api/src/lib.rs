pub mod admin;
pub mod chat;
pub mod error;
pub mod middleware;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tracing::error;

use courier_db::Database;
use courier_gateway::Broker;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub broker: Broker,
    pub jwt_secret: String,
}

/// Every REST route, behind the bearer-token middleware.
pub fn routes(state: AppState) -> Router {
    let chat_routes = Router::new()
        .route("/chat/send", post(chat::send_message))
        .route("/chat/conversations", get(chat::list_conversations))
        .route("/chat/conversations/{conversation_id}/messages", get(chat::get_messages))
        .route("/chat/conversations/{conversation_id}/mark-read", post(chat::mark_read))
        .route("/chat/unread-count", get(chat::unread_count))
        .route("/chat/conversation-id", get(chat::conversation_id));

    let admin_routes = Router::new()
        .route("/admin/users/{user_id}/suspend", post(admin::suspend))
        .route("/admin/users/{user_id}/reinstate", post(admin::reinstate))
        .route("/admin/users/{user_id}/force-logout", post(admin::force_logout));

    chat_routes
        .merge(admin_routes)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state)
}

/// Run a blocking database call off the async runtime.
pub(crate) async fn with_db<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state.db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(e.into())
        })?
        .map_err(ApiError::from)
}
