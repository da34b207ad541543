pub mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use courier_api::{AppState, AppStateInner};
use courier_db::Database;
use courier_gateway::{Broker, connection};

/// Shared state for a server instance.
pub fn app_state(db: Database, jwt_secret: String) -> AppState {
    Arc::new(AppStateInner {
        db,
        broker: Broker::new(),
        jwt_secret,
    })
}

/// REST routes plus the gateway WebSocket at `/gateway`.
pub fn build_router(state: AppState) -> Router {
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state.broker.clone());

    Router::new()
        .merge(courier_api::routes(state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(broker): State<Broker>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, broker))
}
