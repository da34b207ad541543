//! Privileged account actions. Each one updates the store first and then
//! pushes a control signal to the target's identity channel.

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use tracing::info;

use courier_types::ParticipantId;
use courier_types::api::{AdminActionResponse, Claims};
use courier_types::events::ControlSignal;
use courier_types::models::Role;

use crate::error::ApiError;
use crate::{AppState, with_db};

const SUSPENDED_NOTICE: &str = "Your account has been suspended by an admin";
const FORCE_LOGOUT_NOTICE: &str = "You have been forcefully logged out by an administrator";

pub async fn suspend(
    State(state): State<AppState>,
    Path(user_id): Path<ParticipantId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_admin(&claims)?;
    set_suspended(&state, &user_id, true).await?;

    let connections = state
        .broker
        .send_control(
            &user_id,
            ControlSignal::Suspended {
                message: SUSPENDED_NOTICE.into(),
            },
        )
        .await;
    info!("{} suspended {}", claims.sub, user_id);

    Ok(Json(AdminActionResponse {
        message: "User has been suspended".into(),
        connections,
    }))
}

/// Lift a suspension. No signal is sent; the user simply signs in again.
pub async fn reinstate(
    State(state): State<AppState>,
    Path(user_id): Path<ParticipantId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_admin(&claims)?;
    set_suspended(&state, &user_id, false).await?;
    info!("{} reinstated {}", claims.sub, user_id);

    Ok(Json(AdminActionResponse {
        message: "User has been reinstated".into(),
        connections: 0,
    }))
}

pub async fn force_logout(
    State(state): State<AppState>,
    Path(user_id): Path<ParticipantId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_admin(&claims)?;
    let target = user_id.clone();
    let found = with_db(&state, move |db| {
        db.record_force_logout(&target, chrono::Utc::now())
    })
    .await?;
    if !found {
        return Err(ApiError::NotFound("User not found".into()));
    }

    let connections = state
        .broker
        .send_control(
            &user_id,
            ControlSignal::ForceLogout {
                message: FORCE_LOGOUT_NOTICE.into(),
            },
        )
        .await;
    info!("{} forced {} to log out", claims.sub, user_id);

    Ok(Json(AdminActionResponse {
        message: "User has been forcefully logged out".into(),
        connections,
    }))
}

fn ensure_admin(claims: &Claims) -> Result<(), ApiError> {
    if claims.role == Role::Admin {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Admin access required".into()))
    }
}

async fn set_suspended(state: &AppState, user_id: &ParticipantId, suspended: bool) -> Result<(), ApiError> {
    let target = user_id.clone();
    let found = with_db(state, move |db| db.set_suspended(&target, suspended)).await?;
    if found {
        Ok(())
    } else {
        Err(ApiError::NotFound("User not found".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use courier_db::Database;
    use courier_gateway::Broker;
    use courier_types::events::ServerEvent;

    use super::*;
    use crate::middleware::create_token;
    use crate::{AppStateInner, routes};

    const SECRET: &str = "test-secret";

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn state() -> AppState {
        let db = Database::open_in_memory().unwrap();
        db.create_user(&pid("Root"), "Root", Role::Admin).unwrap();
        db.create_user(&pid("U1"), "Uma", Role::User).unwrap();
        Arc::new(AppStateInner {
            db,
            broker: Broker::new(),
            jwt_secret: SECRET.into(),
        })
    }

    fn post(uri: &str, id: &str, role: Role) -> Request<Body> {
        let token = create_token(SECRET, &pid(id), id, role).unwrap();
        Request::post(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn suspend_updates_store_and_signals_live_connections() {
        let state = state();
        let (conn, mut rx) = state.broker.connect().await;
        state.broker.identify(conn, pid("U1"), Role::User).await;
        while rx.try_recv().is_ok() {}

        let response = routes(state.clone())
            .oneshot(post("/admin/users/U1/suspend", "Root", Role::Admin))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let user = state.db.get_user(&pid("U1")).unwrap().unwrap();
        assert!(user.suspended);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::UserSuspended {
                message: SUSPENDED_NOTICE.into()
            }
        );
    }

    #[tokio::test]
    async fn non_admins_are_forbidden() {
        let state = state();
        let response = routes(state.clone())
            .oneshot(post("/admin/users/U1/force-logout", "U1", Role::User))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!state.db.get_user(&pid("U1")).unwrap().unwrap().suspended);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let response = routes(state())
            .oneshot(post("/admin/users/Ghost/force-logout", "Root", Role::Admin))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
