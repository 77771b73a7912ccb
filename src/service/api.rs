//! Request API for matchmaking clients
//!
//! Every route trusts the `x-user-id` header written by the upstream token
//! verifier. Domain errors are mapped to status codes through `error_kind`.

use crate::error::{error_kind, ErrorKind};
use crate::service::app::AppState;
use crate::service::sse;
use crate::types::{
    CheckStatus, Difficulty, EloUpdate, HandshakeOutcome, JoinRequest, MatchId, RoomInfo,
    SessionMetrics, UserEloInfo,
};
use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Header carrying the verified caller identity
pub const USER_ID_HEADER: &str = "x-user-id";

/// Build the request API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/matchmaking/join", post(join_handler))
        .route("/matchmaking/cancel", post(cancel_handler))
        .route("/matchmaking/check", get(check_handler))
        .route("/matchmaking/handshake", post(handshake_handler))
        .route("/matchmaking/done", post(done_handler))
        .route("/matchmaking/feedback", post(feedback_handler))
        .route("/matchmaking/rating", get(rating_handler))
        .route("/matchmaking/events", get(sse::events_handler))
        .with_state(state)
}

/// Caller identity taken from the verifier-supplied header
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser(pub String);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ApiError::new(StatusCode::UNAUTHORIZED, "Missing verified user identity")
            })?;

        Ok(AuthenticatedUser(user_id.to_string()))
    }
}

/// Error response with a JSON body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = match error_kind(&err) {
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Expired => StatusCode::GONE,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {:#}", err);
        } else {
            debug!("Request rejected ({}): {}", status, err);
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct JoinBody {
    pub category: String,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub accept_any_category: bool,
}

#[derive(Debug, Deserialize)]
pub struct HandshakeBody {
    pub match_id: MatchId,
    pub accept: bool,
}

#[derive(Debug, Deserialize)]
pub struct DoneBody {
    pub match_id: MatchId,
}

/// Handshake result as seen by the caller
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum HandshakeResponse {
    Waiting,
    RoomReady {
        match_id: MatchId,
        opponent_id: String,
        category: String,
        difficulty: Difficulty,
        token: String,
        question_id: Option<String>,
    },
    Rejected,
}

impl HandshakeResponse {
    fn for_user(outcome: HandshakeOutcome, user_id: &str) -> Self {
        match outcome {
            HandshakeOutcome::Waiting => HandshakeResponse::Waiting,
            HandshakeOutcome::Rejected => HandshakeResponse::Rejected,
            HandshakeOutcome::RoomReady(room) => Self::room_ready(room, user_id),
        }
    }

    fn room_ready(room: RoomInfo, user_id: &str) -> Self {
        match room.role_of(user_id) {
            Some(role) => HandshakeResponse::RoomReady {
                opponent_id: room.opponent(role).clone(),
                token: room.token(role).to_string(),
                match_id: room.match_id,
                category: room.category,
                difficulty: room.difficulty,
                question_id: room.question_id,
            },
            // Coordinator only returns rooms the caller belongs to
            None => HandshakeResponse::Waiting,
        }
    }
}

async fn join_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(body): Json<JoinBody>,
) -> ApiResult<impl IntoResponse> {
    let entry = state
        .queue()
        .enqueue(JoinRequest {
            user_id,
            category: body.category,
            difficulty: body.difficulty,
            accept_any_category: body.accept_any_category,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "queued",
            "category": entry.category,
            "difficulty": entry.difficulty,
            "elo_rating": entry.elo_rating,
        })),
    ))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<impl IntoResponse> {
    let removed = state.queue().cancel(&user_id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "removed": removed }))))
}

async fn check_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<Json<CheckStatus>> {
    Ok(Json(state.coordinator().check(&user_id).await?))
}

async fn handshake_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(body): Json<HandshakeBody>,
) -> ApiResult<Json<HandshakeResponse>> {
    let outcome = state
        .coordinator()
        .handshake(&user_id, &body.match_id, body.accept)
        .await?;
    Ok(Json(HandshakeResponse::for_user(outcome, &user_id)))
}

async fn done_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(body): Json<DoneBody>,
) -> ApiResult<impl IntoResponse> {
    let room = state
        .coordinator()
        .finish_room(&user_id, &body.match_id)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "finished", "match_id": room.match_id })),
    ))
}

async fn feedback_handler(
    State(state): State<Arc<AppState>>,
    Json(metrics): Json<SessionMetrics>,
) -> ApiResult<Json<Vec<EloUpdate>>> {
    let updates = state
        .rating_trigger()
        .process_session_metrics(&metrics)
        .await
        .inspect_err(|e| warn!("Session feedback for match {} failed: {}", metrics.match_id, e))?;
    Ok(Json(updates))
}

async fn rating_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<Json<UserEloInfo>> {
    Ok(Json(state.rating_trigger().rating_of(&user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::types::ParticipantMetrics;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> (Router, Arc<AppState>) {
        let state = Arc::new(AppState::in_memory(AppConfig::default()).unwrap());
        (router(state.clone()), state)
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn join_body() -> serde_json::Value {
        json!({ "category": "arrays", "difficulty": "medium" })
    }

    #[tokio::test]
    async fn test_join_then_conflict() {
        let (router, _) = test_router();

        let (status, body) = send(
            &router,
            request("POST", "/matchmaking/join", Some("alice"), join_body()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["elo_rating"], 1500.0);

        let (status, _) = send(
            &router,
            request("POST", "/matchmaking/join", Some("alice"), join_body()),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let (router, _) = test_router();
        let (status, body) = send(
            &router,
            request("POST", "/matchmaking/join", None, join_body()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_check_reflects_queue_state() {
        let (router, _) = test_router();

        let (status, body) = send(
            &router,
            request("GET", "/matchmaking/check", Some("bob"), serde_json::Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queued"], false);
        assert_eq!(body["in_room"], false);

        send(
            &router,
            request("POST", "/matchmaking/join", Some("bob"), join_body()),
        )
        .await;
        let (_, body) = send(
            &router,
            request("GET", "/matchmaking/check", Some("bob"), serde_json::Value::Null),
        )
        .await;
        assert_eq!(body["queued"], true);
        assert_eq!(body["category"], "arrays");

        let (status, _) = send(
            &router,
            request("POST", "/matchmaking/cancel", Some("bob"), serde_json::Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (_, body) = send(
            &router,
            request("GET", "/matchmaking/check", Some("bob"), serde_json::Value::Null),
        )
        .await;
        assert_eq!(body["queued"], false);
    }

    #[tokio::test]
    async fn test_handshake_unknown_match_is_not_found() {
        let (router, _) = test_router();
        let (status, _) = send(
            &router,
            request(
                "POST",
                "/matchmaking/handshake",
                Some("carol"),
                json!({ "match_id": "missing", "accept": true }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_handshake_flow_over_http() {
        let (router, state) = test_router();
        for user in ["u1", "u2"] {
            send(
                &router,
                request("POST", "/matchmaking/join", Some(user), join_body()),
            )
            .await;
        }
        assert_eq!(state.matchmaking_loop().tick().await.unwrap(), 1);

        let (_, check) = send(
            &router,
            request("GET", "/matchmaking/check", Some("u1"), serde_json::Value::Null),
        )
        .await;
        assert_eq!(check["pending"], true);
        let match_id = check["room_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &router,
            request(
                "POST",
                "/matchmaking/handshake",
                Some("u1"),
                json!({ "match_id": match_id, "accept": true }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "waiting");

        let (_, body) = send(
            &router,
            request(
                "POST",
                "/matchmaking/handshake",
                Some("u2"),
                json!({ "match_id": match_id, "accept": true }),
            ),
        )
        .await;
        assert_eq!(body["status"], "room-ready");
        assert_eq!(body["opponent_id"], "u1");
        assert_eq!(body["match_id"], match_id.as_str());

        let (status, _) = send(
            &router,
            request(
                "POST",
                "/matchmaking/done",
                Some("u1"),
                json!({ "match_id": match_id }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        // Both users may queue again once the room is finished
        let (status, _) = send(
            &router,
            request("POST", "/matchmaking/join", Some("u2"), join_body()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_feedback_updates_ratings() {
        let (router, _) = test_router();
        let metrics = SessionMetrics {
            session_id: "s1".to_string(),
            match_id: "m1".to_string(),
            user1_id: "dana".to_string(),
            user2_id: "eli".to_string(),
            difficulty: "hard".to_string(),
            session_duration_sec: 1800,
            user1_metrics: ParticipantMetrics {
                voice_used: true,
                voice_duration_sec: 900,
                code_changes: 40,
                messages_exchanged: 20,
            },
            user2_metrics: ParticipantMetrics::default(),
        };

        let (status, body) = send(
            &router,
            request(
                "POST",
                "/matchmaking/feedback",
                None,
                serde_json::to_value(&metrics).unwrap(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let updates: Vec<EloUpdate> = serde_json::from_value(body).unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates[0].new_rating > updates[1].new_rating);

        let (_, rating) = send(
            &router,
            request("GET", "/matchmaking/rating", Some("dana"), serde_json::Value::Null),
        )
        .await;
        assert_eq!(rating["sessions_completed"], 1);
        assert_eq!(rating["elo_rating"], updates[0].new_rating);

        // A retried delivery is answered with the original updates
        let (status, body) = send(
            &router,
            request(
                "POST",
                "/matchmaking/feedback",
                None,
                serde_json::to_value(&metrics).unwrap(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let replayed: Vec<EloUpdate> = serde_json::from_value(body).unwrap();
        assert_eq!(replayed, updates);

        let (_, rating) = send(
            &router,
            request("GET", "/matchmaking/rating", Some("dana"), serde_json::Value::Null),
        )
        .await;
        assert_eq!(rating["sessions_completed"], 1);
    }

    #[test]
    fn test_error_status_mapping() {
        let err: anyhow::Error = crate::error::MatchmakingError::MatchExpired {
            match_id: "m".to_string(),
        }
        .into();
        assert_eq!(ApiError::from(err).status(), StatusCode::GONE);

        let err: anyhow::Error = crate::error::MatchmakingError::StoreUnavailable {
            message: "down".to_string(),
        }
        .into();
        assert_eq!(
            ApiError::from(err).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
