//! Lobby endpoints: presence heartbeats and the challenge handshake.

use super::success_response;
use crate::challenge::{ChallengeBroker, ChallengeError};
use crate::errors::IntoErrorResponse;
use crate::presence::{PresenceRegistry, PresenceStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tavern_engine::game::{GameKind, GameOptions};
use warp::http::StatusCode;
use warp::reply::Response;

#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    #[serde(default)]
    pub user_id: String,
    pub display_name: Option<String>,
    pub status: Option<PresenceStatus>,
    pub current_app: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateChallengeRequest {
    #[serde(default)]
    pub initiator: String,
    #[serde(default)]
    pub targets: Vec<String>,
    pub game: GameKind,
    #[serde(default)]
    pub options: GameOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct PendingQuery {
    #[serde(default)]
    pub user: String,
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    #[serde(default)]
    pub user_id: String,
    pub accept: bool,
}

#[derive(Debug, Serialize)]
struct DepartResponse {
    user_id: String,
    removed: bool,
}

/// POST `/api/lobby/presence`
///
/// Upserts the caller's presence; omitted fields keep their previous values.
pub async fn presence_heartbeat(
    presence: Arc<PresenceRegistry>,
    request: PresenceRequest,
) -> Response {
    match presence.heartbeat(
        &request.user_id,
        request.display_name.as_deref(),
        request.status,
        request.current_app,
    ) {
        Ok(record) => success_response(StatusCode::OK, record),
        Err(err) => err.into_http_response(),
    }
}

pub async fn list_online(presence: Arc<PresenceRegistry>) -> Response {
    match presence.list_online() {
        Ok(online) => success_response(StatusCode::OK, online),
        Err(err) => err.into_http_response(),
    }
}

pub async fn depart(presence: Arc<PresenceRegistry>, user_id: String) -> Response {
    match presence.depart(&user_id) {
        Ok(removed) => success_response(StatusCode::OK, DepartResponse { user_id, removed }),
        Err(err) => err.into_http_response(),
    }
}

/// Issues a challenge to one or more users.
///
/// # HTTP Method and Path
/// - **Method**: POST
/// - **Path**: `/api/lobby/challenges`
///
/// # Request Format
/// ```json
/// { "initiator": "ann", "targets": ["ben"], "game": "tic_tac_toe", "options": { "best_of": 3 } }
/// ```
///
/// # Response Format
/// - **Success (201 Created)**: the pending challenge; every target also
///   receives `challenge_received` on their lobby stream
/// - **Error (400)**: `invalid_challenge` or `invalid_setup` when the
///   party size or options do not suit the game
pub async fn create_challenge(
    challenges: Arc<ChallengeBroker>,
    request: CreateChallengeRequest,
) -> Response {
    match challenges.create(
        &request.initiator,
        request.targets,
        request.game,
        request.options,
    ) {
        Ok(challenge) => success_response(StatusCode::CREATED, challenge),
        Err(err) => err.into_http_response(),
    }
}

pub async fn pending_challenges(challenges: Arc<ChallengeBroker>, query: PendingQuery) -> Response {
    if query.user.trim().is_empty() {
        return ChallengeError::InvalidRequest("`user` query parameter is required".into())
            .into_http_response();
    }
    match challenges.pending_for(&query.user) {
        Ok(pending) => success_response(StatusCode::OK, pending),
        Err(err) => err.into_http_response(),
    }
}

/// POST `/api/lobby/challenges/{id}/respond`
///
/// Records one target's answer. The last acceptance starts the session and
/// the returned challenge carries its `session_id`.
pub async fn respond_to_challenge(
    challenges: Arc<ChallengeBroker>,
    challenge_id: String,
    request: RespondRequest,
) -> Response {
    match challenges.respond(&challenge_id, &request.user_id, request.accept) {
        Ok(challenge) => success_response(StatusCode::OK, challenge),
        Err(err) => err.into_http_response(),
    }
}
