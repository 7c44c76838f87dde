use super::success_response;
use crate::errors::IntoErrorResponse;
use crate::session::{SessionManager, SessionView};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tavern_engine::game::Move;
use tavern_engine::session::{ParticipantId, RoundSummary, SessionId};
use warp::http::StatusCode;
use warp::reply::Response;

const DEFAULT_ABANDON_REASON: &str = "abandoned";

#[derive(Debug, Default, Deserialize)]
pub struct ViewerQuery {
    pub participant: Option<ParticipantId>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AbandonQuery {
    pub participant: Option<ParticipantId>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    #[serde(default)]
    pub participant_id: ParticipantId,
    #[serde(rename = "move")]
    pub action: Move,
}

#[derive(Debug, Deserialize)]
pub struct ParticipantRequest {
    #[serde(default)]
    pub participant_id: ParticipantId,
}

#[derive(Debug, Serialize)]
pub struct MoveResponse {
    pub session: SessionView,
    pub points: u32,
    pub extra_turn: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<RoundSummary>,
    pub completed: bool,
}

#[derive(Debug, Serialize)]
struct ConnectionResponse {
    participant_id: ParticipantId,
    /// Heartbeat: the participant was not live before this call.
    /// Leave: a connection record was removed.
    changed: bool,
}

/// Returns the public view of a session.
///
/// # HTTP Method and Path
/// - **Method**: GET
/// - **Path**: `/api/sessions/{session_id}?participant={participant_id}`
///
/// # Response Format
/// - **Success (200 OK)**: the session view, as carried by `state_update`
/// - **Error (401)**: no participant given for a private session
/// - **Error (403)**: the participant is not seated in this session
/// - **Error (404)**: no such session, or it has expired
pub async fn get_session(
    sessions: Arc<SessionManager>,
    session_id: SessionId,
    query: ViewerQuery,
) -> Response {
    match sessions.view(&session_id, query.participant.as_deref()) {
        Ok(view) => success_response(StatusCode::OK, view),
        Err(err) => err.into_http_response(),
    }
}

/// Submits a move on behalf of a participant.
///
/// # HTTP Method and Path
/// - **Method**: POST
/// - **Path**: `/api/sessions/{session_id}/moves`
///
/// # Request Format
/// ```json
/// { "participant_id": "ann", "move": { "kind": "mark", "position": 4 } }
/// ```
/// or, for dots-and-boxes:
/// ```json
/// {
///   "participant_id": "ann",
///   "move": { "kind": "line", "orientation": "horizontal", "row": 0, "col": 1 }
/// }
/// ```
///
/// # Response Format
/// - **Success (200 OK)**: the new session view plus points scored and
///   whether the mover keeps the turn
/// - **Error (409)**: `not_your_turn`, `position_taken`, `invalid_state`
/// - **Error (400)**: `out_of_range`, `wrong_move`
/// - **Error (403)**: `unknown_participant`, `access_denied`
///
/// Every accepted move is also broadcast as `state_update` on the session
/// stream, so callers holding a stream need not use this body.
pub async fn submit_move(
    sessions: Arc<SessionManager>,
    session_id: SessionId,
    request: MoveRequest,
) -> Response {
    match sessions.submit_move(&session_id, &request.participant_id, &request.action) {
        Ok(outcome) => success_response(
            StatusCode::OK,
            MoveResponse {
                session: outcome.session,
                points: outcome.result.points,
                extra_turn: outcome.result.extra_turn,
                round: outcome.result.round,
                completed: outcome.result.completed,
            },
        ),
        Err(err) => err.into_http_response(),
    }
}

pub async fn forfeit(
    sessions: Arc<SessionManager>,
    session_id: SessionId,
    request: ParticipantRequest,
) -> Response {
    match sessions.forfeit(&session_id, &request.participant_id) {
        Ok(view) => success_response(StatusCode::OK, view),
        Err(err) => err.into_http_response(),
    }
}

/// Ends the session in the claimant's favour once every opponent has been
/// silent past the staleness window. Refused with 409 `not_eligible`
/// otherwise.
pub async fn claim_win(
    sessions: Arc<SessionManager>,
    session_id: SessionId,
    request: ParticipantRequest,
) -> Response {
    match sessions.claim_win(&session_id, &request.participant_id) {
        Ok(view) => success_response(StatusCode::OK, view),
        Err(err) => err.into_http_response(),
    }
}

pub async fn heartbeat(
    sessions: Arc<SessionManager>,
    session_id: SessionId,
    request: ParticipantRequest,
) -> Response {
    match sessions.heartbeat(&session_id, &request.participant_id) {
        Ok(changed) => success_response(
            StatusCode::OK,
            ConnectionResponse {
                participant_id: request.participant_id,
                changed,
            },
        ),
        Err(err) => err.into_http_response(),
    }
}

pub async fn leave(
    sessions: Arc<SessionManager>,
    session_id: SessionId,
    request: ParticipantRequest,
) -> Response {
    match sessions.leave(&session_id, &request.participant_id) {
        Ok(changed) => success_response(
            StatusCode::OK,
            ConnectionResponse {
                participant_id: request.participant_id,
                changed,
            },
        ),
        Err(err) => err.into_http_response(),
    }
}

/// DELETE `/api/sessions/{session_id}?participant=..&reason=..`
///
/// Marks the session abandoned without a winner.
pub async fn abandon_session(
    sessions: Arc<SessionManager>,
    session_id: SessionId,
    query: AbandonQuery,
) -> Response {
    let participant = query.participant.unwrap_or_default();
    let reason = query
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ABANDON_REASON.to_string());
    match sessions.abandon(&session_id, &participant, &reason) {
        Ok(view) => success_response(StatusCode::OK, view),
        Err(err) => err.into_http_response(),
    }
}
