pub mod game;
pub mod health;
pub mod history;
pub mod lobby;
pub mod settings;
pub mod sse;

use serde::Serialize;
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::Reply;

pub use game::{
    abandon_session, claim_win, forfeit, get_session, heartbeat, leave, submit_move,
    AbandonQuery, MoveRequest, MoveResponse, ParticipantRequest, ViewerQuery,
};
pub use health::health;
pub use history::{get_history_stats, get_recent_sessions, HistoryQuery, StatsQuery};
pub use lobby::{
    create_challenge, depart, list_online, pending_challenges, presence_heartbeat,
    respond_to_challenge, CreateChallengeRequest, PendingQuery, PresenceRequest,
    RespondRequest,
};
pub use settings::get_settings;
pub use sse::{lobby_events, session_events, LobbyQuery};

pub(crate) fn success_response<T>(status: StatusCode, body: T) -> Response
where
    T: Serialize,
{
    reply::with_status(reply::json(&body), status).into_response()
}
