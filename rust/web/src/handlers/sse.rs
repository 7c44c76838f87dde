use super::game::ViewerQuery;
use crate::challenge::ChallengeError;
use crate::errors::IntoErrorResponse;
use crate::events::Event;
use crate::gateway::Gateway;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tavern_engine::session::SessionId;
use tokio_stream::{Stream, StreamExt};
use warp::http;
use warp::reply::{self, Response};
use warp::sse;
use warp::Reply;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
pub struct LobbyQuery {
    #[serde(default)]
    pub user: String,
    pub name: Option<String>,
}

/// GET `/api/sessions/{id}/events?participant=..`
///
/// The first event is always `connected` with the full session view. The
/// participant stays live for as long as the response is open.
pub async fn session_events(
    gateway: Arc<Gateway>,
    session_id: SessionId,
    query: ViewerQuery,
) -> Response {
    match gateway.attach_session(&session_id, query.participant.as_deref()) {
        Ok(stream) => sse_response(stream),
        Err(err) => err.into_http_response(),
    }
}

/// GET `/api/lobby/events?user=..&name=..`
pub async fn lobby_events(gateway: Arc<Gateway>, query: LobbyQuery) -> Response {
    if query.user.trim().is_empty() {
        return ChallengeError::InvalidRequest("`user` query parameter is required".into())
            .into_http_response();
    }
    match gateway.attach_lobby(&query.user, query.name.as_deref()) {
        Ok(stream) => sse_response(stream),
        Err(err) => err.into_http_response(),
    }
}

fn sse_response<S>(events: S) -> Response
where
    S: Stream<Item = Event> + Send + 'static,
{
    let stream = events.map(|event| Ok::<_, Infallible>(render_event(&event)));
    let keep_alive = sse::keep_alive()
        .interval(KEEP_ALIVE_INTERVAL)
        .text(":keep-alive\n");

    let reply = sse::reply(keep_alive.stream(stream));
    reply::with_header(reply, http::header::CACHE_CONTROL, "no-cache").into_response()
}

fn render_event(event: &Event) -> sse::Event {
    match serde_json::to_string(event) {
        Ok(json) => sse::Event::default().event(event.kind()).data(json),
        Err(err) => {
            tracing::error!(event = event.kind(), error = %err, "failed to serialize stream event");
            let fallback = serde_json::json!({
                "type": "error",
                "message": format!("failed to serialize {} event", event.kind()),
            })
            .to_string();
            sse::Event::default().event("error").data(fallback)
        }
    }
}
