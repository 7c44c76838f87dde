use super::success_response;
use crate::errors::IntoErrorResponse;
use crate::history::HistoryStore;
use serde::Deserialize;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub participant: Option<String>,
}

/// GET /api/history?limit=N
/// Finalized sessions, newest first.
pub async fn get_recent_sessions(history: Arc<HistoryStore>, query: HistoryQuery) -> Response {
    match history.get_recent(query.limit) {
        Ok(records) => success_response(StatusCode::OK, records),
        Err(err) => err.into_http_response(),
    }
}

/// GET /api/history/stats?participant=ID
pub async fn get_history_stats(history: Arc<HistoryStore>, query: StatsQuery) -> Response {
    let participant = query.participant.as_deref().filter(|p| !p.trim().is_empty());
    match history.stats(participant) {
        Ok(stats) => success_response(StatusCode::OK, stats),
        Err(err) => err.into_http_response(),
    }
}
