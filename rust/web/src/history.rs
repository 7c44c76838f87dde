use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::RwLock;
use tavern_engine::game::GameKind;
use tavern_engine::session::{
    EndReason, Outcome, Participant, Series, Session, SessionId, SessionStatus,
};
use thiserror::Error;

const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_RECENT_LIMIT: usize = 100;

/// Final record of a session, emitted once when it reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub game: GameKind,
    pub status: SessionStatus,
    pub participants: Vec<Participant>,
    pub result: Option<Outcome>,
    pub end_reason: Option<EndReason>,
    /// Points in the final round, by turn slot.
    pub scores: Vec<u32>,
    pub series: Series,
    pub move_count: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: i64,
}

impl SessionRecord {
    pub fn from_session(session: &Session) -> Self {
        let ended_at = session.completed_at.unwrap_or(session.updated_at);
        Self {
            session_id: session.id.clone(),
            game: session.game,
            status: session.status,
            participants: session.participants.clone(),
            result: session.result.clone(),
            end_reason: session.end_reason.clone(),
            scores: session.scores.clone(),
            series: session.series.clone(),
            move_count: session.move_count,
            started_at: session.created_at,
            ended_at,
            duration_secs: ended_at.signed_duration_since(session.created_at).num_seconds(),
        }
    }

    fn includes(&self, participant_id: &str) -> bool {
        self.participants.iter().any(|p| p.id == participant_id)
    }
}

/// Durable destination for finished sessions. The session layer only writes.
pub trait HistorySink: Send + Sync + fmt::Debug {
    fn record(&self, record: SessionRecord) -> Result<(), HistoryError>;
}

/// Bounded in-memory history, newest last.
#[derive(Debug)]
pub struct HistoryStore {
    records: RwLock<VecDeque<SessionRecord>>,
    capacity: usize,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Most recent first.
    pub fn get_recent(&self, limit: Option<usize>) -> Result<Vec<SessionRecord>, HistoryError> {
        let records = self
            .records
            .read()
            .map_err(|_| HistoryError::StoragePoisoned)?;
        let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT);
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    pub fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, HistoryError> {
        let records = self
            .records
            .read()
            .map_err(|_| HistoryError::StoragePoisoned)?;
        Ok(records.iter().find(|r| r.session_id == session_id).cloned())
    }

    /// Totals over every stored record, or over those a participant played.
    pub fn stats(&self, participant_id: Option<&str>) -> Result<HistoryStatistics, HistoryError> {
        let records = self
            .records
            .read()
            .map_err(|_| HistoryError::StoragePoisoned)?;

        let mut stats = HistoryStatistics::default();
        let mut total_duration = 0i64;
        for record in records
            .iter()
            .filter(|r| participant_id.map_or(true, |p| r.includes(p)))
        {
            stats.total_sessions += 1;
            total_duration += record.duration_secs;
            match (&record.status, &record.result) {
                (SessionStatus::Abandoned, _) => stats.abandoned += 1,
                (_, Some(Outcome::Draw)) => stats.draws += 1,
                (_, Some(Outcome::Winner { participant_id: winner })) => {
                    if participant_id.map_or(false, |p| p == winner) {
                        stats.wins += 1;
                    }
                }
                _ => {}
            }
        }

        if stats.total_sessions > 0 {
            stats.avg_duration_secs = total_duration as f64 / stats.total_sessions as f64;
            if participant_id.is_some() {
                stats.win_rate = stats.wins as f64 / stats.total_sessions as f64 * 100.0;
            }
        }
        Ok(stats)
    }

    pub fn len(&self) -> Result<usize, HistoryError> {
        let records = self
            .records
            .read()
            .map_err(|_| HistoryError::StoragePoisoned)?;
        Ok(records.len())
    }

    pub fn is_empty(&self) -> Result<bool, HistoryError> {
        Ok(self.len()? == 0)
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistorySink for HistoryStore {
    fn record(&self, record: SessionRecord) -> Result<(), HistoryError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| HistoryError::StoragePoisoned)?;
        if records.iter().any(|r| r.session_id == record.session_id) {
            tracing::debug!(session_id = %record.session_id, "session already recorded");
            return Ok(());
        }
        tracing::info!(
            session_id = %record.session_id,
            game = %record.game,
            status = %record.status,
            duration_secs = record.duration_secs,
            "recorded finished session"
        );
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryStatistics {
    pub total_sessions: usize,
    /// Only counted when statistics are for one participant.
    pub wins: usize,
    pub draws: usize,
    pub abandoned: usize,
    pub win_rate: f64,
    pub avg_duration_secs: f64,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History storage poisoned")]
    StoragePoisoned,
    #[error("History storage unavailable: {0}")]
    Unavailable(String),
}

impl crate::errors::IntoErrorResponse for HistoryError {
    fn status_code(&self) -> warp::http::StatusCode {
        use warp::http::StatusCode;
        match self {
            HistoryError::StoragePoisoned => StatusCode::INTERNAL_SERVER_ERROR,
            HistoryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            HistoryError::StoragePoisoned => "history_storage_error",
            HistoryError::Unavailable(_) => "history_unavailable",
        }
    }

    fn error_message(&self) -> String {
        self.to_string()
    }

    fn severity(&self) -> crate::errors::ErrorSeverity {
        match self {
            HistoryError::StoragePoisoned => crate::errors::ErrorSeverity::Critical,
            HistoryError::Unavailable(_) => crate::errors::ErrorSeverity::Server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tavern_engine::game::GameOptions;
    use tavern_engine::session;

    fn finished(id: &str, loser: &str) -> SessionRecord {
        let players = vec![
            ("ann".to_string(), "Ann".to_string()),
            ("ben".to_string(), "Ben".to_string()),
        ];
        let waiting = Session::new(id, GameKind::TicTacToe, GameOptions::default(), players)
            .expect("session");
        let active = session::start(&waiting).expect("start");
        SessionRecord::from_session(&session::forfeit(&active, loser).expect("forfeit"))
    }

    #[test]
    fn recent_is_newest_first_and_bounded() {
        let store = HistoryStore::with_capacity(2);
        store.record(finished("a", "ben")).unwrap();
        store.record(finished("b", "ben")).unwrap();
        store.record(finished("c", "ann")).unwrap();

        let recent: Vec<_> = store
            .get_recent(None)
            .unwrap()
            .into_iter()
            .map(|r| r.session_id)
            .collect();
        assert_eq!(recent, vec!["c", "b"]);
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn duplicate_records_are_ignored() {
        let store = HistoryStore::new();
        store.record(finished("a", "ben")).unwrap();
        store.record(finished("a", "ben")).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn participant_statistics() {
        let store = HistoryStore::new();
        store.record(finished("a", "ben")).unwrap();
        store.record(finished("b", "ben")).unwrap();
        store.record(finished("c", "ann")).unwrap();

        let ann = store.stats(Some("ann")).unwrap();
        assert_eq!(ann.total_sessions, 3);
        assert_eq!(ann.wins, 2);
        assert!((ann.win_rate - 66.666).abs() < 0.1);

        let overall = store.stats(None).unwrap();
        assert_eq!(overall.total_sessions, 3);
        assert_eq!(overall.wins, 0);
        assert_eq!(store.stats(Some("zed")).unwrap(), HistoryStatistics::default());
    }

    #[test]
    fn record_carries_final_result() {
        let record = finished("a", "ben");
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.result.as_ref().and_then(Outcome::winner), Some("ann"));
        assert!(matches!(record.end_reason, Some(EndReason::Forfeit { .. })));
        assert!(record.duration_secs >= 0);
    }
}
