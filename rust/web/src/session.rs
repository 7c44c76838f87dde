//! Session mutation against the shared store.
//!
//! Every action is a read-modify-write of `session:{id}`. The engine's pure
//! transitions run inside the store's compare-and-set loop, so an action that
//! loses a race is re-validated against whatever won it.

use crate::connections::ConnectionTracker;
use crate::events::{Event, EventBus};
use crate::history::{HistorySink, SessionRecord};
use crate::settings::AppSettings;
use crate::store::{keys, SessionStore, StoreError, Updated};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tavern_engine::game::{Board, GameKind, GameOptions, Move};
use tavern_engine::session::{
    self as rules, EndReason, MoveResult, Outcome, Participant, ParticipantId, Series, Session,
    SessionId, SessionStatus,
};
use tavern_engine::MoveError;
use thiserror::Error;
use uuid::Uuid;

/// Public view of a session: what `connected` and `state_update` carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    pub game: GameKind,
    pub options: GameOptions,
    pub participants: Vec<Participant>,
    pub board: Board,
    pub status: SessionStatus,
    /// Participant expected to move next, while active.
    pub current_turn: Option<ParticipantId>,
    pub scores: Vec<u32>,
    pub series: Series,
    pub result: Option<Outcome>,
    pub end_reason: Option<EndReason>,
    pub move_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            game: session.game,
            options: session.options.clone(),
            participants: session.participants.clone(),
            board: session.board.clone(),
            status: session.status,
            current_turn: session.current_participant().map(|p| p.id.clone()),
            scores: session.scores.clone(),
            series: session.series.clone(),
            result: session.result.clone(),
            end_reason: session.end_reason.clone(),
            move_count: session.move_count,
            created_at: session.created_at,
            updated_at: session.updated_at,
            completed_at: session.completed_at,
        }
    }
}

/// An accepted move and the state it produced.
#[derive(Debug, Clone)]
pub struct MoveOutcome {
    pub session: SessionView,
    pub result: MoveResult,
}

#[derive(Debug, Clone)]
pub struct SessionManager {
    sessions: SessionStore,
    bus: EventBus,
    tracker: ConnectionTracker,
    history: Arc<dyn HistorySink>,
    settings: AppSettings,
}

impl SessionManager {
    pub fn new(
        sessions: SessionStore,
        bus: EventBus,
        tracker: ConnectionTracker,
        history: Arc<dyn HistorySink>,
        settings: AppSettings,
    ) -> Self {
        Self {
            sessions,
            bus,
            tracker,
            history,
            settings,
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn ttl_for(&self, session: &Session) -> Duration {
        if session.is_terminal() {
            self.settings.completed_session_ttl()
        } else {
            self.settings.active_session_ttl()
        }
    }

    /// Creates and starts a session. Only the challenge broker calls this.
    pub fn create_session(
        &self,
        id: Option<SessionId>,
        game: GameKind,
        options: GameOptions,
        participants: Vec<(ParticipantId, String)>,
    ) -> Result<SessionView, SessionError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = rules::start(&Session::new(id.clone(), game, options, participants)?)?;

        if !self.sessions.create(&session, self.ttl_for(&session))? {
            return Err(SessionError::AlreadyExists(id));
        }

        tracing::info!(
            session_id = %id,
            game = %game,
            participants = session.participants.len(),
            "session created"
        );
        let view = SessionView::from(&session);
        self.bus.publish(
            &keys::session_updates(&id),
            Event::StateUpdate {
                session: view.clone(),
            },
        );
        Ok(view)
    }

    pub fn load(&self, session_id: &str) -> Result<Session, SessionError> {
        self.sessions
            .get(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Current view, for a participant or for anyone when the session is public.
    pub fn view(
        &self,
        session_id: &str,
        viewer: Option<&str>,
    ) -> Result<SessionView, SessionError> {
        let session = self.load(session_id)?;
        authorize_viewer(&session, viewer)?;
        Ok(SessionView::from(&session))
    }

    pub fn submit_move(
        &self,
        session_id: &str,
        participant_id: &str,
        mv: &Move,
    ) -> Result<MoveOutcome, SessionError> {
        require_identity(participant_id)?;
        let committed = self.commit(session_id, |session| {
            authorize_actor(session, participant_id)?;
            Ok(rules::validate_and_apply(session, participant_id, mv)?)
        })?;

        tracing::debug!(
            session_id = %session_id,
            participant_id = %participant_id,
            points = committed.output.points,
            extra_turn = committed.output.extra_turn,
            "move applied"
        );
        Ok(MoveOutcome {
            session: SessionView::from(&committed.current),
            result: committed.output,
        })
    }

    pub fn forfeit(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<SessionView, SessionError> {
        require_identity(participant_id)?;
        let committed = self.commit(session_id, |session| {
            authorize_actor(session, participant_id)?;
            Ok((rules::forfeit(session, participant_id)?, ()))
        })?;
        Ok(SessionView::from(&committed.current))
    }

    /// Awards the session to `claimant` when every other participant has been
    /// silent past the staleness window. Liveness is re-read on every commit
    /// attempt, so a heartbeat that lands first defeats the claim.
    pub fn claim_win(&self, session_id: &str, claimant: &str) -> Result<SessionView, SessionError> {
        require_identity(claimant)?;
        let committed = self.commit(session_id, |session| {
            authorize_actor(session, claimant)?;
            let absent = self.tracker.absent_participants(session, claimant)?;
            Ok((rules::claim_win(session, claimant, &absent)?, ()))
        })?;
        Ok(SessionView::from(&committed.current))
    }

    pub fn abandon(
        &self,
        session_id: &str,
        participant_id: &str,
        reason: &str,
    ) -> Result<SessionView, SessionError> {
        require_identity(participant_id)?;
        let committed = self.commit(session_id, |session| {
            authorize_actor(session, participant_id)?;
            Ok((rules::abandon(session, reason)?, ()))
        })?;
        Ok(SessionView::from(&committed.current))
    }

    /// Connection heartbeat from a participant outside a stream.
    pub fn heartbeat(&self, session_id: &str, participant_id: &str) -> Result<bool, SessionError> {
        require_identity(participant_id)?;
        let session = self.load(session_id)?;
        authorize_actor(&session, participant_id)?;
        Ok(self.tracker.heartbeat(session_id, participant_id)?)
    }

    /// Explicit detach. The last heartbeat still counts toward claim-win.
    pub fn leave(&self, session_id: &str, participant_id: &str) -> Result<bool, SessionError> {
        require_identity(participant_id)?;
        let session = self.load(session_id)?;
        authorize_actor(&session, participant_id)?;
        Ok(self.tracker.detach(session_id, participant_id)?)
    }

    fn commit<O, F>(&self, session_id: &str, mut op: F) -> Result<Updated<Session, O>, SessionError>
    where
        F: FnMut(&Session) -> Result<(Session, O), SessionError>,
    {
        let committed = self
            .sessions
            .update::<O, SessionError, _>(session_id, |current| {
                let (next, output) = op(current)?;
                let ttl = self.ttl_for(&next);
                Ok((next, ttl, output))
            })?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        self.announce(&committed.previous, &committed.current);
        Ok(committed)
    }

    /// Publishes the committed state and, on the terminal commit, hands the
    /// final record to history before announcing the end.
    fn announce(&self, previous: &Session, current: &Session) {
        let channel = keys::session_updates(&current.id);
        self.bus.publish(
            &channel,
            Event::StateUpdate {
                session: SessionView::from(current),
            },
        );

        if previous.is_terminal() || !current.is_terminal() {
            return;
        }
        if let Err(e) = self.history.record(SessionRecord::from_session(current)) {
            tracing::error!(
                session_id = %current.id,
                error = %e,
                "failed to record finished session"
            );
        }
        tracing::info!(
            session_id = %current.id,
            status = %current.status,
            winner = current.result.as_ref().and_then(Outcome::winner).unwrap_or("-"),
            "session ended"
        );
        self.bus.publish(
            &channel,
            Event::SessionEnded {
                session_id: current.id.clone(),
                result: current.result.clone(),
                reason: current.end_reason.clone(),
            },
        );
    }
}

fn require_identity(participant_id: &str) -> Result<(), SessionError> {
    if participant_id.trim().is_empty() {
        return Err(SessionError::Unauthenticated);
    }
    Ok(())
}

fn authorize_actor(session: &Session, participant_id: &str) -> Result<(), SessionError> {
    if !session.is_participant(participant_id) {
        return Err(SessionError::AccessDenied {
            session_id: session.id.clone(),
            participant_id: participant_id.to_string(),
        });
    }
    Ok(())
}

/// Participants may always look; anyone else only at public sessions.
pub(crate) fn authorize_viewer(
    session: &Session,
    viewer: Option<&str>,
) -> Result<(), SessionError> {
    if session.options.public {
        return Ok(());
    }
    match viewer.filter(|v| !v.trim().is_empty()) {
        None => Err(SessionError::Unauthenticated),
        Some(viewer) => authorize_actor(session, viewer),
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),
    #[error(transparent)]
    Move(#[from] MoveError),
    #[error("Participant `{participant_id}` does not belong to session {session_id}")]
    AccessDenied {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    #[error("Participant identity is required")]
    Unauthenticated,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl crate::errors::IntoErrorResponse for SessionError {
    fn status_code(&self) -> warp::http::StatusCode {
        use warp::http::StatusCode;
        match self {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::AlreadyExists(_) => StatusCode::CONFLICT,
            SessionError::Move(err) => match err {
                MoveError::InvalidState { .. }
                | MoveError::NotYourTurn { .. }
                | MoveError::PositionTaken { .. }
                | MoveError::NotEligible(_) => StatusCode::CONFLICT,
                MoveError::UnknownParticipant { .. } => StatusCode::FORBIDDEN,
                MoveError::OutOfRange { .. }
                | MoveError::WrongMove(_)
                | MoveError::InvalidSetup(_) => StatusCode::BAD_REQUEST,
            },
            SessionError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            SessionError::Unauthenticated => StatusCode::UNAUTHORIZED,
            SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SessionError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            SessionError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "session_not_found",
            SessionError::AlreadyExists(_) => "session_exists",
            SessionError::Move(err) => match err {
                MoveError::InvalidState { .. } => "invalid_state",
                MoveError::UnknownParticipant { .. } => "unknown_participant",
                MoveError::NotYourTurn { .. } => "not_your_turn",
                MoveError::PositionTaken { .. } => "position_taken",
                MoveError::OutOfRange { .. } => "out_of_range",
                MoveError::WrongMove(_) => "wrong_move",
                MoveError::NotEligible(_) => "not_eligible",
                MoveError::InvalidSetup(_) => "invalid_setup",
            },
            SessionError::AccessDenied { .. } => "access_denied",
            SessionError::Unauthenticated => "unauthenticated",
            SessionError::InvalidRequest(_) => "invalid_request",
            SessionError::Store(StoreError::Conflict(_)) => "session_conflict",
            SessionError::Store(_) => "store_unavailable",
        }
    }

    fn error_message(&self) -> String {
        self.to_string()
    }

    fn error_details(&self) -> Option<serde_json::Value> {
        match self {
            SessionError::NotFound(id) => Some(serde_json::json!({ "session_id": id })),
            SessionError::Move(MoveError::InvalidState { status }) => {
                Some(serde_json::json!({ "status": status }))
            }
            SessionError::Move(MoveError::NotYourTurn { expected, .. }) => {
                Some(serde_json::json!({ "current_turn": expected }))
            }
            _ => None,
        }
    }

    fn severity(&self) -> crate::errors::ErrorSeverity {
        use crate::errors::ErrorSeverity;
        match self {
            SessionError::Store(StoreError::Conflict(_)) => ErrorSeverity::Client,
            SessionError::Store(_) => ErrorSeverity::Server,
            _ => ErrorSeverity::Client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::IntoErrorResponse;
    use crate::history::HistoryStore;
    use crate::store::{KeyValueStore, MemoryStore};
    use warp::http::StatusCode;

    struct Fixture {
        manager: SessionManager,
        history: Arc<HistoryStore>,
        bus: EventBus,
    }

    fn fixture() -> Fixture {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let settings = AppSettings::default();
        let tracker = ConnectionTracker::new(
            Arc::clone(&kv),
            bus.clone(),
            settings.connection_staleness(),
            settings.active_session_ttl(),
        );
        let history = Arc::new(HistoryStore::new());
        let manager = SessionManager::new(
            SessionStore::new(kv),
            bus.clone(),
            tracker,
            history.clone(),
            settings,
        );
        Fixture {
            manager,
            history,
            bus,
        }
    }

    fn pair() -> Vec<(ParticipantId, String)> {
        vec![
            ("ann".to_string(), "Ann".to_string()),
            ("ben".to_string(), "Ben".to_string()),
        ]
    }

    fn mark(position: usize) -> Move {
        Move::Mark { position }
    }

    #[test]
    fn created_sessions_are_active_and_unique() {
        let f = fixture();
        let view = f
            .manager
            .create_session(Some("s1".into()), GameKind::TicTacToe, GameOptions::default(), pair())
            .expect("create");
        assert_eq!(view.status, SessionStatus::Active);
        assert_eq!(view.current_turn.as_deref(), Some("ann"));

        let again = f.manager.create_session(
            Some("s1".into()),
            GameKind::TicTacToe,
            GameOptions::default(),
            pair(),
        );
        assert!(matches!(again, Err(SessionError::AlreadyExists(_))));
    }

    #[test]
    fn winning_move_publishes_update_then_end_and_records_history() {
        let f = fixture();
        f.manager
            .create_session(Some("s".into()), GameKind::TicTacToe, GameOptions::default(), pair())
            .unwrap();
        let mut sub = f.bus.subscribe(keys::session_updates("s"));

        for (who, cell) in [("ann", 0), ("ben", 3), ("ann", 1), ("ben", 4)] {
            f.manager.submit_move("s", who, &mark(cell)).unwrap();
        }
        let outcome = f.manager.submit_move("s", "ann", &mark(2)).unwrap();
        assert!(outcome.result.completed);
        assert_eq!(outcome.session.status, SessionStatus::Completed);

        let events: Vec<Event> = std::iter::from_fn(|| sub.try_next()).collect();
        assert_eq!(events.len(), 6);
        assert!(matches!(events[4], Event::StateUpdate { .. }));
        assert!(matches!(
            &events[5],
            Event::SessionEnded { result: Some(Outcome::Winner { participant_id }), .. }
                if participant_id == "ann"
        ));
        assert_eq!(f.history.len().unwrap(), 1);

        let late = f.manager.submit_move("s", "ben", &mark(5)).unwrap_err();
        assert_eq!(late.status_code(), StatusCode::CONFLICT);
        assert_eq!(late.error_code(), "invalid_state");
    }

    #[test]
    fn rejected_moves_do_not_change_state() {
        let f = fixture();
        f.manager
            .create_session(Some("s".into()), GameKind::TicTacToe, GameOptions::default(), pair())
            .unwrap();
        let before = f.manager.view("s", Some("ann")).unwrap();

        let wrong_turn = f.manager.submit_move("s", "ben", &mark(0)).unwrap_err();
        assert_eq!(wrong_turn.error_code(), "not_your_turn");
        let stranger = f.manager.submit_move("s", "zed", &mark(0)).unwrap_err();
        assert_eq!(stranger.status_code(), StatusCode::FORBIDDEN);
        let anonymous = f.manager.submit_move("s", " ", &mark(0)).unwrap_err();
        assert_eq!(anonymous.status_code(), StatusCode::UNAUTHORIZED);
        let range = f.manager.submit_move("s", "ann", &mark(12)).unwrap_err();
        assert_eq!(range.status_code(), StatusCode::BAD_REQUEST);

        assert_eq!(f.manager.view("s", Some("ann")).unwrap(), before);
    }

    #[test]
    fn private_sessions_hide_from_strangers() {
        let f = fixture();
        f.manager
            .create_session(Some("s".into()), GameKind::TicTacToe, GameOptions::default(), pair())
            .unwrap();
        assert!(matches!(
            f.manager.view("s", Some("zed")),
            Err(SessionError::AccessDenied { .. })
        ));
        assert!(matches!(f.manager.view("s", None), Err(SessionError::Unauthenticated)));

        let public = GameOptions {
            public: true,
            ..GameOptions::default()
        };
        f.manager
            .create_session(Some("p".into()), GameKind::TicTacToe, public, pair())
            .unwrap();
        assert!(f.manager.view("p", None).is_ok());
    }

    #[test]
    fn claim_win_requires_every_opponent_to_be_stale() {
        let f = fixture();
        f.manager
            .create_session(Some("s".into()), GameKind::TicTacToe, GameOptions::default(), pair())
            .unwrap();
        let tracker = f.manager.tracker();

        tracker
            .heartbeat_at("s", "ben", Utc::now() - chrono::Duration::seconds(10))
            .unwrap();
        let err = f.manager.claim_win("s", "ann").unwrap_err();
        assert_eq!(err.error_code(), "not_eligible");

        tracker
            .heartbeat_at("s", "ben", Utc::now() - chrono::Duration::seconds(16))
            .unwrap();
        let view = f.manager.claim_win("s", "ann").expect("claim");
        assert_eq!(view.status, SessionStatus::Completed);
        assert_eq!(view.result.as_ref().and_then(Outcome::winner), Some("ann"));
        assert!(matches!(view.end_reason, Some(EndReason::ClaimWin { .. })));
    }

    #[test]
    fn abandon_ends_without_result() {
        let f = fixture();
        f.manager
            .create_session(Some("s".into()), GameKind::TicTacToe, GameOptions::default(), pair())
            .unwrap();
        let view = f.manager.abandon("s", "ben", "closed the tab").unwrap();
        assert_eq!(view.status, SessionStatus::Abandoned);
        assert!(view.result.is_none());
        assert!(matches!(
            f.manager.forfeit("s", "ann"),
            Err(SessionError::Move(MoveError::InvalidState { .. }))
        ));
    }

    #[test]
    fn leave_is_limited_to_participants_of_existing_sessions() {
        let f = fixture();
        f.manager
            .create_session(Some("s".into()), GameKind::TicTacToe, GameOptions::default(), pair())
            .unwrap();
        f.manager.heartbeat("s", "ben").unwrap();

        let missing = f.manager.leave("nope", "ben").unwrap_err();
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
        let stranger = f.manager.leave("s", "zed").unwrap_err();
        assert_eq!(stranger.error_code(), "access_denied");

        assert!(f.manager.leave("s", "ben").unwrap());
        assert!(!f.manager.leave("s", "ben").unwrap());
    }

    #[test]
    fn unknown_sessions_are_not_found() {
        let f = fixture();
        let err = f.manager.forfeit("missing", "ann").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_error_response().details.unwrap()["session_id"], "missing");
    }
}
