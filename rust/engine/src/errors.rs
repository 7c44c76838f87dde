use crate::session::SessionStatus;
use thiserror::Error;

/// Rejections produced while validating an action against a session.
///
/// None of these leave a trace on the session: every operation in this crate
/// works on a copy and only hands back the new state when the action is valid.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MoveError {
    #[error("Session is not active (status: {status})")]
    InvalidState { status: SessionStatus },
    #[error("Participant `{participant_id}` is not part of this session")]
    UnknownParticipant { participant_id: String },
    #[error("It's not `{actual}`'s turn (expected `{expected}`)")]
    NotYourTurn { expected: String, actual: String },
    #[error("Position {position} is already taken")]
    PositionTaken { position: String },
    #[error("Position {position} is out of range")]
    OutOfRange { position: String },
    #[error("Move does not fit this board: {0}")]
    WrongMove(String),
    #[error("Not eligible: {0}")]
    NotEligible(String),
    #[error("Invalid session setup: {0}")]
    InvalidSetup(String),
}
