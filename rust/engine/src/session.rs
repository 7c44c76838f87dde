//! The authoritative game-instance record and the generic transitions over it.
//!
//! Every operation here takes the current [`Session`] by reference and returns
//! a new one; a rejected action never produces a partially updated session.

use crate::errors::MoveError;
use crate::game::{top_scorer, Applied, Board, GameKind, GameOptions, Move, RoundOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub type SessionId = String;
pub type ParticipantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Abandoned)
    }

    /// Forward-only: `waiting → active → {completed, abandoned}`; a session
    /// that never started may also be abandoned.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Waiting, Active) | (Waiting, Abandoned) | (Active, Completed) | (Active, Abandoned)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    /// Turn-slot label, e.g. `X` or `P2`.
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Winner { participant_id: ParticipantId },
    Draw,
}

impl Outcome {
    pub fn winner(&self) -> Option<&str> {
        match self {
            Outcome::Winner { participant_id } => Some(participant_id),
            Outcome::Draw => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    Finished,
    Forfeit { participant_id: ParticipantId },
    ClaimWin { participant_id: ParticipantId },
    Abandoned { reason: String },
}

/// Best-of-N bookkeeping; `wins` is indexed by turn slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub best_of: u32,
    pub round: u32,
    pub wins: Vec<u32>,
    pub draws: u32,
}

impl Series {
    fn new(best_of: u32, players: usize) -> Self {
        Self {
            best_of,
            round: 1,
            wins: vec![0; players],
            draws: 0,
        }
    }

    pub fn is_decided(&self) -> bool {
        self.wins.iter().any(|&w| w > self.best_of / 2) || self.round >= self.best_of
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u32,
    pub outcome: Outcome,
}

/// Side information about an accepted move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveResult {
    pub participant_id: ParticipantId,
    pub points: u32,
    pub extra_turn: bool,
    /// Set when the move decided a round.
    pub round: Option<RoundSummary>,
    /// Set when the move ended the session.
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub game: GameKind,
    pub options: GameOptions,
    pub participants: Vec<Participant>,
    pub board: Board,
    /// Turn slot expected to move next.
    pub current_turn: usize,
    pub status: SessionStatus,
    /// Points in the current round (boxes in dots-and-boxes), by turn slot.
    pub scores: Vec<u32>,
    pub series: Series,
    pub result: Option<Outcome>,
    pub end_reason: Option<EndReason>,
    pub move_count: u32,
    /// Bumped on every committed change.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Builds a session in `waiting` status. `participants` are `(id, name)`
    /// pairs in turn order.
    pub fn new(
        id: impl Into<SessionId>,
        game: GameKind,
        options: GameOptions,
        participants: Vec<(ParticipantId, String)>,
    ) -> Result<Self, MoveError> {
        let rules = game.rules();
        options.validate(game)?;

        let range = rules.player_range();
        if !range.contains(&participants.len()) {
            return Err(MoveError::InvalidSetup(format!(
                "{game} needs {} to {} participants, got {}",
                range.start(),
                range.end(),
                participants.len()
            )));
        }
        let mut seen = HashSet::new();
        for (pid, _) in &participants {
            if pid.trim().is_empty() {
                return Err(MoveError::InvalidSetup("participant id is empty".into()));
            }
            if !seen.insert(pid.as_str()) {
                return Err(MoveError::InvalidSetup(format!(
                    "participant `{pid}` listed twice"
                )));
            }
        }

        let players = participants.len();
        let participants = participants
            .into_iter()
            .enumerate()
            .map(|(slot, (id, name))| Participant {
                id,
                name,
                role: rules.role(slot),
            })
            .collect();
        let now = Utc::now();

        Ok(Self {
            id: id.into(),
            game,
            board: rules.initial_state(&options, players),
            series: Series::new(options.best_of, players),
            options,
            participants,
            current_turn: 0,
            status: SessionStatus::Waiting,
            scores: vec![0; players],
            result: None,
            end_reason: None,
            move_count: 0,
            revision: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    pub fn slot_of(&self, participant_id: &str) -> Option<usize> {
        self.participants.iter().position(|p| p.id == participant_id)
    }

    pub fn is_participant(&self, participant_id: &str) -> bool {
        self.slot_of(participant_id).is_some()
    }

    /// Participant whose turn it is, while the session is active.
    pub fn current_participant(&self) -> Option<&Participant> {
        if self.status != SessionStatus::Active {
            return None;
        }
        self.participants.get(self.current_turn)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn require_active(&self) -> Result<(), MoveError> {
        if self.status != SessionStatus::Active {
            return Err(MoveError::InvalidState {
                status: self.status,
            });
        }
        Ok(())
    }

    fn require_slot(&self, participant_id: &str) -> Result<usize, MoveError> {
        self.slot_of(participant_id)
            .ok_or_else(|| MoveError::UnknownParticipant {
                participant_id: participant_id.to_string(),
            })
    }

    fn transition(&mut self, next: SessionStatus) -> Result<(), MoveError> {
        if !self.status.can_transition_to(next) {
            return Err(MoveError::InvalidState {
                status: self.status,
            });
        }
        self.status = next;
        Ok(())
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    fn outcome_for(&self, outcome: RoundOutcome) -> Outcome {
        match outcome {
            RoundOutcome::Winner(slot) => Outcome::Winner {
                participant_id: self.participants[slot].id.clone(),
            },
            RoundOutcome::Draw => Outcome::Draw,
        }
    }

    fn complete(&mut self, outcome: Outcome, reason: EndReason) -> Result<(), MoveError> {
        self.transition(SessionStatus::Completed)?;
        self.result = Some(outcome);
        self.end_reason = Some(reason);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Books a decided round into the series and either finalizes the session
    /// or deals the next round.
    fn finish_round(&mut self, outcome: RoundOutcome) -> Result<RoundSummary, MoveError> {
        let summary = RoundSummary {
            round: self.series.round,
            outcome: self.outcome_for(outcome),
        };
        match outcome {
            RoundOutcome::Winner(slot) => self.series.wins[slot] += 1,
            RoundOutcome::Draw => self.series.draws += 1,
        }

        let players = self.participants.len();
        if self.series.is_decided() {
            let final_outcome = top_scorer(&self.series.wins, 0..players);
            let final_outcome = self.outcome_for(final_outcome);
            self.complete(final_outcome, EndReason::Finished)?;
        } else {
            self.series.round += 1;
            self.board = self.game.rules().initial_state(&self.options, players);
            self.scores = vec![0; players];
            self.current_turn = (self.series.round as usize - 1) % players;
        }
        Ok(summary)
    }
}

/// `waiting → active`.
pub fn start(session: &Session) -> Result<Session, MoveError> {
    let mut next = session.clone();
    next.transition(SessionStatus::Active)?;
    next.touch();
    Ok(next)
}

/// Validates `mv` for `participant_id` and returns the resulting session.
///
/// Order of checks: session active, participant known, participant's turn,
/// then position range and occupancy (delegated to the game rules).
pub fn validate_and_apply(
    session: &Session,
    participant_id: &str,
    mv: &Move,
) -> Result<(Session, MoveResult), MoveError> {
    session.require_active()?;
    let slot = session.require_slot(participant_id)?;
    if slot != session.current_turn {
        return Err(MoveError::NotYourTurn {
            expected: session.participants[session.current_turn].id.clone(),
            actual: participant_id.to_string(),
        });
    }

    let rules = session.game.rules();
    let mut next = session.clone();
    let Applied { points, extra_turn } = rules.validate_and_apply(&mut next.board, slot, mv)?;
    next.scores[slot] += points;
    next.move_count += 1;

    let round = match rules.check_terminal(&next.board, &next.scores) {
        Some(outcome) => Some(next.finish_round(outcome)?),
        None => {
            next.current_turn = if extra_turn {
                slot
            } else {
                (slot + 1) % next.participants.len()
            };
            None
        }
    };
    next.touch();

    let result = MoveResult {
        participant_id: participant_id.to_string(),
        points,
        extra_turn: extra_turn && round.is_none(),
        completed: next.is_terminal(),
        round,
    };
    Ok((next, result))
}

/// The forfeiting participant concedes; the best-placed remaining participant
/// wins, or the session is drawn if they are tied.
pub fn forfeit(session: &Session, participant_id: &str) -> Result<Session, MoveError> {
    session.require_active()?;
    let slot = session.require_slot(participant_id)?;

    let mut next = session.clone();
    let rest = (0..session.participants.len()).filter(|&s| s != slot);
    let outcome = next.outcome_for(top_scorer(&session.scores, rest));
    next.complete(
        outcome,
        EndReason::Forfeit {
            participant_id: participant_id.to_string(),
        },
    )?;
    next.touch();
    Ok(next)
}

/// Awards the session to `claimant` when every other participant is listed in
/// `absent`. Liveness is the caller's responsibility and must come from
/// server-side heartbeat records.
pub fn claim_win(
    session: &Session,
    claimant: &str,
    absent: &[ParticipantId],
) -> Result<Session, MoveError> {
    session.require_active()?;
    session.require_slot(claimant)?;

    if let Some(present) = session
        .participants
        .iter()
        .find(|p| p.id != claimant && !absent.contains(&p.id))
    {
        return Err(MoveError::NotEligible(format!(
            "participant `{}` is still connected",
            present.id
        )));
    }

    let mut next = session.clone();
    next.complete(
        Outcome::Winner {
            participant_id: claimant.to_string(),
        },
        EndReason::ClaimWin {
            participant_id: claimant.to_string(),
        },
    )?;
    next.touch();
    Ok(next)
}

/// Ends the session without a result.
pub fn abandon(session: &Session, reason: &str) -> Result<Session, MoveError> {
    let mut next = session.clone();
    next.transition(SessionStatus::Abandoned)?;
    next.end_reason = Some(EndReason::Abandoned {
        reason: reason.to_string(),
    });
    next.completed_at = Some(Utc::now());
    next.touch();
    Ok(next)
}
