use crate::dots_and_boxes::{DotsAndBoxesRules, DotsBoard};
use crate::errors::MoveError;
use crate::tictactoe::{TicTacToeBoard, TicTacToeRules};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

pub const DEFAULT_BEST_OF: u32 = 1;
pub const MAX_BEST_OF: u32 = 9;

/// The game types hosted by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    TicTacToe,
    DotsAndBoxes,
}

impl GameKind {
    /// Rules object for this game type.
    pub fn rules(self) -> &'static dyn GameRules {
        match self {
            GameKind::TicTacToe => &TicTacToeRules,
            GameKind::DotsAndBoxes => &DotsAndBoxesRules,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameKind::TicTacToe => "tic_tac_toe",
            GameKind::DotsAndBoxes => "dots_and_boxes",
        }
    }
}

impl fmt::Display for GameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options chosen when a challenge is issued; copied into the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOptions {
    /// Number of rounds in the series (odd).
    #[serde(default = "default_best_of")]
    pub best_of: u32,
    /// Dots per row (dots-and-boxes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u8>,
    /// Dots per column (dots-and-boxes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u8>,
    /// Allows streams without a participant id (spectators, table displays).
    #[serde(default)]
    pub public: bool,
}

fn default_best_of() -> u32 {
    DEFAULT_BEST_OF
}

impl Default for GameOptions {
    fn default() -> Self {
        Self {
            best_of: DEFAULT_BEST_OF,
            width: None,
            height: None,
            public: false,
        }
    }
}

impl GameOptions {
    pub fn validate(&self, game: GameKind) -> Result<(), MoveError> {
        if self.best_of == 0 || self.best_of > MAX_BEST_OF || self.best_of % 2 == 0 {
            return Err(MoveError::InvalidSetup(format!(
                "best_of must be an odd number between 1 and {MAX_BEST_OF}"
            )));
        }
        game.rules().validate_options(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Horizontal,
    Vertical,
}

/// A proposed action, as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Move {
    /// Claim a cell of the 3×3 grid, numbered 0..9 row-major.
    Mark { position: usize },
    /// Draw the segment starting at dot `(row, col)`.
    Line {
        orientation: Orientation,
        row: usize,
        col: usize,
    },
}

/// Game-type-specific board payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Board {
    TicTacToe(TicTacToeBoard),
    DotsAndBoxes(DotsBoard),
}

/// What applying a valid move produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Applied {
    pub points: u32,
    pub extra_turn: bool,
}

/// Result of a single round, in turn-slot terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Winner(usize),
    Draw,
}

/// Per-game plugin consumed by the generic session logic.
pub trait GameRules: Send + Sync {
    fn kind(&self) -> GameKind;

    fn player_range(&self) -> RangeInclusive<usize>;

    /// Label shown for a turn slot (symbol, seat number).
    fn role(&self, slot: usize) -> String;

    fn validate_options(&self, _options: &GameOptions) -> Result<(), MoveError> {
        Ok(())
    }

    fn initial_state(&self, options: &GameOptions, players: usize) -> Board;

    /// Checks range and occupancy, then applies `mv` for `slot`.
    /// Must leave `board` untouched when it returns an error.
    fn validate_and_apply(
        &self,
        board: &mut Board,
        slot: usize,
        mv: &Move,
    ) -> Result<Applied, MoveError>;

    fn check_terminal(&self, board: &Board, scores: &[u32]) -> Option<RoundOutcome>;
}

/// Unique highest score among `candidates`, or a draw on a tie at the top.
pub fn top_scorer(scores: &[u32], candidates: impl IntoIterator<Item = usize>) -> RoundOutcome {
    let mut best: Option<(usize, u32)> = None;
    let mut tied = false;
    for slot in candidates {
        let score = scores.get(slot).copied().unwrap_or(0);
        match best {
            Some((_, top)) if score == top => tied = true,
            Some((_, top)) if score < top => {}
            _ => {
                best = Some((slot, score));
                tied = false;
            }
        }
    }
    match best {
        Some((slot, _)) if !tied => RoundOutcome::Winner(slot),
        _ => RoundOutcome::Draw,
    }
}
