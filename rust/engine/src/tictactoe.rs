use crate::errors::MoveError;
use crate::game::{Applied, Board, GameKind, GameOptions, GameRules, Move, RoundOutcome};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub const CELLS: usize = 9;

/// Rows, columns and both diagonals of the 3×3 grid.
pub const WIN_LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

/// 3×3 grid; each cell holds the turn slot that marked it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicTacToeBoard {
    pub cells: [Option<usize>; CELLS],
}

impl TicTacToeBoard {
    pub fn new() -> Self {
        Self {
            cells: [None; CELLS],
        }
    }

    pub fn is_full(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }

    /// Slot occupying a complete row, column or diagonal.
    pub fn winner(&self) -> Option<usize> {
        WIN_LINES.iter().find_map(|[a, b, c]| match self.cells[*a] {
            Some(slot) if self.cells[*b] == Some(slot) && self.cells[*c] == Some(slot) => {
                Some(slot)
            }
            _ => None,
        })
    }
}

impl Default for TicTacToeBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TicTacToeRules;

impl GameRules for TicTacToeRules {
    fn kind(&self) -> GameKind {
        GameKind::TicTacToe
    }

    fn player_range(&self) -> RangeInclusive<usize> {
        2..=2
    }

    fn role(&self, slot: usize) -> String {
        if slot == 0 { "X" } else { "O" }.to_string()
    }

    fn validate_options(&self, options: &GameOptions) -> Result<(), MoveError> {
        if options.width.is_some() || options.height.is_some() {
            return Err(MoveError::InvalidSetup(
                "tic-tac-toe is always played on a 3x3 grid".to_string(),
            ));
        }
        Ok(())
    }

    fn initial_state(&self, _options: &GameOptions, _players: usize) -> Board {
        Board::TicTacToe(TicTacToeBoard::new())
    }

    fn validate_and_apply(
        &self,
        board: &mut Board,
        slot: usize,
        mv: &Move,
    ) -> Result<Applied, MoveError> {
        let Board::TicTacToe(grid) = board else {
            return Err(MoveError::WrongMove("board is not a tic-tac-toe grid".into()));
        };
        let Move::Mark { position } = *mv else {
            return Err(MoveError::WrongMove("tic-tac-toe expects a mark".into()));
        };
        if position >= CELLS {
            return Err(MoveError::OutOfRange {
                position: position.to_string(),
            });
        }
        if grid.cells[position].is_some() {
            return Err(MoveError::PositionTaken {
                position: position.to_string(),
            });
        }
        grid.cells[position] = Some(slot);
        Ok(Applied::default())
    }

    fn check_terminal(&self, board: &Board, _scores: &[u32]) -> Option<RoundOutcome> {
        let Board::TicTacToe(grid) = board else {
            return None;
        };
        match grid.winner() {
            Some(slot) => Some(RoundOutcome::Winner(slot)),
            None if grid.is_full() => Some(RoundOutcome::Draw),
            None => None,
        }
    }
}
