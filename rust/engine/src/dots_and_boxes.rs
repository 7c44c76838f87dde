use crate::errors::MoveError;
use crate::game::{
    top_scorer, Applied, Board, GameKind, GameOptions, GameRules, Move, Orientation,
    RoundOutcome,
};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub const DEFAULT_DOTS: u8 = 4;
pub const MIN_DOTS: u8 = 2;
pub const MAX_DOTS: u8 = 10;

/// Dot grid `width` dots wide and `height` dots high.
///
/// Segments are addressed by the dot they start from: a horizontal segment at
/// `(row, col)` joins dots `(row, col)` and `(row, col + 1)`, a vertical one
/// joins `(row, col)` and `(row + 1, col)`. Cell `(row, col)` is the square
/// whose top-left corner is dot `(row, col)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotsBoard {
    pub width: usize,
    pub height: usize,
    /// `height` rows of `width - 1` segments.
    pub horizontal: Vec<bool>,
    /// `height - 1` rows of `width` segments.
    pub vertical: Vec<bool>,
    /// `height - 1` rows of `width - 1` cells, owned by a turn slot once closed.
    pub cells: Vec<Option<usize>>,
}

impl DotsBoard {
    pub fn new(width: usize, height: usize) -> Self {
        let cols = width.saturating_sub(1);
        let rows = height.saturating_sub(1);
        Self {
            width,
            height,
            horizontal: vec![false; height * cols],
            vertical: vec![false; rows * width],
            cells: vec![None; rows * cols],
        }
    }

    pub fn cell_columns(&self) -> usize {
        self.width - 1
    }

    pub fn cell_rows(&self) -> usize {
        self.height - 1
    }

    pub fn cell_owner(&self, row: usize, col: usize) -> Option<usize> {
        self.cells[row * self.cell_columns() + col]
    }

    pub fn is_complete(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }

    fn segment_index(&self, orientation: Orientation, row: usize, col: usize) -> Option<usize> {
        match orientation {
            Orientation::Horizontal if row < self.height && col < self.width - 1 => {
                Some(row * (self.width - 1) + col)
            }
            Orientation::Vertical if row < self.height - 1 && col < self.width => {
                Some(row * self.width + col)
            }
            _ => None,
        }
    }

    fn has_h(&self, row: usize, col: usize) -> bool {
        self.horizontal[row * (self.width - 1) + col]
    }

    fn has_v(&self, row: usize, col: usize) -> bool {
        self.vertical[row * self.width + col]
    }

    fn is_enclosed(&self, row: usize, col: usize) -> bool {
        self.has_h(row, col)
            && self.has_h(row + 1, col)
            && self.has_v(row, col)
            && self.has_v(row, col + 1)
    }

    /// Cells bordering a segment: at most two.
    fn adjacent_cells(
        &self,
        orientation: Orientation,
        row: usize,
        col: usize,
    ) -> Vec<(usize, usize)> {
        let mut cells = Vec::with_capacity(2);
        match orientation {
            Orientation::Horizontal => {
                if row > 0 {
                    cells.push((row - 1, col));
                }
                if row < self.cell_rows() {
                    cells.push((row, col));
                }
            }
            Orientation::Vertical => {
                if col > 0 {
                    cells.push((row, col - 1));
                }
                if col < self.cell_columns() {
                    cells.push((row, col));
                }
            }
        }
        cells
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DotsAndBoxesRules;

impl DotsAndBoxesRules {
    fn dimensions(options: &GameOptions) -> (usize, usize) {
        let width = options.width.unwrap_or(DEFAULT_DOTS);
        let height = options.height.unwrap_or(width);
        (width as usize, height as usize)
    }
}

impl GameRules for DotsAndBoxesRules {
    fn kind(&self) -> GameKind {
        GameKind::DotsAndBoxes
    }

    fn player_range(&self) -> RangeInclusive<usize> {
        2..=4
    }

    fn role(&self, slot: usize) -> String {
        format!("P{}", slot + 1)
    }

    fn validate_options(&self, options: &GameOptions) -> Result<(), MoveError> {
        let (width, height) = Self::dimensions(options);
        let range = MIN_DOTS as usize..=MAX_DOTS as usize;
        if !range.contains(&width) || !range.contains(&height) {
            return Err(MoveError::InvalidSetup(format!(
                "dot grid must be between {MIN_DOTS} and {MAX_DOTS} dots per side, \
                 got {width}x{height}"
            )));
        }
        Ok(())
    }

    fn initial_state(&self, options: &GameOptions, _players: usize) -> Board {
        let (width, height) = Self::dimensions(options);
        Board::DotsAndBoxes(DotsBoard::new(width, height))
    }

    fn validate_and_apply(
        &self,
        board: &mut Board,
        slot: usize,
        mv: &Move,
    ) -> Result<Applied, MoveError> {
        let Board::DotsAndBoxes(grid) = board else {
            return Err(MoveError::WrongMove("board is not a dot grid".into()));
        };
        let Move::Line {
            orientation,
            row,
            col,
        } = *mv
        else {
            return Err(MoveError::WrongMove("dots-and-boxes expects a line".into()));
        };

        let label = || format!("{orientation:?}({row},{col})").to_lowercase();
        let index = grid
            .segment_index(orientation, row, col)
            .ok_or_else(|| MoveError::OutOfRange { position: label() })?;
        let segments = match orientation {
            Orientation::Horizontal => &mut grid.horizontal,
            Orientation::Vertical => &mut grid.vertical,
        };
        if segments[index] {
            return Err(MoveError::PositionTaken { position: label() });
        }
        segments[index] = true;

        let mut points = 0;
        for (cell_row, cell_col) in grid.adjacent_cells(orientation, row, col) {
            let cell = cell_row * grid.cell_columns() + cell_col;
            if grid.cells[cell].is_none() && grid.is_enclosed(cell_row, cell_col) {
                grid.cells[cell] = Some(slot);
                points += 1;
            }
        }

        Ok(Applied {
            points,
            extra_turn: points > 0,
        })
    }

    fn check_terminal(&self, board: &Board, scores: &[u32]) -> Option<RoundOutcome> {
        let Board::DotsAndBoxes(grid) = board else {
            return None;
        };
        if !grid.is_complete() {
            return None;
        }
        Some(top_scorer(scores, 0..scores.len()))
    }
}
