//! Board Engine
//!
//! 3x3 grid, placement legality and line detection.
//! Pure data: no I/O and no knowledge of players or turns.

use std::fmt;

use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Board edge length.
pub const BOARD_SIZE: usize = 3;

/// Mark placed by a player. `X` is always the first joiner's mark.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mark {
    /// First mark; its holder moves first.
    X = 1,
    /// Second mark.
    O = 2,
}

impl Mark {
    /// The opposing mark.
    pub fn other(self) -> Mark {
        match self {
            Mark::X => Mark::O,
            Mark::O => Mark::X,
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mark::X => f.write_str("X"),
            Mark::O => f.write_str("O"),
        }
    }
}

/// A validated board coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellPos {
    /// Row, 0 = top.
    pub row: u8,
    /// Column, 0 = left.
    pub col: u8,
}

impl CellPos {
    /// Create a position. Callers must pass values below [`BOARD_SIZE`].
    pub const fn new(row: u8, col: u8) -> Self {
        Self { row, col }
    }

    /// Validate raw coordinates received from a client.
    pub fn from_coords(row: i64, col: i64) -> Option<Self> {
        let size = BOARD_SIZE as i64;
        if (0..size).contains(&row) && (0..size).contains(&col) {
            Some(Self::new(row as u8, col as u8))
        } else {
            None
        }
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// A completed line of three equal marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinningLine {
    /// Mark filling the line.
    pub mark: Mark,
    /// Cells of the line in scan order.
    pub cells: [CellPos; 3],
}

/// Placement failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BoardError {
    /// Row or column outside `0..=2`.
    #[error("coordinates ({row}, {col}) are outside the board")]
    OutOfRange {
        /// Requested row.
        row: i64,
        /// Requested column.
        col: i64,
    },

    /// Target cell already holds a mark.
    #[error("cell {0} is already occupied")]
    CellOccupied(CellPos),
}

/// All eight lines in scan order: rows top to bottom, columns left to right,
/// main diagonal, anti-diagonal.
const LINES: [[CellPos; 3]; 8] = [
    [CellPos::new(0, 0), CellPos::new(0, 1), CellPos::new(0, 2)],
    [CellPos::new(1, 0), CellPos::new(1, 1), CellPos::new(1, 2)],
    [CellPos::new(2, 0), CellPos::new(2, 1), CellPos::new(2, 2)],
    [CellPos::new(0, 0), CellPos::new(1, 0), CellPos::new(2, 0)],
    [CellPos::new(0, 1), CellPos::new(1, 1), CellPos::new(2, 1)],
    [CellPos::new(0, 2), CellPos::new(1, 2), CellPos::new(2, 2)],
    [CellPos::new(0, 0), CellPos::new(1, 1), CellPos::new(2, 2)],
    [CellPos::new(0, 2), CellPos::new(1, 1), CellPos::new(2, 0)],
];

/// The 3x3 grid.
///
/// Serializes as a nested array of `null | "X" | "O"`, row-major.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board {
    cells: [[Option<Mark>; BOARD_SIZE]; BOARD_SIZE],
}

impl Board {
    /// Create an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark at a position.
    #[inline]
    pub fn get(&self, pos: CellPos) -> Option<Mark> {
        self.cells[pos.row as usize][pos.col as usize]
    }

    /// Row-major view of every cell.
    pub fn rows(&self) -> &[[Option<Mark>; BOARD_SIZE]; BOARD_SIZE] {
        &self.cells
    }

    /// Place a mark. Only the target cell changes, and only on success.
    pub fn place(&mut self, mark: Mark, row: i64, col: i64) -> Result<CellPos, BoardError> {
        let pos = CellPos::from_coords(row, col).ok_or(BoardError::OutOfRange { row, col })?;
        let cell = &mut self.cells[pos.row as usize][pos.col as usize];
        if cell.is_some() {
            return Err(BoardError::CellOccupied(pos));
        }
        *cell = Some(mark);
        Ok(pos)
    }

    /// First fully populated line of one mark, in scan order.
    pub fn detect_line(&self) -> Option<WinningLine> {
        LINES.iter().find_map(|cells| {
            let mark = self.get(cells[0])?;
            cells[1..]
                .iter()
                .all(|pos| self.get(*pos) == Some(mark))
                .then_some(WinningLine { mark, cells: *cells })
        })
    }

    /// True iff no cell is empty.
    pub fn is_full(&self) -> bool {
        self.cells.iter().flatten().all(Option::is_some)
    }
}

// =============================================================================
// TESTS
// =============================================================================
