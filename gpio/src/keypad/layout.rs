use std::collections::HashSet;
use crate::keypad::InitError;

/// Which pins a matrix keypad is wired to and which symbol sits on each crossing.
///
/// `key_at(row, col)` is emitted when row `row` and column `col` are connected.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeypadLayout {
    row_pins: Vec<usize>,
    col_pins: Vec<usize>,
    keys: Vec<Vec<char>>,
}

impl KeypadLayout {
    /// Creates a layout, checking that the key matrix matches the pins and that no pin is used twice.
    pub fn new(
        row_pins: Vec<usize>,
        col_pins: Vec<usize>,
        keys: Vec<Vec<char>>,
    ) -> Result<Self, InitError> {
        if row_pins.is_empty() || col_pins.is_empty() {
            return Err(InitError::Empty);
        }

        let cols = keys.first().map_or(0, Vec::len);
        if keys.len() != row_pins.len() || keys.iter().any(|row| row.len() != col_pins.len()) {
            return Err(InitError::DimensionMismatch {
                rows: keys.len(),
                cols,
                expected_rows: row_pins.len(),
                expected_cols: col_pins.len(),
            });
        }

        let mut seen = HashSet::new();
        if let Some(&pin) = row_pins.iter().chain(&col_pins).find(|&&pin| !seen.insert(pin)) {
            return Err(InitError::DuplicatePin(pin));
        }

        Ok(KeypadLayout { row_pins, col_pins, keys })
    }

    /// The row pins, sensed as inputs.
    pub fn row_pins(&self) -> &[usize] {
        &self.row_pins
    }

    /// The column pins, driven as outputs.
    pub fn col_pins(&self) -> &[usize] {
        &self.col_pins
    }

    pub fn rows(&self) -> usize {
        self.row_pins.len()
    }

    pub fn cols(&self) -> usize {
        self.col_pins.len()
    }

    pub fn key_at(&self, row: usize, col: usize) -> Option<char> {
        self.keys.get(row)?.get(col).copied()
    }
}

impl Default for KeypadLayout {
    /// The common 4x4 membrane keypad wired to a Raspberry Pi header.
    fn default() -> Self {
        KeypadLayout {
            row_pins: vec![18, 23, 24, 25],
            col_pins: vec![4, 17, 27, 22],
            keys: vec![
                vec!['1', '2', '3', 'A'],
                vec!['4', '5', '6', 'B'],
                vec!['7', '8', '9', 'C'],
                vec!['*', '0', '#', 'D'],
            ],
        }
    }
}
