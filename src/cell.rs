use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SheetError;

/// A single cell in the sparse sheet mapping.
///
/// `value` always holds the displayed text. `formula` is the source
/// expression (including the leading `=`) when the value is derived, or the
/// empty string for literal cells. `history` is append-only; rollback adds a
/// new record instead of truncating.
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct Cell {
    pub value: String,
    pub formula: String,
    pub history: Vec<HistoryEntry>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct HistoryEntry {
    pub edited_by_name: String,
    pub edited_by_email: String,
    pub old_value: String,
    pub new_value: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(editor: &Editor, old_value: String, new_value: String) -> Self {
        HistoryEntry {
            edited_by_name: editor.name.clone(),
            edited_by_email: editor.email.clone(),
            old_value,
            new_value,
            timestamp: Utc::now(),
        }
    }
}

/// Identity of whoever performed an edit. Supplied by the caller; the core
/// does not authenticate anyone.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Editor {
    #[serde(default = "default_editor_name")]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

fn default_editor_name() -> String {
    "anonymous".to_string()
}

impl Default for Editor {
    fn default() -> Self {
        Editor {
            name: default_editor_name(),
            email: String::new(),
        }
    }
}

pub fn column_letters(col: u32) -> String {
    // Bijective base-26: col 0 -> "A", 25 -> "Z", 26 -> "AA".
    let mut col = col as i64 + 1;
    let mut result = String::new();
    while col > 0 {
        col -= 1;
        result.push(((col % 26) as u8 + b'A') as char);
        col /= 26;
    }
    result.chars().rev().collect()
}

pub fn letters_to_column(letters: &str) -> u32 {
    let n = letters
        .chars()
        .fold(0i64, |acc, c| acc * 26 + (c as i64 - 'A' as i64 + 1));
    (n - 1) as u32
}

pub fn cell_key(row: u32, col: u32) -> String {
    format!("{}{}", column_letters(col), row)
}

/// Parses a cell key like `B12` into `(row, col)`, with the row 1-indexed
/// and the column 0-indexed. A malformed key is a hard failure, not an empty
/// lookup.
pub fn parse_cell_key(key: &str) -> Result<(u32, u32), SheetError> {
    let mut letters = String::new();
    let mut digits = String::new();

    for c in key.chars() {
        if c.is_ascii_uppercase() {
            if !digits.is_empty() {
                return Err(SheetError::InvalidCellKey(key.to_string()));
            }
            letters.push(c);
        } else if c.is_ascii_digit() {
            digits.push(c);
        } else {
            return Err(SheetError::InvalidCellKey(key.to_string()));
        }
    }

    // Six letters already addresses ~321 million columns; a seventh would
    // push the column index past u32 range.
    if letters.is_empty() || letters.len() > 6 || digits.is_empty() {
        return Err(SheetError::InvalidCellKey(key.to_string()));
    }

    let row: u32 = digits
        .parse()
        .map_err(|_| SheetError::InvalidCellKey(key.to_string()))?;
    if row == 0 {
        return Err(SheetError::InvalidCellKey(key.to_string()));
    }

    Ok((row, letters_to_column(&letters)))
}
