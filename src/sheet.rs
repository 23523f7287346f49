//! Sheet state and the recalculation engine.
//!
//! A sheet keeps a sparse `BTreeMap` of cell key -> [`Cell`]; unpopulated
//! cells implicitly read as empty. Formulas carry their dependencies only as
//! text, so propagation works by re-evaluating every formula cell until the
//! grid stops changing or [`MAX_RECALC_PASSES`] is hit. That is O(passes ×
//! formula cells × expression size) per edit, which is fine at the sheet
//! sizes this service hosts.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::cell::{Cell, Editor, HistoryEntry, parse_cell_key};
use crate::error::SheetError;
use crate::formula;

/// Upper bound on full recalculation passes. Cyclic or oscillating formula
/// graphs stop here instead of spinning forever; the outcome is reported as
/// non-converged rather than raised as an error.
pub const MAX_RECALC_PASSES: u32 = 10;

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Sheet {
    pub name: String,
    pub rows: u32,
    pub cols: u32,
    /// Sparse cell mapping. Keys follow the `<letters><row>` grammar; a
    /// populated key outside the declared rows/cols bounds is tolerated.
    pub cells: BTreeMap<String, Cell>,
}

/// One cell's post-edit state, in the shape the realtime channel carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellUpdate {
    pub cell: String,
    pub value: String,
    pub formula: String,
}

/// Result of one full recalculation.
#[derive(Debug, Clone)]
pub struct RecalcOutcome {
    /// Keys whose value differs from their value when the call started.
    pub changed: BTreeSet<String>,
    /// False when the pass budget ran out before a clean pass. Values are
    /// left as the last pass produced them.
    pub converged: bool,
}

/// Result of [`Sheet::edit_cell`]: the directly edited cell plus everything
/// the recalculation touched, ready to hand to the change notifier.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub edited: CellUpdate,
    pub recalc: RecalcOutcome,
}

impl Sheet {
    pub fn new(name: &str, rows: u32, cols: u32) -> Self {
        Sheet {
            name: name.to_string(),
            rows,
            cols,
            cells: BTreeMap::new(),
        }
    }

    fn lookup_value(&self, key: &str) -> Option<String> {
        self.cells.get(key).map(|cell| cell.value.clone())
    }

    /// Re-evaluates every formula cell until the grid reaches a fixed point
    /// or the pass budget runs out.
    ///
    /// Each pass walks a stable snapshot of the keys in lexicographic order;
    /// later cells in that order see earlier cells' just-updated values
    /// within the same pass. Evaluation errors do not abort the pass: the
    /// failing cell's value becomes the `ERROR` sentinel and that counts as
    /// a change like any other. Formula and history are never touched here.
    pub fn recalculate(&mut self) -> RecalcOutcome {
        let entry_values: BTreeMap<String, String> = self
            .cells
            .iter()
            .filter(|(_, cell)| formula::is_formula(&cell.formula))
            .map(|(key, cell)| (key.clone(), cell.value.clone()))
            .collect();

        let mut changed = true;
        let mut passes = 0;
        while changed && passes < MAX_RECALC_PASSES {
            changed = false;
            passes += 1;

            let keys: Vec<String> = self.cells.keys().cloned().collect();
            for key in keys {
                let formula_text = match self.cells.get(&key) {
                    Some(cell) if formula::is_formula(&cell.formula) => cell.formula.clone(),
                    _ => continue,
                };

                let new_value =
                    formula::evaluate(&formula_text, |r| self.lookup_value(r)).into_value();

                if let Some(cell) = self.cells.get_mut(&key) {
                    if cell.value != new_value {
                        cell.value = new_value;
                        changed = true;
                    }
                }
            }
        }

        let converged = !changed;
        if !converged {
            warn!(
                "sheet {:?} did not converge after {} recalculation passes",
                self.name, MAX_RECALC_PASSES
            );
        }

        let changed = entry_values
            .into_iter()
            .filter(|(key, old)| self.cells.get(key).map(|c| &c.value) != Some(old))
            .map(|(key, _)| key)
            .collect();

        RecalcOutcome { changed, converged }
    }

    /// Applies one edit: computes the final value, appends exactly one
    /// history record, writes the cell, then recalculates the whole sheet.
    ///
    /// A supplied formula (leading `=`) wins over `raw_value` and is
    /// evaluated immediately against the pre-edit mapping; otherwise the raw
    /// value is stored as-is.
    pub fn edit_cell(
        &mut self,
        key: &str,
        raw_value: &str,
        raw_formula: &str,
        editor: &Editor,
    ) -> Result<EditOutcome, SheetError> {
        parse_cell_key(key)?;

        let has_formula = formula::is_formula(raw_formula);
        let final_value = if has_formula {
            formula::evaluate(raw_formula, |r| self.lookup_value(r)).into_value()
        } else {
            raw_value.to_string()
        };

        let old_cell = self.cells.get(key);
        let old_value = old_cell.map(|c| c.value.clone()).unwrap_or_default();
        let mut history = old_cell.map(|c| c.history.clone()).unwrap_or_default();
        history.push(HistoryEntry::new(editor, old_value, final_value.clone()));

        self.cells.insert(
            key.to_string(),
            Cell {
                value: final_value.clone(),
                formula: if has_formula {
                    raw_formula.to_string()
                } else {
                    String::new()
                },
                history,
            },
        );

        let recalc = self.recalculate();

        Ok(EditOutcome {
            edited: CellUpdate {
                cell: key.to_string(),
                value: final_value,
                formula: if has_formula {
                    raw_formula.to_string()
                } else {
                    String::new()
                },
            },
            recalc,
        })
    }

    /// Restores a cell to the `new_value` of the history record at `index`.
    ///
    /// The rollback itself is recorded as a fresh history entry; history only
    /// ever grows. The stored formula is left untouched, so a later
    /// recalculation may overwrite the rolled-back value again.
    pub fn rollback_cell(
        &mut self,
        key: &str,
        index: usize,
        editor: &Editor,
    ) -> Result<CellUpdate, SheetError> {
        let cell = self.cells.get_mut(key).ok_or(SheetError::NoHistory)?;
        if cell.history.is_empty() {
            return Err(SheetError::NoHistory);
        }

        let record = cell
            .history
            .get(index)
            .ok_or(SheetError::InvalidHistoryIndex(index))?;
        let rollback_value = record.new_value.clone();

        let old_value = std::mem::replace(&mut cell.value, rollback_value.clone());
        cell.history
            .push(HistoryEntry::new(editor, old_value, rollback_value.clone()));

        Ok(CellUpdate {
            cell: key.to_string(),
            value: rollback_value,
            formula: cell.formula.clone(),
        })
    }

    pub fn history(&self, key: &str) -> &[HistoryEntry] {
        self.cells.get(key).map(|c| c.history.as_slice()).unwrap_or(&[])
    }

    /// Grid growth is monotonic: rows/cols only ever increase.
    pub fn add_row(&mut self) -> (u32, u32) {
        self.rows += 1;
        (self.rows, self.cols)
    }

    pub fn add_column(&mut self) -> (u32, u32) {
        self.cols += 1;
        (self.rows, self.cols)
    }

    /// Current state of a cell in notification shape, if populated.
    pub fn cell_update(&self, key: &str) -> Option<CellUpdate> {
        self.cells.get(key).map(|cell| CellUpdate {
            cell: key.to_string(),
            value: cell.value.clone(),
            formula: cell.formula.clone(),
        })
    }
}
