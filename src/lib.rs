/*!
# Collabsheet

A collaborative-spreadsheet backend, built in Rust.

## Overview

The server persists named sheets, lets clients edit cells (literal values or
arithmetic formulas), keeps a per-cell edit history, and pushes realtime cell
updates to every live viewer of a sheet over a websocket channel.

## Architecture

- **Cell model**: sparse mapping of cell keys (`A1`, `AZ230`) to
  value/formula/history records
- **Formula Evaluator**: substitutes cell references into an arithmetic
  expression and evaluates it with a restricted recursive-descent parser;
  failures become the `ERROR` sentinel value instead of request errors
- **Recalculation Engine**: re-evaluates every formula cell to a fixed point
  (bounded passes) after each edit, reporting exactly which cells changed and
  whether the sheet converged
- **Change Notifier**: broadcast hub delivering changed-cell and
  sheet-resize events to websocket subscribers
- **Persistence**: whole-store snapshots with Gzip compression and bincode
  serialization

## Modules

- **cell**: cell key grammar, `Cell`, edit history records
- **formula**: formula parsing and evaluation
- **sheet**: sheet state, recalculation engine, edit and rollback operations
- **notify**: realtime change notification
- **saving**: sheet store persistence with compression
- **config**: environment-driven server configuration
- **error**: error taxonomy and HTTP status mapping
- **app**: routing, handlers and shared state

## REST API Endpoints

- `POST /api/sheets` - Create a sheet
- `GET /api/sheets` - List sheets
- `GET /api/sheets/{id}` - Fetch a sheet (recalculates before responding)
- `DELETE /api/sheets/{id}` - Delete a sheet
- `PATCH /api/sheets/{id}/rename` - Rename a sheet
- `PATCH /api/sheets/{id}/cell` - Edit a cell (value or formula)
- `GET /api/sheets/{id}/history/{cell}` - Cell edit history
- `PATCH /api/sheets/{id}/rollback/{cell}` - Roll a cell back to a history entry
- `PATCH /api/sheets/{id}/add-row` - Grow the grid by one row
- `PATCH /api/sheets/{id}/add-col` - Grow the grid by one column
- `GET /api/sheets/{id}/subscribe` - Websocket stream of sheet events
*/

// Re-export all modules so they appear in the documentation
pub mod app;
pub mod cell;
pub mod config;
pub mod error;
pub mod formula;
pub mod notify;
pub mod saving;
pub mod sheet;

/// Re-export everything from these modules to make it easier to use
pub use cell::*;
pub use error::*;
pub use formula::*;
pub use notify::*;
pub use saving::*;
pub use sheet::*;
