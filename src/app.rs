//! HTTP service layer: routing, handlers and shared state.
//!
//! Every mutation follows the same shape: take the store lock, apply the
//! change, run recalculation where the operation calls for it, persist the
//! snapshot while still holding the lock, then publish realtime events after
//! the lock is released. The single lock is what serializes concurrent edits
//! to a sheet; the core assumes exclusive access for the whole
//! edit-plus-recalculate window.

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::cell::Editor;
use crate::config::Config;
use crate::error::SheetError;
use crate::notify::{BroadcastHub, ChangeNotifier, SheetEvent};
use crate::saving::{self, SheetStore};
use crate::sheet::Sheet;

pub struct AppState {
    sheets: Mutex<SheetStore>,
    hub: BroadcastHub,
    config: Config,
}

impl AppState {
    pub fn new(store: SheetStore, config: Config) -> Self {
        AppState {
            sheets: Mutex::new(store),
            hub: BroadcastHub::new(256),
            config,
        }
    }

    /// Writes the snapshot while the caller still holds the store lock, so
    /// the persisted state always matches a fully recalculated mapping.
    fn persist(&self, sheets: &SheetStore) -> Result<(), SheetError> {
        saving::save_store(sheets, &self.config.data_path)?;
        Ok(())
    }

    fn publish_all(&self, sheet_id: Uuid, events: Vec<SheetEvent>) {
        for event in events {
            self.hub.publish(sheet_id, event);
        }
    }
}

#[derive(Deserialize)]
struct CreateSheetPayload {
    rows: Option<u32>,
    cols: Option<u32>,
}

#[derive(Deserialize)]
struct RenamePayload {
    name: String,
}

#[derive(Deserialize)]
struct CellEditPayload {
    cell: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    formula: String,
    #[serde(default)]
    editor: Editor,
}

#[derive(Deserialize)]
struct RollbackPayload {
    history_index: usize,
    #[serde(default)]
    editor: Editor,
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = saving::load_or_default(&config.data_path)?;
    info!(
        "loaded {} sheet(s) from {}",
        store.len(),
        config.data_path.display()
    );

    let addr = config.addr;
    let state = Arc::new(AppState::new(store, config));

    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{addr}");
    axum::serve(listener, router(state)).await?;

    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sheets", post(create_sheet).get(list_sheets))
        .route("/api/sheets/:sheet_id", get(get_sheet).delete(delete_sheet))
        .route("/api/sheets/:sheet_id/rename", patch(rename_sheet))
        .route("/api/sheets/:sheet_id/cell", patch(update_cell))
        .route("/api/sheets/:sheet_id/history/:cell_key", get(cell_history))
        .route("/api/sheets/:sheet_id/rollback/:cell_key", patch(rollback_cell))
        .route("/api/sheets/:sheet_id/add-row", patch(add_row))
        .route("/api/sheets/:sheet_id/add-col", patch(add_column))
        .route("/api/sheets/:sheet_id/subscribe", get(subscribe))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn sheet_json(id: Uuid, sheet: &Sheet) -> serde_json::Value {
    json!({
        "id": id,
        "name": sheet.name,
        "rows": sheet.rows,
        "cols": sheet.cols,
        "cells": sheet.cells,
    })
}

async fn create_sheet(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSheetPayload>,
) -> Result<impl IntoResponse, SheetError> {
    let rows = payload
        .rows
        .filter(|r| *r > 0)
        .ok_or(SheetError::MissingDimensions)?;
    let cols = payload
        .cols
        .filter(|c| *c > 0)
        .ok_or(SheetError::MissingDimensions)?;

    let id = Uuid::new_v4();
    let body = {
        let mut sheets = state.sheets.lock().unwrap();
        sheets.insert(id, Sheet::new("New Sheet", rows, cols));
        state.persist(&sheets)?;
        sheet_json(id, &sheets[&id])
    };

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Sheet created successfully", "sheet": body })),
    ))
}

async fn list_sheets(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sheets = state.sheets.lock().unwrap();
    let summaries: Vec<serde_json::Value> = sheets
        .iter()
        .map(|(id, sheet)| {
            json!({
                "id": id,
                "name": sheet.name,
                "rows": sheet.rows,
                "cols": sheet.cols,
            })
        })
        .collect();

    Json(json!({ "sheets": summaries }))
}

/// Fetch re-runs recalculation so the response honours the eventual
/// invariant: every formula cell's value is consistent with the current
/// mapping. Any drift is persisted and broadcast like an edit.
async fn get_sheet(
    State(state): State<Arc<AppState>>,
    Path(sheet_id): Path<Uuid>,
) -> Result<impl IntoResponse, SheetError> {
    let (body, converged, events) = {
        let mut sheets = state.sheets.lock().unwrap();
        let sheet = sheets.get_mut(&sheet_id).ok_or(SheetError::SheetNotFound)?;

        let outcome = sheet.recalculate();
        let events: Vec<SheetEvent> = outcome
            .changed
            .iter()
            .filter_map(|key| sheet.cell_update(key))
            .map(SheetEvent::from)
            .collect();
        let body = sheet_json(sheet_id, sheet);

        if !outcome.changed.is_empty() {
            state.persist(&sheets)?;
        }
        (body, outcome.converged, events)
    };

    state.publish_all(sheet_id, events);

    Ok(Json(json!({
        "message": "Sheet fetched successfully",
        "sheet": body,
        "converged": converged,
    })))
}

async fn delete_sheet(
    State(state): State<Arc<AppState>>,
    Path(sheet_id): Path<Uuid>,
) -> Result<impl IntoResponse, SheetError> {
    let mut sheets = state.sheets.lock().unwrap();
    sheets
        .remove(&sheet_id)
        .ok_or(SheetError::SheetNotFound)?;
    state.persist(&sheets)?;

    Ok(Json(json!({ "message": "Sheet deleted successfully" })))
}

async fn rename_sheet(
    State(state): State<Arc<AppState>>,
    Path(sheet_id): Path<Uuid>,
    Json(payload): Json<RenamePayload>,
) -> Result<impl IntoResponse, SheetError> {
    let body = {
        let mut sheets = state.sheets.lock().unwrap();
        let sheet = sheets.get_mut(&sheet_id).ok_or(SheetError::SheetNotFound)?;
        sheet.name = payload.name;
        let body = sheet_json(sheet_id, sheet);
        state.persist(&sheets)?;
        body
    };

    Ok(Json(json!({ "message": "Sheet renamed successfully", "sheet": body })))
}

async fn update_cell(
    State(state): State<Arc<AppState>>,
    Path(sheet_id): Path<Uuid>,
    Json(payload): Json<CellEditPayload>,
) -> Result<impl IntoResponse, SheetError> {
    let (body, converged, events) = {
        let mut sheets = state.sheets.lock().unwrap();
        let sheet = sheets.get_mut(&sheet_id).ok_or(SheetError::SheetNotFound)?;

        let outcome = sheet.edit_cell(
            &payload.cell,
            &payload.value,
            &payload.formula,
            &payload.editor,
        )?;

        // The edited cell first, then everything recalculation rippled to.
        // Receivers tolerate the duplicate when the edited cell is in both.
        let mut events = vec![SheetEvent::from(outcome.edited)];
        events.extend(
            outcome
                .recalc
                .changed
                .iter()
                .filter_map(|key| sheet.cell_update(key))
                .map(SheetEvent::from),
        );

        let body = sheet_json(sheet_id, sheet);
        state.persist(&sheets)?;
        (body, outcome.recalc.converged, events)
    };

    state.publish_all(sheet_id, events);

    Ok(Json(json!({
        "message": "Cell updated successfully",
        "sheet": body,
        "converged": converged,
    })))
}

async fn cell_history(
    State(state): State<Arc<AppState>>,
    Path((sheet_id, cell_key)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, SheetError> {
    let sheets = state.sheets.lock().unwrap();
    let sheet = sheets.get(&sheet_id).ok_or(SheetError::SheetNotFound)?;

    Ok(Json(json!({
        "message": "Cell history fetched",
        "history": sheet.history(&cell_key),
    })))
}

async fn rollback_cell(
    State(state): State<Arc<AppState>>,
    Path((sheet_id, cell_key)): Path<(Uuid, String)>,
    Json(payload): Json<RollbackPayload>,
) -> Result<impl IntoResponse, SheetError> {
    let (update, history) = {
        let mut sheets = state.sheets.lock().unwrap();
        let sheet = sheets.get_mut(&sheet_id).ok_or(SheetError::SheetNotFound)?;

        let update = sheet.rollback_cell(&cell_key, payload.history_index, &payload.editor)?;
        let history = sheet.history(&cell_key).to_vec();
        state.persist(&sheets)?;
        (update, history)
    };

    state.publish_all(sheet_id, vec![SheetEvent::from(update.clone())]);

    Ok(Json(json!({
        "message": "Rollback successful",
        "cell": update.cell,
        "value": update.value,
        "history": history,
    })))
}

async fn add_row(
    State(state): State<Arc<AppState>>,
    Path(sheet_id): Path<Uuid>,
) -> Result<impl IntoResponse, SheetError> {
    resize_sheet(state, sheet_id, "Row added successfully", Sheet::add_row).await
}

async fn add_column(
    State(state): State<Arc<AppState>>,
    Path(sheet_id): Path<Uuid>,
) -> Result<impl IntoResponse, SheetError> {
    resize_sheet(state, sheet_id, "Column added successfully", Sheet::add_column).await
}

async fn resize_sheet(
    state: Arc<AppState>,
    sheet_id: Uuid,
    message: &'static str,
    grow: fn(&mut Sheet) -> (u32, u32),
) -> Result<Json<serde_json::Value>, SheetError> {
    let (rows, cols, body) = {
        let mut sheets = state.sheets.lock().unwrap();
        let sheet = sheets.get_mut(&sheet_id).ok_or(SheetError::SheetNotFound)?;
        let (rows, cols) = grow(sheet);
        let body = sheet_json(sheet_id, sheet);
        state.persist(&sheets)?;
        (rows, cols, body)
    };

    state.publish_all(sheet_id, vec![SheetEvent::SheetResized { rows, cols }]);

    Ok(Json(json!({ "message": message, "sheet": body })))
}

/// Websocket subscription: streams this sheet's events as JSON text frames.
async fn subscribe(
    Path(sheet_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = state.hub.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, sheet_id, rx))
}

async fn stream_events(
    mut socket: WebSocket,
    sheet_id: Uuid,
    mut rx: tokio::sync::broadcast::Receiver<(Uuid, SheetEvent)>,
) {
    loop {
        match rx.recv().await {
            Ok((id, event)) if id == sheet_id => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            Ok(_) => continue,
            // Lagged means we dropped events for a slow client; it can
            // refetch the sheet, so just keep streaming.
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;

    fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            addr: "127.0.0.1:0".parse().unwrap(),
            data_path: dir.path().join("sheets.bin.gz"),
        };
        (Arc::new(AppState::new(SheetStore::new(), config)), dir)
    }

    fn only_sheet_id(state: &AppState) -> Uuid {
        let sheets = state.sheets.lock().unwrap();
        *sheets.keys().next().expect("one sheet")
    }

    #[tokio::test]
    async fn create_requires_dimensions() {
        let (state, _dir) = test_state();
        let result = create_sheet(
            State(state.clone()),
            Json(CreateSheetPayload {
                rows: None,
                cols: Some(4),
            }),
        )
        .await;
        assert!(matches!(result, Err(SheetError::MissingDimensions)));
        assert!(state.sheets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_persists_and_stores_sheet() {
        let (state, _dir) = test_state();
        create_sheet(
            State(state.clone()),
            Json(CreateSheetPayload {
                rows: Some(5),
                cols: Some(4),
            }),
        )
        .await
        .unwrap();

        let id = only_sheet_id(&state);
        {
            let sheets = state.sheets.lock().unwrap();
            assert_eq!(sheets[&id].rows, 5);
            assert_eq!(sheets[&id].cols, 4);
        }

        let reloaded = saving::load_store(&state.config.data_path).unwrap();
        assert!(reloaded.contains_key(&id));
    }

    #[tokio::test]
    async fn update_cell_broadcasts_edit_and_ripples() {
        let (state, _dir) = test_state();
        create_sheet(
            State(state.clone()),
            Json(CreateSheetPayload {
                rows: Some(10),
                cols: Some(10),
            }),
        )
        .await
        .unwrap();
        let id = only_sheet_id(&state);

        update_cell(
            State(state.clone()),
            Path(id),
            Json(CellEditPayload {
                cell: "A1".to_string(),
                value: "3".to_string(),
                formula: String::new(),
                editor: Editor::default(),
            }),
        )
        .await
        .unwrap();
        update_cell(
            State(state.clone()),
            Path(id),
            Json(CellEditPayload {
                cell: "B1".to_string(),
                value: String::new(),
                formula: "=A1*2".to_string(),
                editor: Editor::default(),
            }),
        )
        .await
        .unwrap();

        let mut rx = state.hub.subscribe();
        update_cell(
            State(state.clone()),
            Path(id),
            Json(CellEditPayload {
                cell: "A1".to_string(),
                value: "5".to_string(),
                formula: String::new(),
                editor: Editor::default(),
            }),
        )
        .await
        .unwrap();

        let (got_id, first) = rx.try_recv().unwrap();
        assert_eq!(got_id, id);
        assert_eq!(
            first,
            SheetEvent::CellUpdated {
                cell: "A1".to_string(),
                value: "5".to_string(),
                formula: String::new(),
            }
        );
        let (_, second) = rx.try_recv().unwrap();
        assert_eq!(
            second,
            SheetEvent::CellUpdated {
                cell: "B1".to_string(),
                value: "10".to_string(),
                formula: "=A1*2".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn get_sheet_recalculates_persists_and_broadcasts_drift() {
        let (state, _dir) = test_state();

        // A snapshot whose formula cell is stale relative to the mapping,
        // as if the referenced cell changed after the last recalculation.
        let id = Uuid::new_v4();
        {
            let mut sheets = state.sheets.lock().unwrap();
            let mut sheet = Sheet::new("stale", 5, 5);
            sheet.cells.insert(
                "A1".to_string(),
                Cell {
                    value: "2".to_string(),
                    formula: String::new(),
                    history: Vec::new(),
                },
            );
            sheet.cells.insert(
                "B1".to_string(),
                Cell {
                    value: "99".to_string(),
                    formula: "=A1+1".to_string(),
                    history: Vec::new(),
                },
            );
            sheets.insert(id, sheet);
        }

        let mut rx = state.hub.subscribe();
        get_sheet(State(state.clone()), Path(id)).await.unwrap();

        // Drift recalculated in memory...
        assert_eq!(state.sheets.lock().unwrap()[&id].cells["B1"].value, "3");

        // ...broadcast to subscribers...
        let (got_id, event) = rx.try_recv().unwrap();
        assert_eq!(got_id, id);
        assert_eq!(
            event,
            SheetEvent::CellUpdated {
                cell: "B1".to_string(),
                value: "3".to_string(),
                formula: "=A1+1".to_string(),
            }
        );

        // ...and persisted to the snapshot.
        let reloaded = saving::load_store(&state.config.data_path).unwrap();
        assert_eq!(reloaded[&id].cells["B1"].value, "3");
    }

    #[tokio::test]
    async fn get_sheet_at_fixed_point_publishes_nothing() {
        let (state, _dir) = test_state();
        create_sheet(
            State(state.clone()),
            Json(CreateSheetPayload {
                rows: Some(3),
                cols: Some(3),
            }),
        )
        .await
        .unwrap();
        let id = only_sheet_id(&state);

        let mut rx = state.hub.subscribe();
        get_sheet(State(state.clone()), Path(id)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_cell_on_unknown_sheet_is_not_found() {
        let (state, _dir) = test_state();
        let result = update_cell(
            State(state),
            Path(Uuid::new_v4()),
            Json(CellEditPayload {
                cell: "A1".to_string(),
                value: "1".to_string(),
                formula: String::new(),
                editor: Editor::default(),
            }),
        )
        .await;
        assert!(matches!(result, Err(SheetError::SheetNotFound)));
    }

    #[tokio::test]
    async fn add_row_publishes_resize() {
        let (state, _dir) = test_state();
        create_sheet(
            State(state.clone()),
            Json(CreateSheetPayload {
                rows: Some(2),
                cols: Some(2),
            }),
        )
        .await
        .unwrap();
        let id = only_sheet_id(&state);

        let mut rx = state.hub.subscribe();
        add_row(State(state.clone()), Path(id)).await.unwrap();

        let (_, event) = rx.try_recv().unwrap();
        assert_eq!(event, SheetEvent::SheetResized { rows: 3, cols: 2 });
        assert_eq!(state.sheets.lock().unwrap()[&id].rows, 3);
    }

    #[tokio::test]
    async fn delete_removes_sheet() {
        let (state, _dir) = test_state();
        create_sheet(
            State(state.clone()),
            Json(CreateSheetPayload {
                rows: Some(2),
                cols: Some(2),
            }),
        )
        .await
        .unwrap();
        let id = only_sheet_id(&state);

        delete_sheet(State(state.clone()), Path(id)).await.unwrap();
        assert!(state.sheets.lock().unwrap().is_empty());

        let again = delete_sheet(State(state), Path(id)).await;
        assert!(matches!(again, Err(SheetError::SheetNotFound)));
    }
}
