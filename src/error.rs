use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error taxonomy for the sheet service.
///
/// Formula evaluation failures are deliberately NOT represented here: a bad
/// formula produces the `ERROR` sentinel value inside the cell and the
/// request still succeeds. Only hard failures (unknown sheet, malformed cell
/// key, store I/O) surface as `SheetError`.
#[derive(Debug, Error)]
pub enum SheetError {
    #[error("Sheet not found")]
    SheetNotFound,

    #[error("Rows and Columns are required")]
    MissingDimensions,

    #[error("Invalid cell key: {0}")]
    InvalidCellKey(String),

    #[error("No history available")]
    NoHistory,

    #[error("Invalid history index: {0}")]
    InvalidHistoryIndex(usize),

    #[error("Store failure: {0}")]
    Store(#[from] std::io::Error),
}

impl SheetError {
    pub fn status(&self) -> StatusCode {
        match self {
            SheetError::SheetNotFound => StatusCode::NOT_FOUND,
            SheetError::MissingDimensions
            | SheetError::InvalidCellKey(_)
            | SheetError::NoHistory
            | SheetError::InvalidHistoryIndex(_) => StatusCode::BAD_REQUEST,
            SheetError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SheetError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "message": self.to_string() }));
        (self.status(), body).into_response()
    }
}
