use serde::de::DeserializeOwned;

use crate::error::StoreError;

fn corrupt(table: &'static str, column: &'static str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::CorruptRow {
        table,
        column,
        detail: detail.to_string(),
    }
}

/// Read column `idx`; a NULL or mistyped value is a corrupt row.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| corrupt(table, column, e))
}

/// Nullable column.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// Decode a JSON text column into `T`.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(table, column, format_args!("invalid JSON: {e}")))
}
