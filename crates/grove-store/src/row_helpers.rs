use chrono::Utc;

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Narrow an INTEGER column to `u32`, rejecting negative or oversized values.
pub fn get_u32(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<u32, StoreError> {
    let raw: i64 = get(row, idx, table, column)?;
    u32::try_from(raw).map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("out of range: {raw}"),
    })
}

/// RFC 3339 timestamp for created_at / updated_at columns.
pub fn now() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn get_u32_accepts_in_range() {
        let conn = Connection::open_in_memory().unwrap();
        let value = conn
            .query_row("SELECT 15", [], |row| Ok(get_u32(row, 0, "factories", "child_count")))
            .unwrap();
        assert_eq!(value.unwrap(), 15);
    }

    #[test]
    fn get_u32_rejects_negative() {
        let conn = Connection::open_in_memory().unwrap();
        let value = conn
            .query_row("SELECT -1", [], |row| Ok(get_u32(row, 0, "factories", "child_count")))
            .unwrap();
        assert!(matches!(
            value,
            Err(StoreError::CorruptRow { table: "factories", column: "child_count", .. })
        ));
    }

    #[test]
    fn get_reports_column_on_type_mismatch() {
        let conn = Connection::open_in_memory().unwrap();
        let value = conn
            .query_row("SELECT 'abc'", [], |row| Ok(get::<i64>(row, 0, "children", "value")))
            .unwrap();
        assert!(matches!(
            value,
            Err(StoreError::CorruptRow { table: "children", column: "value", .. })
        ));
    }

    #[test]
    fn now_is_rfc3339() {
        assert!(chrono::DateTime::parse_from_rfc3339(&now()).is_ok());
    }
}
