//! SQL shared by both backends
//!
//! Postgres and SQLite agree on `INSERT ... SELECT` and
//! `ON CONFLICT ... DO UPDATE SET c = excluded.c`, so the merge statements
//! are built once from the table catalog.

use crate::tables::TableKind;

/// `INSERT INTO <table> (cols) SELECT cols FROM <table>_staging`
pub fn insert_from_staging(table: TableKind) -> String {
    let columns = table.column_list();
    format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} FROM {staging}",
        table = table.table_name(),
        columns = columns,
        staging = table.staging_table_name(),
    )
}

/// Insert staged rows, overwriting every non-key column of rows that already
/// exist under the same `document_id`.
///
/// The `WHERE true` keeps SQLite from reading `ON CONFLICT` as a join clause.
pub fn upsert_from_staging(table: TableKind) -> String {
    let assignments = table
        .update_columns()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "{insert} WHERE true ON CONFLICT (document_id) DO UPDATE SET {assignments}",
        insert = insert_from_staging(table),
        assignments = assignments,
    )
}

/// Delete child rows belonging to any document staged in this batch
pub fn delete_children_of_staged(table: TableKind) -> String {
    format!(
        "DELETE FROM {table} WHERE document_id IN (SELECT document_id FROM {staging})",
        table = table.table_name(),
        staging = TableKind::Products.staging_table_name(),
    )
}

pub fn delete_all(table_name: &str) -> String {
    format!("DELETE FROM {}", table_name)
}
