use crate::errors::Result;
use rusqlite::Connection;

/// Schema version written by the initialization script.
pub const SCHEMA_VERSION: i32 = 1;

/// Read the schema version recorded in the database header.
///
/// A database that has never been initialized reports 0.
pub fn current_schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Initialize the database schema if it has not been initialized yet.
///
/// When the stored version is 0 the full version-1 script runs together
/// with the version bump inside one transaction, so a mid-script failure
/// rolls back and leaves the version at 0. Any version at or above
/// `SCHEMA_VERSION` (including versions newer than this build understands)
/// is left untouched.
pub fn apply_migrations(conn: &Connection) -> Result<()> {
    let version = current_schema_version(conn)?;
    if version >= SCHEMA_VERSION {
        log::debug!("Schema already at version {}, nothing to do", version);
        return Ok(());
    }

    log::info!("Initializing schema version {}...", SCHEMA_VERSION);

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(SCHEMA_V1)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;

    log::info!("Schema version {} initialized successfully", SCHEMA_VERSION);
    Ok(())
}

// Version-1 schema: the three registry tables. UserDevice carries no
// uniqueness constraint; the store enforces pair uniqueness with a
// check before insert. PushTransaction.device_id carries no foreign key.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS Device (
    device_id            TEXT PRIMARY KEY NOT NULL,
    transport_identifier TEXT NOT NULL,
    delivery_key         TEXT
);

CREATE TABLE IF NOT EXISTS UserDevice (
    device_id TEXT NOT NULL,
    user_id   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS PushTransaction (
    transaction_id TEXT PRIMARY KEY NOT NULL,
    device_id      TEXT NOT NULL,
    event_id       TEXT
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_reports_version_zero() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(current_schema_version(&conn).unwrap(), 0);
    }

    #[test]
    fn version_set_through_pragma_is_read_back() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        assert_eq!(current_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn apply_migrations_creates_tables_and_sets_version() {
        let conn = Connection::open_in_memory().unwrap();

        apply_migrations(&conn).unwrap();

        assert_eq!(current_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(
            table_names(&conn),
            vec!["Device", "PushTransaction", "UserDevice"]
        );
    }

    #[test]
    fn apply_migrations_twice_leaves_data_intact() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO Device (device_id, transport_identifier) VALUES ('d1', 't1')",
            [],
        )
        .unwrap();

        apply_migrations(&conn).unwrap();

        assert_eq!(current_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM Device", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn newer_schema_versions_are_left_alone() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 5).unwrap();

        apply_migrations(&conn).unwrap();

        assert_eq!(current_schema_version(&conn).unwrap(), 5);
        assert!(table_names(&conn).is_empty());
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }
}
