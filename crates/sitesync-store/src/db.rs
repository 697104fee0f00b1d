use rusqlite::Connection;

use crate::error::Result;

/// Initialise every table this core reads or writes. Safe to call on every
/// startup: CREATE IF NOT EXISTS keeps it idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_users_table(conn)?;
    create_sites_tables(conn)?;
    create_sync_errors_table(conn)?;
    create_audit_logs_table(conn)?;
    create_kv_table(conn)?;
    Ok(())
}

fn create_users_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                  TEXT    NOT NULL PRIMARY KEY,
            name                TEXT    NOT NULL,
            name_masked         TEXT    NOT NULL,
            phone_hash          TEXT,
            phone_encrypted     TEXT,
            dob_hash            TEXT,
            dob_encrypted       TEXT,
            company_name        TEXT,
            trade_type          TEXT,
            external_system     TEXT,
            external_worker_id  TEXT,
            role                TEXT    NOT NULL DEFAULT 'WORKER',
            active              INTEGER NOT NULL DEFAULT 1,
            deactivated_at      TEXT,               -- ISO-8601 or NULL
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_users_external
            ON users (external_system, external_worker_id);
        CREATE INDEX IF NOT EXISTS idx_users_phone_hash ON users (phone_hash);
        ",
    )?;
    Ok(())
}

fn create_sites_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sites (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL,
            active      INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS site_memberships (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT    NOT NULL REFERENCES users(id),
            site_id     TEXT    NOT NULL REFERENCES sites(id),
            role        TEXT    NOT NULL DEFAULT 'WORKER',
            status      TEXT    NOT NULL DEFAULT 'ACTIVE',
            created_at  TEXT    NOT NULL,
            UNIQUE (user_id, site_id)
        ) STRICT;
        ",
    )?;
    Ok(())
}

fn create_sync_errors_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_errors (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            sync_type       TEXT    NOT NULL,
            status          TEXT    NOT NULL DEFAULT 'OPEN',
            error_code      TEXT    NOT NULL,
            error_message   TEXT    NOT NULL,
            payload         TEXT    NOT NULL,   -- JSON: timestamp, correlationId, lockName
            created_at      TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

fn create_audit_logs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS audit_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            actor_id    TEXT    NOT NULL,
            action      TEXT    NOT NULL,
            target_type TEXT    NOT NULL,
            target_id   TEXT    NOT NULL,
            reason      TEXT    NOT NULL,   -- JSON summary
            created_at  TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

fn create_kv_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv_entries (
            key             TEXT    NOT NULL PRIMARY KEY,
            value           TEXT    NOT NULL,
            expires_at_ms   INTEGER             -- NULL means no expiry
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('users','sites','site_memberships','sync_errors','audit_logs','kv_entries')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }
}
