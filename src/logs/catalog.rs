//! `main.db`: the `LogCollections` table naming every known source
//! (spec.md §6 persisted state). Grounded directly on
//! `logsmanagement/db_api.c`'s `MAIN_COLLECTIONS_TABLE` schema --
//! `Stream_Tag`/`Log_Source_Path`/`Type`/`DB_Dir`, uniquely keyed by
//! `(Stream_Tag, DB_Dir)` rather than by name alone, so the same tag can
//! be reused across independently-rotated `DB_Dir`s -- and its
//! `sqlite3_prepare_v2`/`PRAGMA user_version`/`BEGIN TRANSACTION` pattern,
//! translated to `rusqlite`.

use std::path::Path;

use rusqlite::{params, Connection};

use crate::error::Result;

const SCHEMA_VERSION: i64 = 1;

pub struct CollectionRow {
    pub id: i64,
    pub stream_tag: String,
    pub log_source_path: String,
    pub log_type: i64,
    pub db_dir: String,
}

pub struct Catalog {
    conn: std::sync::Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if user_version == 0 {
            conn.execute_batch(
                "BEGIN TRANSACTION;
                 CREATE TABLE IF NOT EXISTS LogCollections (
                     Id              INTEGER PRIMARY KEY,
                     Stream_Tag      TEXT    NOT NULL,
                     Log_Source_Path TEXT    NOT NULL,
                     Type            INTEGER NOT NULL,
                     DB_Dir          TEXT    NOT NULL,
                     UNIQUE(Stream_Tag, DB_Dir)
                 );
                 COMMIT;",
            )?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    /// Insert a new collection row, returning its assigned `Id`. Fails if
    /// `(stream_tag, db_dir)` already exists -- callers that want
    /// idempotent-by-tag registration should check [`Catalog::find`] first,
    /// mirroring the original's own lookup-before-insert sequence.
    pub fn insert_collection(&self, stream_tag: &str, log_source_path: &str, log_type: i64, db_dir: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        conn.execute(
            "INSERT INTO LogCollections (Stream_Tag, Log_Source_Path, Type, DB_Dir) VALUES (?1, ?2, ?3, ?4)",
            params![stream_tag, log_source_path, log_type, db_dir],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Mirrors `db_api.c`'s `SELECT COUNT(*), Id, DB_Dir FROM LogCollections
    /// WHERE Stream_Tag = ? AND Log_Source_Path = ? AND Type = ?`: look up
    /// an existing collection by its full identity tuple rather than by
    /// `DB_Dir` (which the caller doesn't know yet on first registration).
    pub fn find(&self, stream_tag: &str, log_source_path: &str, log_type: i64) -> Result<Option<CollectionRow>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let row = conn
            .query_row(
                "SELECT Id, Stream_Tag, Log_Source_Path, Type, DB_Dir FROM LogCollections
                 WHERE Stream_Tag = ?1 AND Log_Source_Path = ?2 AND Type = ?3",
                params![stream_tag, log_source_path, log_type],
                |row| {
                    Ok(CollectionRow {
                        id: row.get(0)?,
                        stream_tag: row.get(1)?,
                        log_source_path: row.get(2)?,
                        log_type: row.get(3)?,
                        db_dir: row.get(4)?,
                    })
                },
            )
            .ok();
        Ok(row)
    }

    pub fn list_collections(&self) -> Result<Vec<CollectionRow>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let mut stmt = conn.prepare("SELECT Id, Stream_Tag, Log_Source_Path, Type, DB_Dir FROM LogCollections")?;
        let rows = stmt.query_map([], |row| {
            Ok(CollectionRow {
                id: row.get(0)?,
                stream_tag: row.get(1)?,
                log_source_path: row.get(2)?,
                log_type: row.get(3)?,
                db_dir: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_and_list_roundtrip() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("main.db")).unwrap();
        catalog.insert_collection("nginx", "/var/log/nginx/access.log", 0, "d0").unwrap();
        let rows = catalog.list_collections().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stream_tag, "nginx");
        assert_eq!(rows[0].db_dir, "d0");
    }

    #[test]
    fn same_stream_tag_with_distinct_db_dir_is_allowed() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("main.db")).unwrap();
        catalog.insert_collection("dup", "/var/log/a.log", 0, "d0").unwrap();
        catalog.insert_collection("dup", "/var/log/a.log", 0, "d1").unwrap();
        assert_eq!(catalog.list_collections().unwrap().len(), 2);
    }

    #[test]
    fn duplicate_stream_tag_and_db_dir_rejected() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("main.db")).unwrap();
        catalog.insert_collection("dup", "/var/log/a.log", 0, "d0").unwrap();
        assert!(catalog.insert_collection("dup", "/var/log/a.log", 0, "d0").is_err());
    }

    #[test]
    fn find_resolves_by_identity_tuple() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("main.db")).unwrap();
        catalog.insert_collection("app", "/var/log/app.log", 1, "d0").unwrap();
        let found = catalog.find("app", "/var/log/app.log", 1).unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().db_dir, "d0");
        assert!(catalog.find("app", "/var/log/app.log", 2).unwrap().is_none());
    }
}
