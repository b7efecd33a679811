use crate::host::Storage;
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

pub fn open_or_create(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../db/schema.sql"))?;
    Ok(())
}

pub fn get_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM storage WHERE key = ?1 LIMIT 1")?;
    let row = stmt.query_row(params![key], |r| r.get::<_, String>(0)).optional()?;
    Ok(row)
}

/// Upsert a value, stamping the write time
pub fn set_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO storage (key, value, updated_at) VALUES (?1, ?2, strftime('%s','now')) ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = strftime('%s','now')",
        params![key, value],
    )?;
    Ok(())
}

/// Host storage backed by a single sqlite file.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: Mutex::new(open_or_create(path)?) })
    }
}

impl Storage for SqliteStorage {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(|_| anyhow!("storage connection poisoned"))?;
        get_value(&conn, key)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| anyhow!("storage connection poisoned"))?;
        set_value(&conn, key, value)
    }
}
