//! SQLite DDL and migrations for the wren database.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation. Migrations are versioned and
//! idempotent; the loader applies them in order at startup.

use rusqlite::Connection;

/// Schema version written by a fully migrated database.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 2;

/// A single forward migration.
struct Migration {
    version: u32,
    sql: &'static str,
}

/// Base schema — journal tables plus the memory store.
///
/// Uses `IF NOT EXISTS` throughout so re-application is harmless.
const SCHEMA_V1: &str = r#"
-- Schema version tracking.
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per completed call.
CREATE TABLE IF NOT EXISTS conversations (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    call_sid         TEXT NOT NULL UNIQUE,
    stream_sid       TEXT,
    start_time       TEXT NOT NULL,
    end_time         TEXT,
    duration_seconds REAL,
    created_at       TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Full transcript, verbatim.
CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role            TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content         TEXT NOT NULL,
    timestamp       TEXT NOT NULL
);

-- Serialized analyzer output, one row per conversation.
CREATE TABLE IF NOT EXISTS summaries (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL UNIQUE REFERENCES conversations(id) ON DELETE CASCADE,
    summary         TEXT NOT NULL,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Derived per-call analytics (topic tags, care indicators).
CREATE TABLE IF NOT EXISTS analytics (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    data            TEXT NOT NULL,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Content-keyed memory records.
CREATE TABLE IF NOT EXISTS memories (
    key           TEXT PRIMARY KEY,
    content       TEXT NOT NULL,
    category      TEXT NOT NULL DEFAULT 'general',
    is_fact       INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    last_accessed TEXT
);
"#;

/// Migration 2 — post-call emotional metrics plus query indexes.
const SCHEMA_V2: &str = r#"
CREATE TABLE IF NOT EXISTS emotional_metrics (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id     INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    anxiety             REAL NOT NULL,
    agitation           REAL NOT NULL,
    confusion           REAL NOT NULL,
    comfort             REAL NOT NULL,
    mentions_pain       INTEGER NOT NULL DEFAULT 0,
    mentions_medication INTEGER NOT NULL DEFAULT 0,
    mentions_family     INTEGER NOT NULL DEFAULT 0,
    raw                 TEXT,
    created_at          TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_analytics_conversation ON analytics(conversation_id);
CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);
"#;

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: SCHEMA_V1,
    },
    Migration {
        version: 2,
        sql: SCHEMA_V2,
    },
];

/// Apply all pending migrations in order.
///
/// Safe to call multiple times — each migration's DDL uses
/// `IF NOT EXISTS`, and already-applied versions are skipped.
pub(crate) fn apply_migrations(conn: &Connection) -> rusqlite::Result<()> {
    // The meta table must exist before the version can be read; its DDL is
    // idempotent so running it outside the version check is fine.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
    )?;

    let current = read_schema_version(conn)?.unwrap_or(0);
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        conn.execute_batch(migration.sql)?;
        conn.execute(
            "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![migration.version.to_string()],
        )?;
    }
    Ok(())
}

/// Read the current schema version from the database.
///
/// Returns `None` if the `schema_meta` table is empty or the key is missing.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
