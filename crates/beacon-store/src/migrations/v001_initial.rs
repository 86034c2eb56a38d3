//! v001 -- Initial schema: channel registry and outbound queue.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Channels known to the router
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    id         TEXT PRIMARY KEY NOT NULL,     -- "{kind}:{slug}"
    kind       TEXT NOT NULL,
    name       TEXT NOT NULL,
    payload    TEXT NOT NULL,                 -- JSON-encoded Channel
    created_at TEXT NOT NULL                  -- RFC-3339
);

-- ----------------------------------------------------------------
-- Outbound queue (pending and failed messages only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbound_queue (
    seq           INTEGER PRIMARY KEY NOT NULL,
    message_id    TEXT NOT NULL UNIQUE,
    channel_id    TEXT NOT NULL,
    payload       TEXT NOT NULL,              -- JSON-encoded Message
    attempts      INTEGER NOT NULL DEFAULT 0,
    next_retry_at TEXT,
    last_error    TEXT,
    failed        INTEGER NOT NULL DEFAULT 0  -- boolean 0/1
);

CREATE INDEX IF NOT EXISTS idx_outbound_queue_channel
    ON outbound_queue(channel_id, seq);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
