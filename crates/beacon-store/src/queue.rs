//! Persistence of the outbound queue.
//!
//! Rows mirror the router's in-memory entries: inserted when a message is
//! queued, updated on every retry bookkeeping change and deleted once the
//! message is sent or abandoned.

use rusqlite::params;

use beacon_shared::{Message, MessageId, OutboundEntry};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_entry(&self, entry: &OutboundEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.message)?;
        self.conn().execute(
            "INSERT INTO outbound_queue
                (seq, message_id, channel_id, payload, attempts, next_retry_at, last_error, failed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(seq) DO UPDATE SET
                payload = excluded.payload,
                attempts = excluded.attempts,
                next_retry_at = excluded.next_retry_at,
                last_error = excluded.last_error,
                failed = excluded.failed",
            params![
                entry.seq as i64,
                entry.message.id.to_string(),
                entry.message.channel_id.as_str(),
                payload,
                entry.attempts,
                entry.next_retry_at.map(|t| t.to_rfc3339()),
                entry.last_error,
                entry.is_failed(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_entry(&self, id: &MessageId) -> Result<bool> {
        let n = self.conn().execute(
            "DELETE FROM outbound_queue WHERE message_id = ?1",
            params![id.to_string()],
        )?;
        Ok(n > 0)
    }

    /// Every stored entry in original send order.
    pub fn load_entries(&self) -> Result<Vec<OutboundEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT seq, payload, attempts, next_retry_at, last_error
             FROM outbound_queue
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, payload, attempts, next_retry_at, last_error) = row?;
            let message: Message = serde_json::from_str(&payload)?;
            let next_retry_at = next_retry_at
                .and_then(|t| chrono::DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&chrono::Utc));
            entries.push(OutboundEntry {
                seq: seq as u64,
                message,
                attempts,
                next_retry_at,
                last_error,
            });
        }
        Ok(entries)
    }

    /// Drop every queued entry.
    pub fn purge_entries(&self) -> Result<usize> {
        Ok(self.conn().execute("DELETE FROM outbound_queue", [])?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use beacon_shared::{ChannelId, Identity, MessageStatus};

    use super::*;

    fn entry(seq: u64, content: &str) -> OutboundEntry {
        let me = Identity::new("alice", "Alice");
        let message = Message::draft(
            MessageId::new(),
            ChannelId::new("team:ops").unwrap(),
            &me,
            content.to_string(),
            vec![],
            Utc::now(),
        );
        OutboundEntry::new(seq, message)
    }

    #[test]
    fn test_entries_load_in_send_order() {
        let db = Database::open_in_memory().unwrap();
        for (seq, content) in [(3, "c"), (1, "a"), (2, "b")] {
            db.upsert_entry(&entry(seq, content)).unwrap();
        }

        let loaded: Vec<String> = db
            .load_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.message.content)
            .collect();
        assert_eq!(loaded, ["a", "b", "c"]);
    }

    #[test]
    fn test_update_keeps_retry_metadata() {
        let db = Database::open_in_memory().unwrap();
        let mut e = entry(1, "hello");
        db.upsert_entry(&e).unwrap();

        e.attempts = 2;
        e.last_error = Some("not connected".into());
        e.next_retry_at = Some(Utc::now());
        e.message.advance(MessageStatus::Failed);
        db.upsert_entry(&e).unwrap();

        let loaded = db.load_entries().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].attempts, 2);
        assert_eq!(loaded[0].last_error.as_deref(), Some("not connected"));
        assert!(loaded[0].next_retry_at.is_some());
        assert!(loaded[0].is_failed());
    }

    #[test]
    fn test_delete_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("queue.db")).unwrap();
        let a = entry(1, "a");
        db.upsert_entry(&a).unwrap();
        db.upsert_entry(&entry(2, "b")).unwrap();

        assert!(db.delete_entry(&a.message.id).unwrap());
        assert_eq!(db.load_entries().unwrap().len(), 1);
        assert_eq!(db.purge_entries().unwrap(), 1);
        assert!(db.load_entries().unwrap().is_empty());
    }
}
