//! Persistence of the router's channel registry.

use rusqlite::params;

use beacon_shared::{Channel, ChannelId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Insert or replace a channel.
    pub fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        let payload = serde_json::to_string(channel)?;
        self.conn().execute(
            "INSERT INTO channels (id, kind, name, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                payload = excluded.payload",
            params![
                channel.id().as_str(),
                channel.kind().as_str(),
                channel.name,
                payload,
                channel.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete_channel(&self, id: &ChannelId) -> Result<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM channels WHERE id = ?1", params![id.as_str()])?;
        Ok(n > 0)
    }

    /// All stored channels, oldest first.
    pub fn list_channels(&self) -> Result<Vec<Channel>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT payload FROM channels ORDER BY created_at ASC, id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(serde_json::from_str(&row?)?);
        }
        Ok(channels)
    }
}
