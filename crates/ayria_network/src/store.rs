//! Persistence adapter for accepted messages and sender last-seen times.
//!
//! The transports only see the narrow [`MessageStore`] trait. [`SqliteStore`]
//! is the bundled implementation.

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::NetworkError;
use crate::topic::TopicHash;

/// One persisted message. Last write wins per `(owner_id, topic)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub owner_id: String,
    pub topic: TopicHash,
    pub timestamp: u64,
    /// Armored signature text.
    pub signature: String,
    /// Armored payload text.
    pub payload: String,
    pub is_local: bool,
}

/// Narrow interface the transports persist through.
pub trait MessageStore: Send + Sync {
    /// Upsert a sender's last-seen time without replacing its existing row.
    fn touch_client(&self, long_id: &str, short_id: u32, timestamp: u64) -> Result<(), NetworkError>;

    /// Insert or replace a message record.
    fn record_message(&self, record: &MessageRecord) -> Result<(), NetworkError>;

    /// The latest message from `owner_id` on `topic`, if any.
    fn latest_message(&self, owner_id: &str, topic: TopicHash) -> Result<Option<MessageRecord>, NetworkError>;

    /// All messages on `topic` at or after `since`, oldest first.
    fn messages_since(&self, topic: TopicHash, since: u64) -> Result<Vec<MessageRecord>, NetworkError>;
}

/// SQLite-backed [`MessageStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub fn open(path: &std::path::Path) -> Result<Self, NetworkError> {
        let conn = Connection::open(path)?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (useful for tests).
    pub fn in_memory() -> Result<Self, NetworkError> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &Connection) -> Result<(), NetworkError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS Clients (
                ClientID TEXT PRIMARY KEY NOT NULL,
                ShortID INTEGER NOT NULL,
                Lastseen INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS Messages (
                OwnerID TEXT NOT NULL,
                MessageType INTEGER NOT NULL,
                Timestamp INTEGER NOT NULL,
                Signature TEXT NOT NULL,
                Payload TEXT NOT NULL,
                IsLocal BOOLEAN NOT NULL DEFAULT 0,
                PRIMARY KEY (OwnerID, MessageType)
            );
            ",
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
        Ok(MessageRecord {
            owner_id: row.get(0)?,
            topic: TopicHash(row.get::<_, u32>(1)?),
            timestamp: row.get::<_, i64>(2)? as u64,
            signature: row.get(3)?,
            payload: row.get(4)?,
            is_local: row.get(5)?,
        })
    }
}

impl MessageStore for SqliteStore {
    fn touch_client(&self, long_id: &str, short_id: u32, timestamp: u64) -> Result<(), NetworkError> {
        // ON CONFLICT updates in place; REPLACE would delete the row first and
        // fire delete triggers on tables that reference it.
        self.conn.lock().execute(
            "INSERT INTO Clients (ClientID, ShortID, Lastseen) VALUES (?1, ?2, ?3)
             ON CONFLICT(ClientID) DO UPDATE SET Lastseen = excluded.Lastseen",
            params![long_id, short_id, timestamp as i64],
        )?;
        Ok(())
    }

    fn record_message(&self, record: &MessageRecord) -> Result<(), NetworkError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO Messages
                (OwnerID, MessageType, Timestamp, Signature, Payload, IsLocal)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.owner_id,
                record.topic.0,
                record.timestamp as i64,
                record.signature,
                record.payload,
                record.is_local,
            ],
        )?;
        Ok(())
    }

    fn latest_message(&self, owner_id: &str, topic: TopicHash) -> Result<Option<MessageRecord>, NetworkError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT OwnerID, MessageType, Timestamp, Signature, Payload, IsLocal
                 FROM Messages WHERE OwnerID = ?1 AND MessageType = ?2",
                params![owner_id, topic.0],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn messages_since(&self, topic: TopicHash, since: u64) -> Result<Vec<MessageRecord>, NetworkError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT OwnerID, MessageType, Timestamp, Signature, Payload, IsLocal
             FROM Messages WHERE MessageType = ?1 AND Timestamp >= ?2
             ORDER BY Timestamp ASC",
        )?;
        let rows = stmt.query_map(params![topic.0, since as i64], Self::row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

impl SqliteStore {
    /// Last-seen timestamp of a sender.
    pub fn client_last_seen(&self, long_id: &str) -> Result<Option<u64>, NetworkError> {
        let conn = self.conn.lock();
        let seen = conn
            .query_row(
                "SELECT Lastseen FROM Clients WHERE ClientID = ?1",
                params![long_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(seen.map(|s| s as u64))
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> Result<usize, NetworkError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM Messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str, topic: u32, timestamp: u64, payload: &str) -> MessageRecord {
        MessageRecord {
            owner_id: owner.to_string(),
            topic: TopicHash(topic),
            timestamp,
            signature: "c2ln".to_string(),
            payload: payload.to_string(),
            is_local: false,
        }
    }

    #[test]
    fn test_record_and_fetch() {
        let store = SqliteStore::in_memory().unwrap();
        store.record_message(&record("alice", 1, 10, "aGk=")).unwrap();

        let fetched = store.latest_message("alice", TopicHash(1)).unwrap().unwrap();
        assert_eq!(fetched.payload, "aGk=");
        assert_eq!(fetched.timestamp, 10);
        assert!(store.latest_message("bob", TopicHash(1)).unwrap().is_none());
    }

    #[test]
    fn test_last_write_wins_per_owner_and_topic() {
        let store = SqliteStore::in_memory().unwrap();
        store.record_message(&record("alice", 1, 10, "one")).unwrap();
        store.record_message(&record("alice", 1, 20, "two")).unwrap();
        store.record_message(&record("alice", 2, 30, "other")).unwrap();

        assert_eq!(store.message_count().unwrap(), 2);
        let latest = store.latest_message("alice", TopicHash(1)).unwrap().unwrap();
        assert_eq!(latest.payload, "two");
    }

    #[test]
    fn test_messages_since_filters_and_orders() {
        let store = SqliteStore::in_memory().unwrap();
        store.record_message(&record("carol", 5, 300, "c")).unwrap();
        store.record_message(&record("alice", 5, 100, "a")).unwrap();
        store.record_message(&record("bob", 5, 200, "b")).unwrap();
        store.record_message(&record("dave", 6, 250, "d")).unwrap();

        let records = store.messages_since(TopicHash(5), 150).unwrap();
        let owners: Vec<_> = records.iter().map(|r| r.owner_id.as_str()).collect();
        assert_eq!(owners, vec!["bob", "carol"]);
    }

    #[test]
    fn test_touch_client_updates_in_place() {
        let store = SqliteStore::in_memory().unwrap();
        store.touch_client("alice", 7, 100).unwrap();
        store.touch_client("alice", 7, 250).unwrap();
        assert_eq!(store.client_last_seen("alice").unwrap(), Some(250));
    }

    #[test]
    fn test_touch_client_does_not_fire_delete_triggers() {
        let store = SqliteStore::in_memory().unwrap();
        {
            let conn = store.conn.lock();
            conn.execute_batch(
                "CREATE TABLE Deletions (ClientID TEXT);
                 CREATE TRIGGER OnClientDelete AFTER DELETE ON Clients
                 BEGIN INSERT INTO Deletions VALUES (old.ClientID); END;",
            )
            .unwrap();
        }
        store.touch_client("alice", 7, 1).unwrap();
        store.touch_client("alice", 7, 2).unwrap();

        let conn = store.conn.lock();
        let deletions: i64 = conn
            .query_row("SELECT COUNT(*) FROM Deletions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(deletions, 0);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ayria.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.record_message(&record("alice", 1, 1, "eA==")).unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.message_count().unwrap(), 1);
    }
}
