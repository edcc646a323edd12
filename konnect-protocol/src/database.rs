//! Trust store.
//!
//! SQLite-backed persistence for paired devices, queued notifications and
//! the per-device command catalog. A device is trusted exactly when its
//! row exists in `trusted_devices`; notifications and commands cascade
//! away with it. All access funnels through a mutex so concurrent
//! sessions serialise on the single connection.

use crate::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Ordered schema migrations; the applied version is tracked in the
/// `config` table so existing databases upgrade in place.
const SCHEMA: &[&[&str]] = &[
    &[
        "CREATE TABLE config (key TEXT PRIMARY KEY, value TEXT)",
        "CREATE TABLE trusted_devices (identifier TEXT PRIMARY KEY, certificate TEXT, \
         name TEXT, type TEXT)",
        "CREATE TABLE notifications (reference TEXT, identifier TEXT, text TEXT, \
         title TEXT, application TEXT, PRIMARY KEY (identifier, reference), \
         FOREIGN KEY (identifier) REFERENCES trusted_devices (identifier) ON DELETE CASCADE)",
        "CREATE INDEX notification_identifier ON notifications (identifier)",
    ],
    &["ALTER TABLE notifications ADD COLUMN cancel INTEGER DEFAULT 0"],
    &[
        "CREATE TABLE commands (key TEXT PRIMARY KEY, identifier TEXT, name TEXT, command TEXT, \
         FOREIGN KEY (identifier) REFERENCES trusted_devices (identifier) ON DELETE CASCADE)",
    ],
    &["ALTER TABLE trusted_devices ADD COLUMN path TEXT"],
];

/// A paired peer as persisted.
#[derive(Debug, Clone)]
pub struct TrustedDevice {
    pub identifier: String,
    pub name: String,
    pub device_type: String,
    pub path: Option<String>,
}

/// A queued (or tombstoned) notification.
#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub identifier: String,
    pub reference: String,
    pub text: String,
    pub title: String,
    pub application: String,
    pub cancel: bool,
}

/// A locally configured command the peer may run.
#[derive(Debug, Clone)]
pub struct CommandRow {
    pub key: String,
    pub identifier: String,
    pub name: String,
    pub command: String,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.upgrade_schema()?;
        Ok(db)
    }

    fn upgrade_schema(&self) -> Result<()> {
        let version: i64 = self
            .load_config("schema")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);

        let conn = self.conn.lock().unwrap();
        let mut applied = version;

        for (index, queries) in SCHEMA.iter().enumerate() {
            let index = index as i64;
            if index > version {
                debug!("Applying schema migration {}", index);
                for query in *queries {
                    conn.execute(query, [])?;
                }
                applied = index;
            }
        }
        drop(conn);

        self.save_config("schema", &applied.to_string())
    }

    pub fn load_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        // The config table does not exist before the first migration ran.
        match conn.query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        ) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(rusqlite::Error::SqliteFailure(_, _)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn is_trusted(&self, identifier: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(1) FROM trusted_devices WHERE identifier = ?1",
            params![identifier],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count == 1)
        .unwrap_or(false)
    }

    pub fn list_trusted(&self) -> Result<Vec<TrustedDevice>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT identifier, name, type, path FROM trusted_devices")?;
        let rows = stmt.query_map([], |row| {
            Ok(TrustedDevice {
                identifier: row.get(0)?,
                name: row.get(1)?,
                device_type: row.get(2)?,
                path: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Record a successful pairing. Re-pairing an already trusted device
    /// overwrites the stored certificate; the last writer wins.
    pub fn pair_device(
        &self,
        identifier: &str,
        certificate_pem: &str,
        name: &str,
        device_type: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trusted_devices (identifier, certificate, name, type) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(identifier) DO UPDATE SET certificate = excluded.certificate, \
             name = excluded.name, type = excluded.type",
            params![identifier, certificate_pem, name, device_type],
        )?;
        Ok(())
    }

    pub fn unpair_device(&self, identifier: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM trusted_devices WHERE identifier = ?1",
            params![identifier],
        )?;
        Ok(())
    }

    pub fn update_device(&self, identifier: &str, name: &str, device_type: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE trusted_devices SET name = ?1, type = ?2 WHERE identifier = ?3",
            params![name, device_type, identifier],
        )?;
        Ok(())
    }

    pub fn device_certificate(&self, identifier: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT certificate FROM trusted_devices WHERE identifier = ?1",
                params![identifier],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn persist_notification(
        &self,
        identifier: &str,
        text: &str,
        title: &str,
        application: &str,
        reference: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notifications (identifier, text, title, application, reference) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(identifier, reference) DO UPDATE SET text = excluded.text, \
             title = excluded.title, application = excluded.application",
            params![identifier, text, title, application, reference],
        )?;
        Ok(())
    }

    /// Tombstone a notification so the next replay emits a cancel.
    pub fn cancel_notification(&self, identifier: &str, reference: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE notifications SET cancel = 1 WHERE identifier = ?1 AND reference = ?2",
            params![identifier, reference],
        )?;
        Ok(())
    }

    pub fn dismiss_notification(&self, identifier: &str, reference: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM notifications WHERE identifier = ?1 AND reference = ?2",
            params![identifier, reference],
        )?;
        Ok(())
    }

    pub fn list_notifications(&self, identifier: &str) -> Result<Vec<NotificationRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT identifier, reference, text, title, application, cancel \
             FROM notifications WHERE identifier = ?1",
        )?;
        let rows = stmt.query_map(params![identifier], Self::notification_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn list_all_notifications(&self) -> Result<Vec<NotificationRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT n.identifier, n.reference, n.text, n.title, n.application, n.cancel \
             FROM notifications n INNER JOIN trusted_devices d \
             ON (n.identifier = d.identifier) ORDER BY d.name, n.title",
        )?;
        let rows = stmt.query_map([], Self::notification_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    fn notification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRow> {
        Ok(NotificationRow {
            identifier: row.get(0)?,
            reference: row.get(1)?,
            text: row.get(2)?,
            title: row.get(3)?,
            application: row.get(4)?,
            cancel: row.get::<_, i64>(5)? != 0,
        })
    }

    pub fn add_command(
        &self,
        identifier: &str,
        key: &str,
        name: &str,
        command: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO commands (key, identifier, name, command) VALUES (?1, ?2, ?3, ?4)",
            params![key, identifier, name, command],
        )?;
        Ok(())
    }

    pub fn update_command(
        &self,
        identifier: &str,
        key: &str,
        name: &str,
        command: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE commands SET name = ?1, command = ?2 WHERE identifier = ?3 AND key = ?4",
            params![name, command, identifier, key],
        )?;
        Ok(changed > 0)
    }

    pub fn remove_command(&self, identifier: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM commands WHERE identifier = ?1 AND key = ?2",
            params![identifier, key],
        )?;
        Ok(changed > 0)
    }

    pub fn remove_commands(&self, identifier: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM commands WHERE identifier = ?1",
            params![identifier],
        )?;
        Ok(())
    }

    pub fn get_command(&self, identifier: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT command FROM commands WHERE identifier = ?1 AND key = ?2",
                params![identifier, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn list_commands(&self, identifier: &str) -> Result<Vec<CommandRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key, identifier, name, command FROM commands WHERE identifier = ?1",
        )?;
        let rows = stmt.query_map(params![identifier], Self::command_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn list_all_commands(&self) -> Result<Vec<CommandRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.key, c.identifier, c.name, c.command FROM commands c \
             INNER JOIN trusted_devices d ON (c.identifier = d.identifier) \
             ORDER BY d.name, c.name",
        )?;
        let rows = stmt.query_map([], Self::command_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    fn command_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandRow> {
        Ok(CommandRow {
            key: row.get(0)?,
            identifier: row.get(1)?,
            name: row.get(2)?,
            command: row.get(3)?,
        })
    }

    /// Destination directory for incoming file payloads, if configured.
    pub fn get_path(&self, identifier: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT path FROM trusted_devices WHERE identifier = ?1",
                params![identifier],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    pub fn set_path(&self, identifier: &str, path: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE trusted_devices SET path = ?1 WHERE identifier = ?2",
            params![path, identifier],
        )?;
        Ok(())
    }
}
