//! SQLite-backed local mail store
//!
//! Durable cache of folders, message metadata and classification verdicts,
//! keyed by (account id, folder, UID). The database is a cache of server
//! state; message rows are created together with their verdict placeholder
//! in one transaction, so a message without a verdict can never be
//! observed. All mutating operations on a folder go through short
//! transactions, which combined with the single-writer-per-account
//! scheduler serializes folder writes.

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::{MailFolder, MailMessage, MessageFlag, Verdict, VerdictLabel};

/// Database connection pool type
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// SQLite store for synced mail and verdicts
pub struct MailStore {
    pool: DbPool,
}

impl MailStore {
    /// Open (or create) a store at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| CoreError::Store(format!("Failed to create database pool: {}", e)))?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| CoreError::Store(format!("Failed to create database pool: {}", e)))?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| CoreError::Store(format!("Failed to get database connection: {}", e)))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.connection()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            -- Per-folder sync state; watermark is the highest persisted UID
            CREATE TABLE IF NOT EXISTS folders (
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                watermark INTEGER NOT NULL DEFAULT 0,
                last_sync TEXT,
                PRIMARY KEY (account_id, name)
            );

            -- Synced message metadata; body fetched lazily
            CREATE TABLE IF NOT EXISTS messages (
                account_id TEXT NOT NULL,
                folder TEXT NOT NULL,
                uid INTEGER NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                sender TEXT NOT NULL DEFAULT '',
                date TEXT,
                snippet TEXT NOT NULL DEFAULT '',
                is_unread INTEGER NOT NULL DEFAULT 1,
                is_flagged INTEGER NOT NULL DEFAULT 0,
                size INTEGER,
                body BLOB,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (account_id, folder, uid)
            );

            -- Exactly one verdict row per message, created with the message
            CREATE TABLE IF NOT EXISTS verdicts (
                account_id TEXT NOT NULL,
                folder TEXT NOT NULL,
                uid INTEGER NOT NULL,
                label TEXT NOT NULL DEFAULT 'unclassified',
                confidence REAL,
                provider TEXT,
                classified_at TEXT,
                PRIMARY KEY (account_id, folder, uid),
                FOREIGN KEY (account_id, folder, uid)
                    REFERENCES messages(account_id, folder, uid)
                    ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_folder_uid
                ON messages(account_id, folder, uid DESC);
            CREATE INDEX IF NOT EXISTS idx_verdicts_label
                ON verdicts(account_id, label);
        "#,
        )
        .map_err(|e| CoreError::Store(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== Folders & watermarks ==========

    /// Register a folder if it is not known yet. Existing watermark and
    /// remote id are left untouched.
    pub fn ensure_folder(&self, account_id: &str, name: &str, remote_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO folders (account_id, name, remote_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id, name) DO NOTHING",
            params![account_id, name, remote_id],
        )?;
        Ok(())
    }

    /// All known folders for an account
    pub fn folders(&self, account_id: &str) -> Result<Vec<MailFolder>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT account_id, name, remote_id, watermark, last_sync
             FROM folders WHERE account_id = ?1 ORDER BY name ASC",
        )?;
        let folders = stmt
            .query_map(params![account_id], |row| {
                Ok(MailFolder {
                    account_id: row.get(0)?,
                    name: row.get(1)?,
                    remote_id: row.get(2)?,
                    watermark: row.get(3)?,
                    last_sync: parse_timestamp(row.get::<_, Option<String>>(4)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(folders)
    }

    /// Current watermark for a folder; 0 when the folder is unknown
    pub fn watermark(&self, account_id: &str, folder: &str) -> Result<u32> {
        let conn = self.connection()?;
        let watermark = conn
            .query_row(
                "SELECT watermark FROM folders WHERE account_id = ?1 AND name = ?2",
                params![account_id, folder],
                |row| row.get(0),
            )
            .optional()?;
        Ok(watermark.unwrap_or(0))
    }

    /// Advance the folder watermark. Fails if `uid` is lower than the
    /// current watermark, guarding against out-of-order adapters.
    pub fn advance_watermark(&self, account_id: &str, folder: &str, uid: u32) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let current: u32 = tx
            .query_row(
                "SELECT watermark FROM folders WHERE account_id = ?1 AND name = ?2",
                params![account_id, folder],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| CoreError::FolderNotFound(format!("{}/{}", account_id, folder)))?;

        if uid < current {
            return Err(CoreError::Store(format!(
                "watermark for {}/{} cannot regress from {} to {}",
                account_id, folder, current, uid
            )));
        }

        tx.execute(
            "UPDATE folders SET watermark = ?3, last_sync = ?4
             WHERE account_id = ?1 AND name = ?2",
            params![account_id, folder, uid, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Reset the watermark for an explicit resync. The only sanctioned way
    /// a watermark moves backwards.
    pub fn reset_watermark(&self, account_id: &str, folder: &str) -> Result<()> {
        let conn = self.connection()?;
        let n = conn.execute(
            "UPDATE folders SET watermark = 0 WHERE account_id = ?1 AND name = ?2",
            params![account_id, folder],
        )?;
        if n == 0 {
            return Err(CoreError::FolderNotFound(format!(
                "{}/{}",
                account_id, folder
            )));
        }
        Ok(())
    }

    // ========== Messages & verdicts ==========

    /// Insert newly fetched messages, idempotent on UID: an already-known
    /// UID is a no-op, never a duplicate. Each inserted message gets its
    /// `unclassified` verdict placeholder in the same transaction, so a
    /// partial failure leaves neither behind.
    ///
    /// Returns the UIDs actually inserted, in the order given.
    pub fn upsert_messages(
        &self,
        account_id: &str,
        folder: &str,
        messages: &[MailMessage],
    ) -> Result<Vec<u32>> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let mut inserted = Vec::new();
        for message in messages {
            let n = tx.execute(
                "INSERT INTO messages
                     (account_id, folder, uid, subject, sender, date, snippet,
                      is_unread, is_flagged, size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(account_id, folder, uid) DO NOTHING",
                params![
                    account_id,
                    folder,
                    message.uid,
                    message.subject,
                    message.sender,
                    message.date.to_rfc3339(),
                    message.snippet,
                    message.is_unread as i32,
                    message.is_flagged as i32,
                    message.size,
                ],
            )?;
            if n > 0 {
                tx.execute(
                    "INSERT INTO verdicts (account_id, folder, uid, label)
                     VALUES (?1, ?2, ?3, 'unclassified')",
                    params![account_id, folder, message.uid],
                )?;
                inserted.push(message.uid);
            }
        }
        tx.commit()?;

        debug!(
            "Upserted {} messages into {}/{} ({} new)",
            messages.len(),
            account_id,
            folder,
            inserted.len()
        );
        Ok(inserted)
    }

    /// Write a terminal verdict. A single atomic UPDATE that only fires
    /// while the verdict is still `unclassified`; readers never observe a
    /// half-written verdict and terminal labels never transition backward.
    ///
    /// Returns `false` when the verdict was already terminal (stale
    /// attempt), in which case no event should be emitted.
    pub fn write_verdict(
        &self,
        account_id: &str,
        folder: &str,
        uid: u32,
        verdict: &Verdict,
    ) -> Result<bool> {
        if !verdict.label.is_terminal() {
            return Err(CoreError::Store(
                "verdicts can only transition to a terminal label".to_string(),
            ));
        }
        let conn = self.connection()?;
        let n = conn.execute(
            "UPDATE verdicts
             SET label = ?4, confidence = ?5, provider = ?6, classified_at = ?7
             WHERE account_id = ?1 AND folder = ?2 AND uid = ?3
               AND label = 'unclassified'",
            params![
                account_id,
                folder,
                uid,
                verdict.label.as_str(),
                verdict.confidence,
                verdict.provider,
                verdict.classified_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(n > 0)
    }

    /// One message with its verdict
    pub fn get_message(
        &self,
        account_id: &str,
        folder: &str,
        uid: u32,
    ) -> Result<Option<(MailMessage, Verdict)>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!("{} AND m.uid = ?3", READ_QUERY_BASE))?;
        let result = stmt
            .query_row(params![account_id, folder, uid], row_to_entry)
            .optional()?;
        Ok(result)
    }

    /// Messages in a folder with their verdicts, newest (highest UID)
    /// first, optionally filtered by verdict label.
    pub fn read_folder(
        &self,
        account_id: &str,
        folder: &str,
        filter: Option<VerdictLabel>,
    ) -> Result<Vec<(MailMessage, Verdict)>> {
        let conn = self.connection()?;
        let entries = match filter {
            Some(label) => {
                let mut stmt = conn.prepare(&format!(
                    "{} AND v.label = ?3 ORDER BY m.uid DESC",
                    READ_QUERY_BASE
                ))?;
                let rows = stmt
                    .query_map(params![account_id, folder, label.as_str()], row_to_entry)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("{} ORDER BY m.uid DESC", READ_QUERY_BASE))?;
                let rows = stmt
                    .query_map(params![account_id, folder], row_to_entry)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
        };
        Ok(entries)
    }

    /// Mirror a flag change into the local cache. `Seen` toggles the
    /// unread bit (set means read), `Flagged` the star.
    pub fn set_flag(
        &self,
        account_id: &str,
        folder: &str,
        uid: u32,
        flag: MessageFlag,
        value: bool,
    ) -> Result<()> {
        let conn = self.connection()?;
        let (column, stored) = match flag {
            MessageFlag::Seen => ("is_unread", !value),
            MessageFlag::Flagged => ("is_flagged", value),
        };
        let n = conn.execute(
            &format!(
                "UPDATE messages SET {} = ?4
                 WHERE account_id = ?1 AND folder = ?2 AND uid = ?3",
                column
            ),
            params![account_id, folder, uid, stored as i32],
        )?;
        if n == 0 {
            return Err(CoreError::MessageNotFound(format!(
                "{}/{}/{}",
                account_id, folder, uid
            )));
        }
        Ok(())
    }

    /// Messages still awaiting classification, oldest first, across all
    /// accounts. Lets the pipeline sweep up a backlog that never reached
    /// it through events.
    pub fn unclassified(&self, limit: usize) -> Result<Vec<(String, String, u32)>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT account_id, folder, uid FROM verdicts
             WHERE label = 'unclassified'
             ORDER BY account_id, folder, uid ASC
             LIMIT ?1",
        )?;
        let refs = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(refs)
    }

    /// Cache a lazily fetched message body
    pub fn cache_body(&self, account_id: &str, folder: &str, uid: u32, body: &[u8]) -> Result<()> {
        let conn = self.connection()?;
        let n = conn.execute(
            "UPDATE messages SET body = ?4
             WHERE account_id = ?1 AND folder = ?2 AND uid = ?3",
            params![account_id, folder, uid, body],
        )?;
        if n == 0 {
            return Err(CoreError::MessageNotFound(format!(
                "{}/{}/{}",
                account_id, folder, uid
            )));
        }
        Ok(())
    }

    /// Previously cached body, if any
    pub fn cached_body(&self, account_id: &str, folder: &str, uid: u32) -> Result<Option<Vec<u8>>> {
        let conn = self.connection()?;
        let body = conn
            .query_row(
                "SELECT body FROM messages WHERE account_id = ?1 AND folder = ?2 AND uid = ?3",
                params![account_id, folder, uid],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?
            .flatten();
        Ok(body)
    }
}

const READ_QUERY_BASE: &str = "SELECT m.uid, m.subject, m.sender, m.date, m.snippet, \
          m.is_unread, m.is_flagged, m.size, \
          v.label, v.confidence, v.provider, v.classified_at \
     FROM messages m \
     JOIN verdicts v \
       ON v.account_id = m.account_id AND v.folder = m.folder AND v.uid = m.uid \
    WHERE m.account_id = ?1 AND m.folder = ?2";

fn row_to_entry(row: &Row) -> std::result::Result<(MailMessage, Verdict), rusqlite::Error> {
    let message = MailMessage {
        uid: row.get(0)?,
        subject: row.get(1)?,
        sender: row.get(2)?,
        date: parse_timestamp(row.get::<_, Option<String>>(3)?).unwrap_or_else(Utc::now),
        snippet: row.get(4)?,
        is_unread: row.get::<_, i32>(5)? != 0,
        is_flagged: row.get::<_, i32>(6)? != 0,
        size: row.get(7)?,
    };
    let verdict = Verdict {
        label: VerdictLabel::parse(&row.get::<_, String>(8)?),
        confidence: row.get(9)?,
        provider: row.get(10)?,
        classified_at: parse_timestamp(row.get::<_, Option<String>>(11)?),
    };
    Ok((message, verdict))
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
