//! Contact record storage for the consolidation engine.
//!
//! Defines the [`ContactStore`] trait — the only persistence interface the
//! engine requires — plus two implementations: [`SqliteStore`] for the real
//! service and [`MemoryStore`] as a behaviourally equivalent test double.
//!
//! The engine never mutates records in place. The only structural write is
//! [`ContactStore::relink_group`], a single predicate-based update that
//! repoints an entire group at a new primary, and every read-decide-write
//! sequence runs inside [`ContactStore::run_atomic`].

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Row id of a contact record. Assigned by the store, never reused.
pub type ContactId = i64;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    /// Another writer holds the rows this operation needs. The caller is
    /// expected to retry the whole unit of work from fresh state.
    Busy,
    /// A referenced contact id does not exist, or linkage is corrupt.
    NotFound(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Busy => write!(f, "store busy: conflicting write in progress"),
            StoreError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, _) = &e {
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked {
                return StoreError::Busy;
            }
        }
        StoreError::Sqlite(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Whether a contact is the canonical root of its group or linked under one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precedence {
    Primary,
    Secondary,
}

impl Precedence {
    fn as_str(self) -> &'static str {
        match self {
            Precedence::Primary => "primary",
            Precedence::Secondary => "secondary",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "primary" => Ok(Precedence::Primary),
            "secondary" => Ok(Precedence::Secondary),
            other => Err(StoreError::NotFound(format!(
                "unknown link precedence '{other}'"
            ))),
        }
    }
}

/// Contact row stored in the database.
///
/// `id` and `created_at` are immutable once assigned; only `linked_id` and
/// `precedence` ever change, and only during a merge. A primary has
/// `linked_id = None`; a secondary points directly at its group's primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub precedence: Precedence,
    /// Epoch milliseconds. The authoritative age measure; ties break by `id`.
    pub created_at: u64,
}

impl ContactRecord {
    pub fn is_primary(&self) -> bool {
        self.precedence == Precedence::Primary
    }
}

/// Fields for a contact about to be inserted; the store assigns `id` and
/// `created_at`.
#[derive(Debug, Clone)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub precedence: Precedence,
}

impl NewContact {
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email,
            phone_number,
            linked_id: None,
            precedence: Precedence::Primary,
        }
    }

    pub fn secondary(
        email: Option<String>,
        phone_number: Option<String>,
        primary_id: ContactId,
    ) -> Self {
        Self {
            email,
            phone_number,
            linked_id: Some(primary_id),
            precedence: Precedence::Secondary,
        }
    }
}

/// User account row (auth).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password_salt: String,
    pub password_hash: String,
    pub created_at: u64,
}

/// Bearer-token session row (auth).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub token: String,
    pub user_id: i64,
    pub created_at: u64,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// The persistence interface required by the consolidation engine.
///
/// Implementations must guarantee that [`run_atomic`](Self::run_atomic)
/// executes its unit of work with commit-or-rollback semantics: either every
/// write inside it becomes visible, or none do. A lost race against a
/// concurrent writer surfaces as [`StoreError::Busy`].
pub trait ContactStore {
    /// Earliest-created record with exactly this email, if any.
    fn find_by_email(&self, email: &str) -> Result<Option<ContactRecord>, StoreError>;

    /// Earliest-created record with exactly this phone number, if any.
    fn find_by_phone(&self, phone: &str) -> Result<Option<ContactRecord>, StoreError>;

    /// Record by id. A missing id is a broken linkage, not an empty result.
    fn find_by_id(&self, id: ContactId) -> Result<ContactRecord, StoreError>;

    /// Ids of all records linked directly under `primary_id`, ascending.
    fn secondaries_of(&self, primary_id: ContactId) -> Result<Vec<ContactId>, StoreError>;

    /// Insert a new record, assigning id and creation time.
    fn insert(&self, new: NewContact) -> Result<ContactRecord, StoreError>;

    /// Repoint an entire group at a new primary in one predicate update:
    /// every record with `id = old_root` or `linked_id = old_root` gets
    /// `linked_id = new_root` and secondary precedence. Returns the number
    /// of records updated.
    fn relink_group(&self, old_root: ContactId, new_root: ContactId)
        -> Result<usize, StoreError>;

    /// Run `work` as one atomic unit. Rolls back on any error, including
    /// [`StoreError::Busy`] from a conflicting concurrent writer.
    fn run_atomic<T>(
        &self,
        work: impl FnOnce(&Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError>
    where
        Self: Sized;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

/// SQLite-backed store. Open one handle per worker; handles on the same path
/// share the database and serialize conflicting writes through SQLite's
/// locking (surfaced as [`StoreError::Busy`] after the busy timeout).
pub struct SqliteStore {
    conn: Connection,
}

/// How long a writer waits on SQLite's lock before the conflict is surfaced
/// to the engine's own retry loop.
const BUSY_TIMEOUT_MS: u64 = 250;

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::init(conn)?;
        Ok(store)
    }

    /// Open a private in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        let store = Self { conn };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS contacts (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                email           TEXT,
                phone_number    TEXT,
                linked_id       INTEGER REFERENCES contacts(id),
                link_precedence TEXT NOT NULL
                    CHECK (link_precedence IN ('primary', 'secondary')),
                created_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_contacts_email
                ON contacts(email, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_contacts_phone
                ON contacts(phone_number, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_contacts_linked
                ON contacts(linked_id);

            CREATE TABLE IF NOT EXISTS users (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                username        TEXT NOT NULL UNIQUE,
                password_salt   TEXT NOT NULL,
                password_hash   TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token           TEXT PRIMARY KEY,
                user_id         INTEGER NOT NULL REFERENCES users(id),
                created_at      INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn contact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ContactRecord, String)> {
        Ok((
            ContactRecord {
                id: row.get(0)?,
                email: row.get(1)?,
                phone_number: row.get(2)?,
                linked_id: row.get(3)?,
                precedence: Precedence::Primary, // patched from the raw string below
                created_at: row.get::<_, i64>(5)? as u64,
            },
            row.get::<_, String>(4)?,
        ))
    }

    fn query_contact(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<ContactRecord>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let found = stmt.query_row(args, Self::contact_from_row).optional()?;
        match found {
            Some((mut record, precedence)) => {
                record.precedence = Precedence::parse(&precedence)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Auth tables (not part of the ContactStore trait)
    // -----------------------------------------------------------------------

    /// Insert a new user. Fails if the username is taken.
    pub fn insert_user(
        &self,
        username: &str,
        password_salt: &str,
        password_hash: &str,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO users (username, password_salt, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, password_salt, password_hash, now_millis() as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_user(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, username, password_salt, password_hash, created_at
             FROM users WHERE username = ?1",
        )?;
        let row = stmt
            .query_row(params![username], |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    password_salt: row.get(2)?,
                    password_hash: row.get(3)?,
                    created_at: row.get::<_, i64>(4)? as u64,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn get_user_by_id(&self, user_id: i64) -> Result<Option<UserRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, username, password_salt, password_hash, created_at
             FROM users WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![user_id], |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    password_salt: row.get(2)?,
                    password_hash: row.get(3)?,
                    created_at: row.get::<_, i64>(4)? as u64,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn insert_session(&self, token: &str, user_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO sessions (token, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, user_id, now_millis() as i64],
        )?;
        Ok(())
    }

    pub fn get_session(&self, token: &str) -> Result<Option<SessionRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT token, user_id, created_at FROM sessions WHERE token = ?1")?;
        let row = stmt
            .query_row(params![token], |row| {
                Ok(SessionRow {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    created_at: row.get::<_, i64>(2)? as u64,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Delete a session. Returns whether a session existed.
    pub fn delete_session(&self, token: &str) -> Result<bool, StoreError> {
        let affected = self
            .conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
        Ok(affected > 0)
    }
}

const CONTACT_COLUMNS: &str = "id, email, phone_number, linked_id, link_precedence, created_at";

impl ContactStore for SqliteStore {
    fn find_by_email(&self, email: &str) -> Result<Option<ContactRecord>, StoreError> {
        self.query_contact(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts WHERE email = ?1
                 ORDER BY created_at ASC, id ASC LIMIT 1"
            ),
            params![email],
        )
    }

    fn find_by_phone(&self, phone: &str) -> Result<Option<ContactRecord>, StoreError> {
        self.query_contact(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone_number = ?1
                 ORDER BY created_at ASC, id ASC LIMIT 1"
            ),
            params![phone],
        )
    }

    fn find_by_id(&self, id: ContactId) -> Result<ContactRecord, StoreError> {
        self.query_contact(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            params![id],
        )?
        .ok_or_else(|| StoreError::NotFound(format!("contact {id} does not exist")))
    }

    fn secondaries_of(&self, primary_id: ContactId) -> Result<Vec<ContactId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM contacts WHERE linked_id = ?1 ORDER BY id ASC")?;
        let ids = stmt
            .query_map(params![primary_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<ContactId>>>()?;
        Ok(ids)
    }

    fn insert(&self, new: NewContact) -> Result<ContactRecord, StoreError> {
        let created_at = now_millis();
        self.conn.execute(
            "INSERT INTO contacts (email, phone_number, linked_id, link_precedence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.email,
                new.phone_number,
                new.linked_id,
                new.precedence.as_str(),
                created_at as i64,
            ],
        )?;
        Ok(ContactRecord {
            id: self.conn.last_insert_rowid(),
            email: new.email,
            phone_number: new.phone_number,
            linked_id: new.linked_id,
            precedence: new.precedence,
            created_at,
        })
    }

    fn relink_group(
        &self,
        old_root: ContactId,
        new_root: ContactId,
    ) -> Result<usize, StoreError> {
        let affected = self.conn.execute(
            "UPDATE contacts SET linked_id = ?1, link_precedence = 'secondary'
             WHERE id = ?2 OR linked_id = ?2",
            params![new_root, old_root],
        )?;
        Ok(affected)
    }

    fn run_atomic<T>(
        &self,
        work: impl FnOnce(&Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        // IMMEDIATE takes the write lock up front so classification and the
        // structural update observe the same state.
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match work(self) {
            Ok(value) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    // Leave no transaction open on this handle.
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory store with the same observable behaviour as [`SqliteStore`].
///
/// Rows live in a mutex-guarded vector; `run_atomic` holds a transaction
/// gate for its whole duration and restores a snapshot on error, so units of
/// work are serialized and roll back like real transactions.
pub struct MemoryStore {
    rows: Mutex<Vec<ContactRecord>>,
    next_id: AtomicI64,
    tx_gate: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            tx_gate: Mutex::new(()),
        }
    }

    /// Total number of rows. Used by tests asserting "no write happened".
    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Snapshot of every row, in id order. Used by invariant checks in tests.
    pub fn all_rows(&self) -> Vec<ContactRecord> {
        let mut rows = self.rows.lock().unwrap().clone();
        rows.sort_by_key(|r| r.id);
        rows
    }

    /// Insert a row verbatim, bypassing id/timestamp assignment. Lets tests
    /// construct legacy states (chained linkage, explicit ages) that the
    /// engine itself can never produce.
    pub fn insert_raw(&self, record: ContactRecord) {
        let mut rows = self.rows.lock().unwrap();
        self.next_id
            .fetch_max(record.id + 1, Ordering::SeqCst);
        rows.push(record);
    }

    fn find_first(
        &self,
        matches: impl Fn(&ContactRecord) -> bool,
    ) -> Option<ContactRecord> {
        let rows = self.rows.lock().unwrap();
        rows.iter()
            .filter(|r| matches(r))
            .min_by_key(|r| (r.created_at, r.id))
            .cloned()
    }
}

impl ContactStore for MemoryStore {
    fn find_by_email(&self, email: &str) -> Result<Option<ContactRecord>, StoreError> {
        Ok(self.find_first(|r| r.email.as_deref() == Some(email)))
    }

    fn find_by_phone(&self, phone: &str) -> Result<Option<ContactRecord>, StoreError> {
        Ok(self.find_first(|r| r.phone_number.as_deref() == Some(phone)))
    }

    fn find_by_id(&self, id: ContactId) -> Result<ContactRecord, StoreError> {
        let rows = self.rows.lock().unwrap();
        rows.iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("contact {id} does not exist")))
    }

    fn secondaries_of(&self, primary_id: ContactId) -> Result<Vec<ContactId>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut ids: Vec<ContactId> = rows
            .iter()
            .filter(|r| r.linked_id == Some(primary_id))
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn insert(&self, new: NewContact) -> Result<ContactRecord, StoreError> {
        let record = ContactRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            email: new.email,
            phone_number: new.phone_number,
            linked_id: new.linked_id,
            precedence: new.precedence,
            created_at: now_millis(),
        };
        self.rows.lock().unwrap().push(record.clone());
        Ok(record)
    }

    fn relink_group(
        &self,
        old_root: ContactId,
        new_root: ContactId,
    ) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let mut affected = 0;
        for row in rows.iter_mut() {
            if row.id == old_root || row.linked_id == Some(old_root) {
                row.linked_id = Some(new_root);
                row.precedence = Precedence::Secondary;
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn run_atomic<T>(
        &self,
        work: impl FnOnce(&Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _gate = self.tx_gate.lock().unwrap();
        let snapshot = self.rows.lock().unwrap().clone();
        let snapshot_next = self.next_id.load(Ordering::SeqCst);
        match work(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                *self.rows.lock().unwrap() = snapshot;
                self.next_id.store(snapshot_next, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}
