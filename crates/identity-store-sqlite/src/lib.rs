use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use identity_core::{
    ContactId, ContactRecord, ContactStore, IdentityError, LinkPrecedence, NewContact,
    TransactionalStore,
};
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, ErrorCode, OptionalExtension, Params, Row,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

/// Default bound on how long a store call waits for a competing writer.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  linked_id INTEGER,
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
  ),
  FOREIGN KEY (linked_id) REFERENCES contacts(id)
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, linked_id, link_precedence, created_at, updated_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// A contact whose stored linkage breaks the one-hop primary/secondary shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkageViolation {
    pub contact_id: i64,
    pub linked_id: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub linkage_violations: Vec<LinkageViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed contact store with the default busy timeout.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(busy_timeout).context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "contacts")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if !table_has_column(&self.conn, "contacts", "link_precedence")? {
            return Err(anyhow!(
                "database schema is invalid: contacts has no link_precedence column"
            ));
        }

        // Contacts table created outside the migration runner; adopt it.
        record_schema_version(&self.conn, 1)?;
        if index_exists(&self.conn, "idx_contacts_email")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create contact lookup indexes")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        tracing::info!(version = 2, "applied contacts schema migration");
        Ok(())
    }

    /// Load every persisted contact in id order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let contacts = query_contacts(
            &self.conn,
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY id ASC"),
            [],
        )?;
        Ok(contacts)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, linkage, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let linkage_violations = if table_exists(&self.conn, "contacts")? {
            self.linkage_violations()?
        } else {
            Vec::new()
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            linkage_violations,
            schema_status,
        })
    }

    fn linkage_violations(&self) -> Result<Vec<LinkageViolation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.id, c.link_precedence, c.linked_id, p.link_precedence
                 FROM contacts c
                 LEFT JOIN contacts p ON p.id = c.linked_id
                 WHERE (c.link_precedence = 'primary' AND c.linked_id IS NOT NULL)
                    OR (c.link_precedence = 'secondary'
                        AND (p.id IS NULL OR p.link_precedence <> 'primary'))
                 ORDER BY c.id ASC",
            )
            .context("failed to prepare linkage check")?;
        let rows = stmt.query_map([], |row| {
            let contact_id: i64 = row.get(0)?;
            let link_precedence: String = row.get(1)?;
            let linked_id: Option<i64> = row.get(2)?;
            let target_precedence: Option<String> = row.get(3)?;
            let reason = match (link_precedence.as_str(), linked_id, target_precedence) {
                ("primary", _, _) => "primary carries a linked_id".to_string(),
                (_, None, _) => "secondary has no linked_id".to_string(),
                (_, Some(_), None) => "secondary links to a missing contact".to_string(),
                (_, Some(_), Some(_)) => "secondary links to another secondary".to_string(),
            };
            Ok(LinkageViolation { contact_id, linked_id, reason })
        })?;

        let mut violations = Vec::new();
        for row in rows {
            violations.push(row?);
        }
        Ok(violations)
    }
}

impl TransactionalStore for SqliteStore {
    fn transaction<T, F>(&mut self, work: F) -> Result<T, IdentityError>
    where
        F: FnOnce(&mut dyn ContactStore) -> Result<T, IdentityError>,
    {
        // IMMEDIATE takes the write lock up front so overlapping reconcilers serialise.
        let tx =
            self.conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(store_error)?;
        let value = work(&mut ContactTable { conn: &tx })?;
        tx.commit().map_err(store_error)?;
        Ok(value)
    }
}

/// [`ContactStore`] view over one open transaction.
struct ContactTable<'conn> {
    conn: &'conn Connection,
}

impl ContactStore for ContactTable<'_> {
    fn find_matching(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, IdentityError> {
        let (filter, values) = match (email, phone_number) {
            (Some(email), Some(phone_number)) => {
                ("email = ?1 OR phone_number = ?2", vec![email, phone_number])
            }
            (Some(email), None) => ("email = ?1", vec![email]),
            (None, Some(phone_number)) => ("phone_number = ?1", vec![phone_number]),
            (None, None) => return Ok(Vec::new()),
        };

        query_contacts(
            self.conn,
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE {filter} ORDER BY id ASC"),
            params_from_iter(values),
        )
    }

    fn create(&mut self, contact: &NewContact) -> Result<ContactRecord, IdentityError> {
        contact.validate()?;
        let now = OffsetDateTime::now_utc();
        let stamp = rfc3339(now)?;

        self.conn
            .execute(
                "INSERT INTO contacts(
                    email, phone_number, linked_id, link_precedence, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    contact.email,
                    contact.phone_number,
                    contact.linked_id.map(|id| id.0),
                    contact.link_precedence.as_str(),
                    stamp,
                    stamp,
                ],
            )
            .map_err(store_error)?;

        Ok(ContactRecord {
            id: ContactId(self.conn.last_insert_rowid()),
            email: contact.email.clone(),
            phone_number: contact.phone_number.clone(),
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: now,
            updated_at: now,
        })
    }

    fn update_linkage(
        &mut self,
        id: ContactId,
        link_precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<(), IdentityError> {
        if linked_id == Some(id) {
            return Err(IdentityError::StoreConflict(format!("contact {id} cannot link to itself")));
        }

        let changed = self
            .conn
            .execute(
                "UPDATE contacts
                 SET link_precedence = ?1, linked_id = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    link_precedence.as_str(),
                    linked_id.map(|target| target.0),
                    rfc3339(OffsetDateTime::now_utc())?,
                    id.0,
                ],
            )
            .map_err(store_error)?;

        if changed == 0 {
            return Err(IdentityError::StoreConflict(format!("cannot relink missing contact {id}")));
        }
        Ok(())
    }

    fn find_by_cluster_root(
        &mut self,
        root: ContactId,
    ) -> Result<Vec<ContactRecord>, IdentityError> {
        query_contacts(
            self.conn,
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE id = ?1 OR linked_id = ?1
                 ORDER BY id ASC"
            ),
            params![root.0],
        )
    }

    fn find_by_id(&mut self, id: ContactId) -> Result<Option<ContactRecord>, IdentityError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.0],
                read_contact_row,
            )
            .optional()
            .map_err(store_error)?;
        row.map(ContactRow::decode).transpose()
    }
}

struct ContactRow {
    id: i64,
    email: Option<String>,
    phone_number: Option<String>,
    linked_id: Option<i64>,
    link_precedence: String,
    created_at: String,
    updated_at: String,
}

impl ContactRow {
    fn decode(self) -> Result<ContactRecord, IdentityError> {
        let link_precedence = LinkPrecedence::parse(&self.link_precedence).ok_or_else(|| {
            IdentityError::StoreConflict(format!(
                "unknown link_precedence for contact {}: {}",
                self.id, self.link_precedence
            ))
        })?;

        Ok(ContactRecord {
            id: ContactId(self.id),
            email: self.email,
            phone_number: self.phone_number,
            linked_id: self.linked_id.map(ContactId),
            link_precedence,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

fn read_contact_row(row: &Row<'_>) -> rusqlite::Result<ContactRow> {
    Ok(ContactRow {
        id: row.get(0)?,
        email: row.get(1)?,
        phone_number: row.get(2)?,
        linked_id: row.get(3)?,
        link_precedence: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn query_contacts<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ContactRecord>, IdentityError> {
    let mut stmt = conn.prepare_cached(sql).map_err(store_error)?;
    let rows = stmt.query_map(params, read_contact_row).map_err(store_error)?;

    let mut contacts = Vec::new();
    for row in rows {
        contacts.push(row.map_err(store_error)?.decode()?);
    }
    Ok(contacts)
}

/// Classify a `SQLite` failure for the reconciler.
fn store_error(err: rusqlite::Error) -> IdentityError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            IdentityError::StoreUnavailable(format!("timed out waiting for database lock: {err}"))
        }
        Some(ErrorCode::ConstraintViolation) => IdentityError::StoreConflict(err.to_string()),
        _ => IdentityError::StoreUnavailable(err.to_string()),
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    tracing::info!(version = 1, "applied contacts schema migration");
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn index_exists(conn: &Connection, index_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
            params![index_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if index exists: {index_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "contacts")? {
        return Ok((0, false));
    }

    if !table_has_column(conn, "contacts", "link_precedence")? {
        return Err(anyhow!("database schema is invalid: contacts has no link_precedence column"));
    }

    if index_exists(conn, "idx_contacts_email")? {
        return Ok((2, true));
    }
    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String, IdentityError> {
    value.format(&time::format_description::well_known::Rfc3339).map_err(|err| {
        IdentityError::StoreUnavailable(format!("failed to format RFC3339 timestamp: {err}"))
    })
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, IdentityError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339).map_err(|err| {
        IdentityError::StoreConflict(format!("invalid RFC3339 timestamp {value}: {err}"))
    })
}
