use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use identity_core::{
    cluster_summary, reconcile, ContactId, ContactRecord, ContactSummary, Observation,
};
use identity_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore, DEFAULT_BUSY_TIMEOUT};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Phone numbers are accepted as JSON strings or JSON integers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PhoneNumberInput {
    Text(String),
    Number(i64),
}

impl PhoneNumberInput {
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(number) => number.to_string(),
        }
    }
}

/// Body of `POST /identify`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<PhoneNumberInput>,
}

impl IdentifyRequest {
    /// Normalise the raw request into an observation.
    ///
    /// # Errors
    /// Returns [`identity_core::IdentityError::InvalidInput`] when both fields are absent or blank.
    pub fn observation(self) -> Result<Observation, identity_core::IdentityError> {
        Observation::new(self.email, self.phone_number.map(PhoneNumberInput::into_text))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub contact: ContactSummary,
}

#[derive(Debug, Clone)]
pub struct IdentityApi {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl IdentityApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_busy_timeout(&self.db_path, self.busy_timeout)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Reconcile one submission and return the settled cluster.
    ///
    /// Domain failures stay downcastable to [`identity_core::IdentityError`].
    ///
    /// # Errors
    /// Returns an error when input is invalid, the store cannot be opened, or reconciliation fails.
    pub fn identify(&self, request: IdentifyRequest) -> Result<IdentifyResponse> {
        let observation = request.observation()?;
        let mut store = self.open_migrated_store()?;
        let outcome = reconcile(&mut store, &observation)?;
        tracing::info!(
            primary_id = %outcome.summary.primary_contact_id,
            created = outcome.created.len(),
            relinked = outcome.relinked.len(),
            "identify reconciled"
        );
        Ok(IdentifyResponse { contact: outcome.summary })
    }

    /// Canonical cluster view for any contact id.
    ///
    /// # Errors
    /// Returns [`identity_core::IdentityError::NotFound`] for unknown ids, or a store error.
    pub fn contact_show(&self, contact_id: ContactId) -> Result<ContactSummary> {
        let mut store = self.open_migrated_store()?;
        Ok(cluster_summary(&mut store, contact_id)?)
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or rows cannot be decoded.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let store = self.open_migrated_store()?;
        store.list_contacts()
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Write an online backup of the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or the backup fails.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_store()?;
        store
            .backup_database(out_file)
            .with_context(|| format!("backup of {} failed", self.db_path.display()))
    }
}
