//! Durable register on `SQLite`.
//!
//! Every [`IssueStore::commit`] runs inside one `BEGIN IMMEDIATE` transaction, so the
//! stale-revision check and the writes it guards see the same committed state even
//! when several connections share the database file.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use issue_register_core::{
    format_date, plan_commit, replay, Author, CandidateStatement, ChangeSet, CommitReceipt, CurrentIssue,
    DeferredCandidate, DeferredQueue, Document, DocumentDraft, EvidenceLink, EvidenceLinkId, EvidenceRole,
    Issue, IssueField, IssueFilter, IssueId, IssueState, IssueStore, Meeting, MeetingDocumentLink, MeetingDraft,
    PendingMatch, PendingMatchBook, PendingMatchId, PendingStatus, ProvenanceLedger, RegisterError,
    RegisterResult, Revision, SourceKind, SourceRef, SourceRegistry, Span,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod snapshot;

pub use snapshot::{ExportFileDigest, ExportManifest, ImportSummary};

pub const LATEST_SCHEMA_VERSION: i64 = 2;

pub const LAST_INGEST_RUN_START: &str = "last_ingest_run_start";
pub const LAST_INGEST_RUN_END: &str = "last_ingest_run_end";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS issues (
  issue_id TEXT PRIMARY KEY,
  revision INTEGER NOT NULL CHECK (revision >= 1),
  title TEXT NOT NULL,
  domain TEXT NOT NULL,
  owner TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('open', 'watching', 'mitigated', 'closed')),
  confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
  state_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS revisions (
  issue_id TEXT NOT NULL REFERENCES issues(issue_id),
  sequence INTEGER NOT NULL CHECK (sequence >= 1),
  author TEXT NOT NULL CHECK (author IN ('system', 'user')),
  change_summary TEXT NOT NULL,
  rationale TEXT,
  committed_at TEXT NOT NULL,
  committed_at_us INTEGER NOT NULL,
  previous_json TEXT,
  snapshot_json TEXT NOT NULL,
  changed_fields_json TEXT NOT NULL,
  supersedes INTEGER,
  cross_references_json TEXT NOT NULL,
  PRIMARY KEY (issue_id, sequence)
);

CREATE TABLE IF NOT EXISTS evidence_links (
  link_id TEXT PRIMARY KEY,
  issue_id TEXT NOT NULL REFERENCES issues(issue_id),
  source_kind TEXT NOT NULL CHECK (source_kind IN ('document', 'meeting')),
  source_id TEXT NOT NULL,
  span_start INTEGER,
  span_end INTEGER,
  excerpt TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('supports', 'contradicts', 'updates')),
  observed_at TEXT NOT NULL,
  observed_at_us INTEGER NOT NULL,
  recorded_at TEXT NOT NULL,
  recorded_in_revision INTEGER,
  reassigned_from TEXT
);

CREATE TABLE IF NOT EXISTS pending_matches (
  pending_id TEXT PRIMARY KEY,
  target_issue_id TEXT NOT NULL REFERENCES issues(issue_id),
  target_revision INTEGER NOT NULL,
  score REAL NOT NULL,
  rationale TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending', 'confirmed', 'rejected')),
  candidate_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  created_at_us INTEGER NOT NULL,
  resolved_at TEXT,
  resolution_note TEXT
);

CREATE INDEX IF NOT EXISTS idx_issues_status_updated ON issues(status, updated_at);
CREATE INDEX IF NOT EXISTS idx_revisions_committed ON revisions(committed_at_us);
CREATE INDEX IF NOT EXISTS idx_evidence_issue ON evidence_links(issue_id, observed_at_us);
CREATE INDEX IF NOT EXISTS idx_evidence_source ON evidence_links(source_kind, source_id);
CREATE INDEX IF NOT EXISTS idx_evidence_observed ON evidence_links(observed_at_us);
CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_matches(status, created_at_us);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS documents (
  source_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  path TEXT NOT NULL UNIQUE,
  tags_json TEXT NOT NULL,
  excerpt TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS meetings (
  source_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  source_tag TEXT NOT NULL,
  meeting_date TEXT NOT NULL,
  scheduled_at TEXT NOT NULL,
  scheduled_at_us INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (meeting_date, source_tag)
);

CREATE TABLE IF NOT EXISTS meeting_documents (
  meeting_id TEXT NOT NULL REFERENCES meetings(source_id),
  document_id TEXT NOT NULL REFERENCES documents(source_id),
  PRIMARY KEY (meeting_id, document_id)
);

CREATE TABLE IF NOT EXISTS deferred_candidates (
  deferred_id TEXT PRIMARY KEY,
  candidate_json TEXT NOT NULL,
  attempts INTEGER NOT NULL CHECK (attempts >= 1),
  last_error TEXT NOT NULL,
  deferred_at TEXT NOT NULL,
  deferred_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS app_state (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_meetings_scheduled ON meetings(scheduled_at_us);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

const ISSUE_COLUMNS: &str = "issue_id, revision, state_json, created_at, updated_at";
const REVISION_COLUMNS: &str = "issue_id, sequence, author, change_summary, rationale, committed_at,
     previous_json, snapshot_json, changed_fields_json, supersedes, cross_references_json";
const EVIDENCE_COLUMNS: &str = "link_id, issue_id, source_kind, source_id, span_start, span_end, excerpt,
     role, observed_at, recorded_at, recorded_in_revision, reassigned_from";
const PENDING_COLUMNS: &str = "pending_id, target_issue_id, target_revision, score, rationale, status,
     candidate_json, created_at, resolved_at, resolution_note";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Issues whose stored state does not equal the replay of their revisions.
    pub revision_chain_errors: Vec<String>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed register and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// # Errors
    /// Returns an error when the in-memory database cannot be configured.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
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
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = MIGRATIONS
            .iter()
            .map(|(version, _)| *version)
            .filter(|version| *version > current_version)
            .collect();
        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or a migration fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!("unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"));
        }

        for (target, sql) in MIGRATIONS.iter().filter(|(target, _)| *target > version) {
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{target} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{target}"))?;
            record_schema_version(&tx, *target)?;
            tx.commit().with_context(|| format!("failed to commit migration v{target}"))?;
            tracing::info!(version = target, "applied schema migration");
        }
        Ok(())
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

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| format!("failed to restore sqlite backup from {}", in_file.display()))?;

        self.migrate()
    }

    /// Run quick-check, foreign-key-check, revision replay and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt =
            self.conn.prepare("PRAGMA foreign_key_check").context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation { table: row.get(0)?, rowid: row.get(1)?, parent: row.get(2)?, fk_index: row.get(3)? })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let mut revision_chain_errors = Vec::new();
        for issue in load_issues(&self.conn, None)? {
            let history = load_revisions(&self.conn, issue.id)?;
            match replay(&history) {
                Ok(state) if state == issue.state && u32::try_from(history.len()).ok() == Some(issue.revision) => {}
                Ok(_) => revision_chain_errors.push(format!("issue {} does not match its revision history", issue.id)),
                Err(err) => revision_chain_errors.push(format!("issue {}: {err}", issue.id)),
            }
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            revision_chain_errors,
            schema_status,
        })
    }

    /// Revisions committed in `[start, end]` across all issues, oldest first.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn revisions_committed_between(&self, start: OffsetDateTime, end: OffsetDateTime) -> Result<Vec<Revision>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REVISION_COLUMNS} FROM revisions
             WHERE committed_at_us BETWEEN ?1 AND ?2
             ORDER BY committed_at_us ASC, issue_id ASC, sequence ASC"
        ))?;
        let rows = stmt.query_map(params![unix_micros(start), unix_micros(end)], RevisionRow::read)?;
        collect_rows(rows, RevisionRow::into_revision)
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub fn set_app_state(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO app_state(key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, rfc3339(OffsetDateTime::now_utc())?],
            )
            .with_context(|| format!("failed to write app_state {key}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the read fails.
    pub fn app_state(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM app_state WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .with_context(|| format!("failed to read app_state {key}"))
    }

    fn commit_change(&mut self, change: ChangeSet) -> Result<CommitReceipt> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start commit transaction")?;

        let mut current = BTreeMap::new();
        for issue_id in change.touched_issue_ids() {
            if let Some(issue) = load_issue(&tx, issue_id)? {
                let latest = load_revision(&tx, issue_id, issue.revision)?
                    .ok_or_else(|| anyhow!("issue {issue_id} is missing revision {}", issue.revision))?;
                current.insert(issue_id, CurrentIssue { issue, latest });
            }
        }

        let plan = plan_commit(change, &current)?;
        for resolution in &plan.pending_resolutions {
            let status = tx
                .query_row(
                    "SELECT status FROM pending_matches WHERE pending_id = ?1",
                    params![resolution.pending_id.to_string()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            match status.as_deref() {
                None => return Err(RegisterError::NotFound(format!("pending match {}", resolution.pending_id)).into()),
                Some("pending") => {}
                Some(other) => {
                    return Err(RegisterError::Validation(format!(
                        "pending match {} is already {other}",
                        resolution.pending_id
                    ))
                    .into());
                }
            }
        }

        let receipt = plan.receipt();
        for (issue, revision) in &plan.created {
            insert_issue(&tx, issue)?;
            insert_revision(&tx, revision)?;
        }
        for (issue, revision) in &plan.updated {
            update_issue(&tx, issue)?;
            insert_revision(&tx, revision)?;
        }
        for link in &plan.evidence {
            insert_evidence(&tx, link)?;
        }
        for resolution in &plan.pending_resolutions {
            tx.execute(
                "UPDATE pending_matches SET status = ?2, resolved_at = ?3, resolution_note = ?4 WHERE pending_id = ?1",
                params![
                    resolution.pending_id.to_string(),
                    resolution.status.as_str(),
                    rfc3339(plan.committed_at)?,
                    resolution.note,
                ],
            )
            .context("failed to resolve pending match")?;
        }

        tx.commit().context("failed to commit change set")?;
        tracing::debug!(
            created = receipt.created.len(),
            revisions = receipt.revisions.len(),
            evidence = receipt.evidence.len(),
            "committed change set"
        );
        Ok(receipt)
    }
}

impl IssueStore for SqliteStore {
    fn commit(&mut self, change: ChangeSet) -> RegisterResult<CommitReceipt> {
        self.commit_change(change).map_err(into_register)
    }

    fn get(&self, issue_id: IssueId) -> RegisterResult<Issue> {
        load_issue(&self.conn, issue_id)
            .map_err(into_register)?
            .ok_or_else(|| RegisterError::NotFound(format!("issue {issue_id}")))
    }

    fn list(&self, filter: &IssueFilter) -> RegisterResult<Vec<Issue>> {
        let mut issues = load_issues(&self.conn, filter.status.map(|status| status.as_str()))
            .map_err(into_register)?
            .into_iter()
            .filter(|issue| filter.matches(issue))
            .collect::<Vec<_>>();
        filter.finish(&mut issues);
        Ok(issues)
    }

    fn revisions(&self, issue_id: IssueId) -> RegisterResult<Vec<Revision>> {
        self.get(issue_id)?;
        load_revisions(&self.conn, issue_id).map_err(into_register)
    }
}

impl ProvenanceLedger for SqliteStore {
    fn evidence_for_issue(&self, issue_id: IssueId) -> RegisterResult<Vec<EvidenceLink>> {
        self.get(issue_id)?;
        query_evidence(
            &self.conn,
            "WHERE issue_id = ?1",
            &[&issue_id.to_string() as &dyn rusqlite::ToSql],
        )
        .map_err(into_register)
    }

    fn evidence_for_source(&self, source: &SourceRef) -> RegisterResult<Vec<EvidenceLink>> {
        query_evidence(
            &self.conn,
            "WHERE source_kind = ?1 AND source_id = ?2",
            &[&source.kind.as_str() as &dyn rusqlite::ToSql, &source.id],
        )
        .map_err(into_register)
    }

    fn evidence_observed_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> RegisterResult<Vec<EvidenceLink>> {
        query_evidence(
            &self.conn,
            "WHERE observed_at_us BETWEEN ?1 AND ?2",
            &[&unix_micros(start) as &dyn rusqlite::ToSql, &unix_micros(end)],
        )
        .map_err(into_register)
    }
}

impl PendingMatchBook for SqliteStore {
    fn record_pending(&mut self, pending: PendingMatch) -> RegisterResult<()> {
        if load_pending(&self.conn, pending.pending_id).map_err(into_register)?.is_some() {
            return Err(RegisterError::Validation(format!("pending match {} already exists", pending.pending_id)));
        }
        insert_pending(&self.conn, &pending).map_err(into_register)
    }

    fn pending_match(&self, pending_id: PendingMatchId) -> RegisterResult<PendingMatch> {
        load_pending(&self.conn, pending_id)
            .map_err(into_register)?
            .ok_or_else(|| RegisterError::NotFound(format!("pending match {pending_id}")))
    }

    fn list_pending(&self, status: Option<PendingStatus>) -> RegisterResult<Vec<PendingMatch>> {
        list_pending_rows(&self.conn, status).map_err(into_register)
    }
}

impl DeferredQueue for SqliteStore {
    fn defer(
        &mut self,
        candidate: CandidateStatement,
        error: &str,
        at: OffsetDateTime,
    ) -> RegisterResult<DeferredCandidate> {
        let deferred = DeferredCandidate {
            deferred_id: Ulid::new(),
            candidate,
            attempts: 1,
            last_error: error.to_string(),
            deferred_at: at,
        };
        insert_deferred(&self.conn, &deferred).map_err(into_register)?;
        Ok(deferred)
    }

    fn deferred(&self) -> RegisterResult<Vec<DeferredCandidate>> {
        list_deferred(&self.conn).map_err(into_register)
    }

    fn record_deferred_failure(&mut self, deferred_id: Ulid, error: &str) -> RegisterResult<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE deferred_candidates SET attempts = attempts + 1, last_error = ?2 WHERE deferred_id = ?1",
                params![deferred_id.to_string(), error],
            )
            .map_err(storage)?;
        if updated == 0 {
            return Err(RegisterError::NotFound(format!("deferred candidate {deferred_id}")));
        }
        Ok(())
    }

    fn clear_deferred(&mut self, deferred_id: Ulid) -> RegisterResult<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM deferred_candidates WHERE deferred_id = ?1", params![deferred_id.to_string()])
            .map_err(storage)?;
        if deleted == 0 {
            return Err(RegisterError::NotFound(format!("deferred candidate {deferred_id}")));
        }
        Ok(())
    }
}

impl SourceRegistry for SqliteStore {
    fn register_document(&mut self, draft: DocumentDraft, at: OffsetDateTime) -> RegisterResult<Document> {
        draft.validate()?;
        self.upsert_document(draft, at).map_err(into_register)
    }

    fn register_meeting(&mut self, draft: MeetingDraft, at: OffsetDateTime) -> RegisterResult<Meeting> {
        draft.validate()?;
        self.upsert_meeting(&draft, at).map_err(into_register)
    }

    fn link_meeting_document(&mut self, meeting_id: &str, document_id: &str) -> RegisterResult<()> {
        if !row_exists(&self.conn, "meetings", meeting_id).map_err(into_register)? {
            return Err(RegisterError::NotFound(format!("meeting {meeting_id}")));
        }
        if !row_exists(&self.conn, "documents", document_id).map_err(into_register)? {
            return Err(RegisterError::NotFound(format!("document {document_id}")));
        }
        self.conn
            .execute(
                "INSERT OR IGNORE INTO meeting_documents(meeting_id, document_id) VALUES (?1, ?2)",
                params![meeting_id, document_id],
            )
            .map_err(storage)?;
        Ok(())
    }

    fn documents(&self) -> RegisterResult<Vec<Document>> {
        list_documents(&self.conn).map_err(into_register)
    }

    fn meetings(&self) -> RegisterResult<Vec<Meeting>> {
        list_meetings(&self.conn, None).map_err(into_register)
    }

    fn meetings_between(&self, start: OffsetDateTime, end: OffsetDateTime) -> RegisterResult<Vec<Meeting>> {
        list_meetings(&self.conn, Some((start, end))).map_err(into_register)
    }

    fn meeting_document_links(&self) -> RegisterResult<Vec<MeetingDocumentLink>> {
        list_meeting_documents(&self.conn).map_err(into_register)
    }
}

impl SqliteStore {
    fn upsert_document(&self, draft: DocumentDraft, at: OffsetDateTime) -> Result<Document> {
        let excerpt = draft.excerpt();
        let path = draft.path.trim().to_string();
        let tags_json = serde_json::to_string(&draft.tags).context("failed to serialize document tags")?;
        let existing = self
            .conn
            .query_row("SELECT source_id, created_at FROM documents WHERE path = ?1", params![path], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?;

        if let Some((source_id, created_at)) = existing {
            self.conn
                .execute(
                    "UPDATE documents SET title = ?2, tags_json = ?3, excerpt = ?4 WHERE source_id = ?1",
                    params![source_id, draft.title, tags_json, excerpt],
                )
                .context("failed to update document")?;
            return Ok(Document {
                source_id,
                title: draft.title,
                path,
                tags: draft.tags,
                excerpt,
                created_at: parse_rfc3339(&created_at)?,
            });
        }

        let document =
            Document { source_id: Ulid::new().to_string(), title: draft.title, path, tags: draft.tags, excerpt, created_at: at };
        insert_document(&self.conn, &document)?;
        Ok(document)
    }

    fn upsert_meeting(&self, draft: &MeetingDraft, at: OffsetDateTime) -> Result<Meeting> {
        let (date, source_tag) = draft.upsert_key();
        let meeting_date = format_date(date);
        let existing = self
            .conn
            .query_row(
                "SELECT source_id, created_at FROM meetings WHERE meeting_date = ?1 AND source_tag = ?2",
                params![meeting_date, source_tag],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        if let Some((source_id, created_at)) = existing {
            self.conn
                .execute(
                    "UPDATE meetings SET title = ?2, scheduled_at = ?3, scheduled_at_us = ?4 WHERE source_id = ?1",
                    params![source_id, draft.title, rfc3339(draft.scheduled_at)?, unix_micros(draft.scheduled_at)],
                )
                .context("failed to update meeting")?;
            return Ok(Meeting {
                source_id,
                title: draft.title.clone(),
                source_tag,
                scheduled_at: draft.scheduled_at,
                created_at: parse_rfc3339(&created_at)?,
            });
        }

        let meeting = Meeting {
            source_id: Ulid::new().to_string(),
            title: draft.title.clone(),
            source_tag,
            scheduled_at: draft.scheduled_at,
            created_at: at,
        };
        insert_meeting(&self.conn, &meeting)?;
        Ok(meeting)
    }
}

/// Recover a typed register error carried through `anyhow`, or wrap anything else as storage.
fn into_register(err: anyhow::Error) -> RegisterError {
    match err.downcast::<RegisterError>() {
        Ok(register) => register,
        Err(other) => RegisterError::Storage(format!("{other:#}")),
    }
}

fn storage(err: impl Display) -> RegisterError {
    RegisterError::Storage(err.to_string())
}

fn collect_rows<R, T>(
    rows: impl Iterator<Item = rusqlite::Result<R>>,
    convert: impl Fn(R) -> Result<T>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(convert(row?)?);
    }
    Ok(values)
}

struct IssueRow {
    issue_id: String,
    revision: u32,
    state_json: String,
    created_at: String,
    updated_at: String,
}

impl IssueRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            issue_id: row.get(0)?,
            revision: row.get(1)?,
            state_json: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_issue(self) -> Result<Issue> {
        Ok(Issue {
            id: parse_issue_id(&self.issue_id)?,
            revision: self.revision,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
            state: serde_json::from_str(&self.state_json)
                .with_context(|| format!("failed to decode state for issue {}", self.issue_id))?,
        })
    }
}

struct RevisionRow {
    issue_id: String,
    sequence: u32,
    author: String,
    change_summary: String,
    rationale: Option<String>,
    committed_at: String,
    previous_json: Option<String>,
    snapshot_json: String,
    changed_fields_json: String,
    supersedes: Option<u32>,
    cross_references_json: String,
}

impl RevisionRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            issue_id: row.get(0)?,
            sequence: row.get(1)?,
            author: row.get(2)?,
            change_summary: row.get(3)?,
            rationale: row.get(4)?,
            committed_at: row.get(5)?,
            previous_json: row.get(6)?,
            snapshot_json: row.get(7)?,
            changed_fields_json: row.get(8)?,
            supersedes: row.get(9)?,
            cross_references_json: row.get(10)?,
        })
    }

    fn into_revision(self) -> Result<Revision> {
        let previous_snapshot = self
            .previous_json
            .as_deref()
            .map(serde_json::from_str::<IssueState>)
            .transpose()
            .context("failed to decode previous snapshot")?;
        Ok(Revision {
            issue_id: parse_issue_id(&self.issue_id)?,
            sequence: self.sequence,
            author: Author::parse(&self.author).ok_or_else(|| anyhow!("invalid revision author: {}", self.author))?,
            change_summary: self.change_summary,
            rationale: self.rationale,
            committed_at: parse_rfc3339(&self.committed_at)?,
            previous_snapshot,
            snapshot: serde_json::from_str(&self.snapshot_json).context("failed to decode revision snapshot")?,
            changed_fields: serde_json::from_str::<Vec<IssueField>>(&self.changed_fields_json)
                .context("failed to decode changed fields")?,
            supersedes: self.supersedes,
            cross_references: serde_json::from_str(&self.cross_references_json)
                .context("failed to decode cross references")?,
        })
    }
}

struct EvidenceRow {
    link_id: String,
    issue_id: String,
    source_kind: String,
    source_id: String,
    span_start: Option<u32>,
    span_end: Option<u32>,
    excerpt: String,
    role: String,
    observed_at: String,
    recorded_at: String,
    recorded_in_revision: Option<u32>,
    reassigned_from: Option<String>,
}

impl EvidenceRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            link_id: row.get(0)?,
            issue_id: row.get(1)?,
            source_kind: row.get(2)?,
            source_id: row.get(3)?,
            span_start: row.get(4)?,
            span_end: row.get(5)?,
            excerpt: row.get(6)?,
            role: row.get(7)?,
            observed_at: row.get(8)?,
            recorded_at: row.get(9)?,
            recorded_in_revision: row.get(10)?,
            reassigned_from: row.get(11)?,
        })
    }

    fn into_link(self) -> Result<EvidenceLink> {
        let kind = SourceKind::parse(&self.source_kind)
            .ok_or_else(|| anyhow!("invalid evidence source kind: {}", self.source_kind))?;
        let span = match (self.span_start, self.span_end) {
            (Some(start), Some(end)) => Some(Span { start, end }),
            _ => None,
        };
        Ok(EvidenceLink {
            link_id: EvidenceLinkId(parse_ulid(&self.link_id)?),
            issue_id: parse_issue_id(&self.issue_id)?,
            source: SourceRef { kind, id: self.source_id },
            span,
            excerpt: self.excerpt,
            role: EvidenceRole::parse(&self.role).ok_or_else(|| anyhow!("invalid evidence role: {}", self.role))?,
            observed_at: parse_rfc3339(&self.observed_at)?,
            recorded_at: parse_rfc3339(&self.recorded_at)?,
            recorded_in_revision: self.recorded_in_revision,
            reassigned_from: self.reassigned_from.as_deref().map(parse_issue_id).transpose()?,
        })
    }
}

struct PendingRow {
    pending_id: String,
    target_issue_id: String,
    target_revision: u32,
    score: f32,
    rationale: String,
    status: String,
    candidate_json: String,
    created_at: String,
    resolved_at: Option<String>,
    resolution_note: Option<String>,
}

impl PendingRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pending_id: row.get(0)?,
            target_issue_id: row.get(1)?,
            target_revision: row.get(2)?,
            score: row.get(3)?,
            rationale: row.get(4)?,
            status: row.get(5)?,
            candidate_json: row.get(6)?,
            created_at: row.get(7)?,
            resolved_at: row.get(8)?,
            resolution_note: row.get(9)?,
        })
    }

    fn into_pending(self) -> Result<PendingMatch> {
        Ok(PendingMatch {
            pending_id: PendingMatchId(parse_ulid(&self.pending_id)?),
            candidate: serde_json::from_str(&self.candidate_json).context("failed to decode pending candidate")?,
            target_issue_id: parse_issue_id(&self.target_issue_id)?,
            target_revision: self.target_revision,
            score: self.score,
            rationale: self.rationale,
            status: PendingStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("invalid pending status: {}", self.status))?,
            created_at: parse_rfc3339(&self.created_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_rfc3339).transpose()?,
            resolution_note: self.resolution_note,
        })
    }
}

pub(crate) fn load_issue(conn: &Connection, issue_id: IssueId) -> Result<Option<Issue>> {
    conn.query_row(
        &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE issue_id = ?1"),
        params![issue_id.to_string()],
        IssueRow::read,
    )
    .optional()?
    .map(IssueRow::into_issue)
    .transpose()
}

pub(crate) fn load_issues(conn: &Connection, status: Option<&str>) -> Result<Vec<Issue>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ISSUE_COLUMNS} FROM issues WHERE (?1 IS NULL OR status = ?1) ORDER BY issue_id ASC"
    ))?;
    let rows = stmt.query_map(params![status], IssueRow::read)?;
    collect_rows(rows, IssueRow::into_issue)
}

fn load_revision(conn: &Connection, issue_id: IssueId, sequence: u32) -> Result<Option<Revision>> {
    conn.query_row(
        &format!("SELECT {REVISION_COLUMNS} FROM revisions WHERE issue_id = ?1 AND sequence = ?2"),
        params![issue_id.to_string(), sequence],
        RevisionRow::read,
    )
    .optional()?
    .map(RevisionRow::into_revision)
    .transpose()
}

pub(crate) fn load_revisions(conn: &Connection, issue_id: IssueId) -> Result<Vec<Revision>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {REVISION_COLUMNS} FROM revisions WHERE issue_id = ?1 ORDER BY sequence ASC"))?;
    let rows = stmt.query_map(params![issue_id.to_string()], RevisionRow::read)?;
    collect_rows(rows, RevisionRow::into_revision)
}

pub(crate) fn load_all_revisions(conn: &Connection) -> Result<Vec<Revision>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {REVISION_COLUMNS} FROM revisions ORDER BY issue_id ASC, sequence ASC"))?;
    let rows = stmt.query_map([], RevisionRow::read)?;
    collect_rows(rows, RevisionRow::into_revision)
}

pub(crate) fn query_evidence(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<EvidenceLink>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVIDENCE_COLUMNS} FROM evidence_links {where_clause} ORDER BY observed_at_us ASC, link_id ASC"
    ))?;
    let rows = stmt.query_map(params, EvidenceRow::read)?;
    collect_rows(rows, EvidenceRow::into_link)
}

fn load_pending(conn: &Connection, pending_id: PendingMatchId) -> Result<Option<PendingMatch>> {
    conn.query_row(
        &format!("SELECT {PENDING_COLUMNS} FROM pending_matches WHERE pending_id = ?1"),
        params![pending_id.to_string()],
        PendingRow::read,
    )
    .optional()?
    .map(PendingRow::into_pending)
    .transpose()
}

pub(crate) fn list_pending_rows(conn: &Connection, status: Option<PendingStatus>) -> Result<Vec<PendingMatch>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PENDING_COLUMNS} FROM pending_matches
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY created_at_us ASC, pending_id ASC"
    ))?;
    let rows = stmt.query_map(params![status.map(PendingStatus::as_str)], PendingRow::read)?;
    collect_rows(rows, PendingRow::into_pending)
}

pub(crate) fn list_deferred(conn: &Connection) -> Result<Vec<DeferredCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT deferred_id, candidate_json, attempts, last_error, deferred_at
         FROM deferred_candidates
         ORDER BY deferred_at_us ASC, deferred_id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, u32>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    collect_rows(rows, |(deferred_id, candidate_json, attempts, last_error, deferred_at)| {
        Ok(DeferredCandidate {
            deferred_id: parse_ulid(&deferred_id)?,
            candidate: serde_json::from_str(&candidate_json).context("failed to decode deferred candidate")?,
            attempts,
            last_error,
            deferred_at: parse_rfc3339(&deferred_at)?,
        })
    })
}

pub(crate) fn list_documents(conn: &Connection) -> Result<Vec<Document>> {
    let mut stmt =
        conn.prepare("SELECT source_id, title, path, tags_json, excerpt, created_at FROM documents ORDER BY path ASC")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;
    collect_rows(rows, |(source_id, title, path, tags_json, excerpt, created_at)| {
        Ok(Document {
            source_id,
            title,
            path,
            tags: serde_json::from_str(&tags_json).context("failed to decode document tags")?,
            excerpt,
            created_at: parse_rfc3339(&created_at)?,
        })
    })
}

pub(crate) fn list_meetings(conn: &Connection, range: Option<(OffsetDateTime, OffsetDateTime)>) -> Result<Vec<Meeting>> {
    let (start, end) = range.map_or((i64::MIN, i64::MAX), |(start, end)| (unix_micros(start), unix_micros(end)));
    let mut stmt = conn.prepare(
        "SELECT source_id, title, source_tag, scheduled_at, created_at
         FROM meetings
         WHERE scheduled_at_us BETWEEN ?1 AND ?2
         ORDER BY scheduled_at_us ASC, source_id ASC",
    )?;
    let rows = stmt.query_map(params![start, end], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    collect_rows(rows, |(source_id, title, source_tag, scheduled_at, created_at)| {
        Ok(Meeting {
            source_id,
            title,
            source_tag,
            scheduled_at: parse_rfc3339(&scheduled_at)?,
            created_at: parse_rfc3339(&created_at)?,
        })
    })
}

pub(crate) fn list_meeting_documents(conn: &Connection) -> Result<Vec<MeetingDocumentLink>> {
    let mut stmt =
        conn.prepare("SELECT meeting_id, document_id FROM meeting_documents ORDER BY meeting_id ASC, document_id ASC")?;
    let rows = stmt.query_map([], |row| Ok(MeetingDocumentLink { meeting_id: row.get(0)?, document_id: row.get(1)? }))?;
    collect_rows(rows, Ok)
}

pub(crate) fn insert_issue(conn: &Connection, issue: &Issue) -> Result<()> {
    conn.execute(
        "INSERT INTO issues(
            issue_id, revision, title, domain, owner, status, confidence, state_json, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            issue.id.to_string(),
            issue.revision,
            issue.state.title,
            issue.state.domain,
            issue.state.owner,
            issue.state.status.as_str(),
            issue.state.confidence,
            serde_json::to_string(&issue.state).context("failed to serialize issue state")?,
            rfc3339(issue.created_at)?,
            rfc3339(issue.updated_at)?,
        ],
    )
    .with_context(|| format!("failed to insert issue {}", issue.id))?;
    Ok(())
}

fn update_issue(conn: &Connection, issue: &Issue) -> Result<()> {
    conn.execute(
        "UPDATE issues SET
            revision = ?2, title = ?3, domain = ?4, owner = ?5, status = ?6, confidence = ?7,
            state_json = ?8, updated_at = ?9
         WHERE issue_id = ?1",
        params![
            issue.id.to_string(),
            issue.revision,
            issue.state.title,
            issue.state.domain,
            issue.state.owner,
            issue.state.status.as_str(),
            issue.state.confidence,
            serde_json::to_string(&issue.state).context("failed to serialize issue state")?,
            rfc3339(issue.updated_at)?,
        ],
    )
    .with_context(|| format!("failed to update issue {}", issue.id))?;
    Ok(())
}

pub(crate) fn insert_revision(conn: &Connection, revision: &Revision) -> Result<()> {
    let previous_json = revision
        .previous_snapshot
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize previous snapshot")?;
    conn.execute(
        "INSERT INTO revisions(
            issue_id, sequence, author, change_summary, rationale, committed_at, committed_at_us,
            previous_json, snapshot_json, changed_fields_json, supersedes, cross_references_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            revision.issue_id.to_string(),
            revision.sequence,
            revision.author.as_str(),
            revision.change_summary,
            revision.rationale,
            rfc3339(revision.committed_at)?,
            unix_micros(revision.committed_at),
            previous_json,
            serde_json::to_string(&revision.snapshot).context("failed to serialize revision snapshot")?,
            serde_json::to_string(&revision.changed_fields).context("failed to serialize changed fields")?,
            revision.supersedes,
            serde_json::to_string(&revision.cross_references).context("failed to serialize cross references")?,
        ],
    )
    .with_context(|| format!("failed to insert revision {} of issue {}", revision.sequence, revision.issue_id))?;
    Ok(())
}

pub(crate) fn insert_evidence(conn: &Connection, link: &EvidenceLink) -> Result<()> {
    conn.execute(
        "INSERT INTO evidence_links(
            link_id, issue_id, source_kind, source_id, span_start, span_end, excerpt, role,
            observed_at, observed_at_us, recorded_at, recorded_in_revision, reassigned_from
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            link.link_id.to_string(),
            link.issue_id.to_string(),
            link.source.kind.as_str(),
            link.source.id,
            link.span.map(|span| span.start),
            link.span.map(|span| span.end),
            link.excerpt,
            link.role.as_str(),
            rfc3339(link.observed_at)?,
            unix_micros(link.observed_at),
            rfc3339(link.recorded_at)?,
            link.recorded_in_revision,
            link.reassigned_from.map(|issue_id| issue_id.to_string()),
        ],
    )
    .with_context(|| format!("failed to insert evidence link {}", link.link_id))?;
    Ok(())
}

pub(crate) fn insert_pending(conn: &Connection, pending: &PendingMatch) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_matches(
            pending_id, target_issue_id, target_revision, score, rationale, status, candidate_json,
            created_at, created_at_us, resolved_at, resolution_note
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            pending.pending_id.to_string(),
            pending.target_issue_id.to_string(),
            pending.target_revision,
            pending.score,
            pending.rationale,
            pending.status.as_str(),
            serde_json::to_string(&pending.candidate).context("failed to serialize pending candidate")?,
            rfc3339(pending.created_at)?,
            unix_micros(pending.created_at),
            pending.resolved_at.map(rfc3339).transpose()?,
            pending.resolution_note,
        ],
    )
    .with_context(|| format!("failed to insert pending match {}", pending.pending_id))?;
    Ok(())
}

pub(crate) fn insert_deferred(conn: &Connection, deferred: &DeferredCandidate) -> Result<()> {
    conn.execute(
        "INSERT INTO deferred_candidates(deferred_id, candidate_json, attempts, last_error, deferred_at, deferred_at_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            deferred.deferred_id.to_string(),
            serde_json::to_string(&deferred.candidate).context("failed to serialize deferred candidate")?,
            deferred.attempts,
            deferred.last_error,
            rfc3339(deferred.deferred_at)?,
            unix_micros(deferred.deferred_at),
        ],
    )
    .with_context(|| format!("failed to insert deferred candidate {}", deferred.deferred_id))?;
    Ok(())
}

pub(crate) fn insert_document(conn: &Connection, document: &Document) -> Result<()> {
    conn.execute(
        "INSERT INTO documents(source_id, title, path, tags_json, excerpt, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            document.source_id,
            document.title,
            document.path,
            serde_json::to_string(&document.tags).context("failed to serialize document tags")?,
            document.excerpt,
            rfc3339(document.created_at)?,
        ],
    )
    .with_context(|| format!("failed to insert document {}", document.path))?;
    Ok(())
}

pub(crate) fn insert_meeting(conn: &Connection, meeting: &Meeting) -> Result<()> {
    conn.execute(
        "INSERT INTO meetings(source_id, title, source_tag, meeting_date, scheduled_at, scheduled_at_us, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            meeting.source_id,
            meeting.title,
            meeting.source_tag,
            format_date(meeting.scheduled_at.date()),
            rfc3339(meeting.scheduled_at)?,
            unix_micros(meeting.scheduled_at),
            rfc3339(meeting.created_at)?,
        ],
    )
    .with_context(|| format!("failed to insert meeting {}", meeting.source_tag))?;
    Ok(())
}

pub(crate) fn row_exists(conn: &Connection, table: &str, key: &str) -> Result<bool> {
    let column = match table {
        "issues" => "issue_id",
        "evidence_links" => "link_id",
        "pending_matches" => "pending_id",
        "deferred_candidates" => "deferred_id",
        "documents" | "meetings" => "source_id",
        other => return Err(anyhow!("unknown table {other}")),
    };
    let exists = conn
        .query_row(&format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {column} = ?1)"), params![key], |row| {
            row.get::<_, i64>(0)
        })
        .with_context(|| format!("failed to check {table} for {key}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get::<_, i64>(0))
        .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, rfc3339(OffsetDateTime::now_utc())?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

/// Sort key for time-range queries; RFC3339 text does not order across offsets.
fn unix_micros(value: OffsetDateTime) -> i64 {
    let micros = value.unix_timestamp_nanos() / 1_000;
    i64::try_from(micros).unwrap_or(if micros < 0 { i64::MIN } else { i64::MAX })
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value.format(&time::format_description::well_known::Rfc3339).context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_issue_id(raw: &str) -> Result<IssueId> {
    parse_ulid(raw).map(IssueId)
}
