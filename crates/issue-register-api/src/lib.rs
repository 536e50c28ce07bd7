use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use issue_register_core::{
    compose_agenda_from_store, detect_merge_candidates, format_date, parse_date, AgendaItem, Author,
    CandidateStatement, DeferredCandidate, DeferredQueue, Document, DocumentDraft, EvidenceLink,
    EvidenceRequest, GuardedOracle, IngestDriver, IngestItem, IngestReport, Issue, IssueDraft, IssueEdit,
    IssueFilter, IssueId, IssueStatus, IssueStore, IssueField, LexicalOracle, Meeting, MeetingDocumentLink,
    MeetingDraft, MergeReceipt, MergeSuggestion, OracleKind, PendingMatch, PendingMatchBook, PendingMatchId,
    PendingStatus, ProvenanceLedger, ReconcileResult, Reconciler, RegisterConfig, RegisterError,
    RegisterResult, RejectReceipt, Revision, RevisionSeq, SimilarityOracle, SourceRef, SourceRegistry,
    SplitPart, SplitReceipt, MAX_WINDOW_DAYS,
};
use issue_register_store_sqlite::{
    ExportManifest, ImportSummary, IntegrityReport, SchemaStatus, SqliteStore, LAST_INGEST_RUN_END,
    LAST_INGEST_RUN_START,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

mod embedding;

pub use embedding::{cosine_similarity, HttpEmbeddingOracle};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const DEFAULT_REPORT_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditIssueRequest {
    pub base_revision: RevisionSeq,
    #[serde(flatten)]
    pub edit: IssueEdit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptStepsRequest {
    pub base_revision: RevisionSeq,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeIssuesRequest {
    pub survivor: IssueId,
    pub absorbed: IssueId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitIssueRequest {
    pub base_revision: RevisionSeq,
    pub parts: Vec<SplitPart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvePendingRequest {
    #[serde(default)]
    pub note: Option<String>,
    /// On reject: create a new issue from the candidate instead of discarding it.
    #[serde(default)]
    pub promote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestRequest {
    pub candidates: Vec<CandidateStatement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkMeetingDocumentRequest {
    pub meeting_id: String,
    pub document_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgendaRequest {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
    #[serde(default)]
    pub window_days: Option<u32>,
}

/// Dates are `YYYY-MM-DD`; both ends are inclusive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityReportRequest {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevisionActivity {
    pub issue_id: IssueId,
    pub sequence: RevisionSeq,
    pub title: String,
    pub change_summary: String,
    pub changed_fields: Vec<IssueField>,
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeetingIssueActivity {
    pub meeting_id: String,
    pub meeting_date: String,
    pub issue_id: IssueId,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueActivity {
    pub issue_id: IssueId,
    pub title: String,
    pub status: IssueStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityReport {
    pub start: String,
    pub end: String,
    pub meetings: Vec<Meeting>,
    pub system_revisions: Vec<RevisionActivity>,
    pub meeting_issues: Vec<MeetingIssueActivity>,
    pub recent_issues: Vec<IssueActivity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRegistration {
    pub document: Document,
    /// Meetings named by the document's `Meetings.YYYY-MM-DD` tags, now linked to it.
    pub meetings: Vec<Meeting>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestRunWindow {
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Read a YAML configuration file, or the defaults when `path` is `None`, and validate it.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed, or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<RegisterConfig> {
    let config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_yaml::from_str::<RegisterConfig>(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => RegisterConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// The similarity oracle named by `config.oracle`. Network oracles are wrapped with the
/// configured timeout and retry guard.
#[must_use]
pub fn build_oracle(config: &RegisterConfig) -> Arc<dyn SimilarityOracle> {
    match config.oracle.kind {
        OracleKind::Lexical => Arc::new(LexicalOracle),
        OracleKind::HttpEmbedding => Arc::new(GuardedOracle::new(
            Arc::new(HttpEmbeddingOracle::from_config(&config.oracle)),
            &config.oracle,
        )),
    }
}

fn open_register_store(db_path: &Path) -> RegisterResult<SqliteStore> {
    let mut store = SqliteStore::open(db_path).map_err(|err| RegisterError::Storage(format!("{err:#}")))?;
    store.migrate().map_err(|err| RegisterError::Storage(format!("{err:#}")))?;
    Ok(store)
}

#[derive(Clone)]
pub struct IssueRegisterApi {
    db_path: PathBuf,
    config: RegisterConfig,
    oracle: Arc<dyn SimilarityOracle>,
}

impl IssueRegisterApi {
    /// Facade with default configuration and the lexical oracle.
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_config(db_path, RegisterConfig::default())
    }

    #[must_use]
    pub fn with_config(db_path: PathBuf, config: RegisterConfig) -> Self {
        let oracle = build_oracle(&config);
        Self { db_path, config, oracle }
    }

    #[must_use]
    pub fn with_oracle(db_path: PathBuf, config: RegisterConfig, oracle: Arc<dyn SimilarityOracle>) -> Self {
        Self { db_path, config, oracle }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn config(&self) -> &RegisterConfig {
        &self.config
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(&self.config.classifier)
    }

    fn open_raw_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_raw_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_raw_store()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_raw_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
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
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the snapshot cannot be written.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        self.open_store()?.export_snapshot(out_dir)
    }

    /// # Errors
    /// Returns an error when the manifest does not verify or the import conflicts.
    pub fn import_snapshot(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.open_store()?.import_snapshot(in_dir, skip_existing)
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.open_store()?.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup is missing or restore fails.
    pub fn restore(&self, in_file: &Path) -> Result<()> {
        self.open_raw_store()?.restore_database(in_file)
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// Create an issue by hand. The creation revision is User-authored.
    ///
    /// # Errors
    /// Returns validation or storage errors.
    pub fn create_issue(&self, draft: IssueDraft) -> Result<Issue> {
        let mut store = self.open_store()?;
        let issue_id = self.reconciler().create_issue(&mut store, draft, OffsetDateTime::now_utc())?;
        tracing::info!(%issue_id, "created issue");
        Ok(store.get(issue_id)?)
    }

    /// # Errors
    /// Returns [`RegisterError::NotFound`] for unknown ids.
    pub fn get_issue(&self, issue_id: IssueId) -> Result<Issue> {
        Ok(self.open_store()?.get(issue_id)?)
    }

    /// # Errors
    /// Returns storage errors.
    pub fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        Ok(self.open_store()?.list(filter)?)
    }

    /// Full revision history, oldest first.
    ///
    /// # Errors
    /// Returns [`RegisterError::NotFound`] for unknown ids.
    pub fn issue_revisions(&self, issue_id: IssueId) -> Result<Vec<Revision>> {
        Ok(self.open_store()?.revisions(issue_id)?)
    }

    /// # Errors
    /// Returns storage errors.
    pub fn issue_evidence(&self, issue_id: IssueId) -> Result<Vec<EvidenceLink>> {
        let store = self.open_store()?;
        store.get(issue_id)?;
        Ok(store.evidence_for_issue(issue_id)?)
    }

    /// Evidence links citing one source, across every issue.
    ///
    /// # Errors
    /// Returns a validation error for an empty source id, otherwise storage errors.
    pub fn evidence_for_source(&self, source: &SourceRef) -> Result<Vec<EvidenceLink>> {
        if source.id.trim().is_empty() {
            return Err(RegisterError::Validation("source id MUST be non-empty".to_string()).into());
        }
        Ok(self.open_store()?.evidence_for_source(source)?)
    }

    /// Commit a User revision; the edit must be based on the current revision.
    ///
    /// # Errors
    /// Returns [`RegisterError::StaleRevision`], [`RegisterError::InvalidTransition`] or
    /// validation errors.
    pub fn edit_issue(&self, issue_id: IssueId, request: &EditIssueRequest) -> Result<Issue> {
        let mut store = self.open_store()?;
        let sequence = self.reconciler().edit_issue(
            &mut store,
            issue_id,
            request.base_revision,
            &request.edit,
            OffsetDateTime::now_utc(),
        )?;
        tracing::info!(%issue_id, sequence, "committed user revision");
        Ok(store.get(issue_id)?)
    }

    /// # Errors
    /// Returns validation errors when nothing is suggested, or a stale-revision conflict.
    pub fn accept_suggested_steps(&self, issue_id: IssueId, request: AcceptStepsRequest) -> Result<Issue> {
        let mut store = self.open_store()?;
        self.reconciler().accept_suggested_steps(
            &mut store,
            issue_id,
            request.base_revision,
            OffsetDateTime::now_utc(),
        )?;
        Ok(store.get(issue_id)?)
    }

    /// # Errors
    /// Returns validation or storage errors.
    pub fn merge_issues(&self, request: MergeIssuesRequest) -> Result<MergeReceipt> {
        let mut store = self.open_store()?;
        let receipt =
            self.reconciler().merge_issues(&mut store, request.survivor, request.absorbed, OffsetDateTime::now_utc())?;
        tracing::info!(
            survivor = %receipt.survivor,
            absorbed = %receipt.absorbed,
            reassigned = receipt.reassigned_evidence,
            "merged issues"
        );
        Ok(receipt)
    }

    /// # Errors
    /// Returns validation, stale-revision or storage errors.
    pub fn split_issue(&self, issue_id: IssueId, request: &SplitIssueRequest) -> Result<SplitReceipt> {
        let mut store = self.open_store()?;
        let receipt = self.reconciler().split_issue(
            &mut store,
            issue_id,
            request.base_revision,
            &request.parts,
            OffsetDateTime::now_utc(),
        )?;
        tracing::info!(source = %receipt.source, created = receipt.created.len(), "split issue");
        Ok(receipt)
    }

    /// Append a user-initiated evidence link.
    ///
    /// # Errors
    /// Returns [`RegisterError::NotFound`] for unknown issues.
    pub fn link_evidence(&self, issue_id: IssueId, request: EvidenceRequest) -> Result<EvidenceLink> {
        let mut store = self.open_store()?;
        let link_id = self.reconciler().link_evidence(&mut store, issue_id, request, OffsetDateTime::now_utc())?;
        store
            .evidence_for_issue(issue_id)?
            .into_iter()
            .find(|link| link.link_id == link_id)
            .ok_or_else(|| anyhow!("evidence link {link_id} was not recorded"))
    }

    /// # Errors
    /// Returns storage errors.
    pub fn list_pending(&self, status: Option<PendingStatus>) -> Result<Vec<PendingMatch>> {
        Ok(self.open_store()?.list_pending(status)?)
    }

    /// # Errors
    /// Returns [`RegisterError::NotFound`] for unknown ids.
    pub fn get_pending(&self, pending_id: PendingMatchId) -> Result<PendingMatch> {
        Ok(self.open_store()?.pending_match(pending_id)?)
    }

    /// Merge a Pending Match into its target issue.
    ///
    /// # Errors
    /// Returns validation errors for resolved matches, or a stale-revision conflict.
    pub fn confirm_pending(&self, pending_id: PendingMatchId, request: ResolvePendingRequest) -> Result<ReconcileResult> {
        let mut store = self.open_store()?;
        let result = self.reconciler().confirm_match(&mut store, pending_id, request.note, OffsetDateTime::now_utc())?;
        tracing::info!(%pending_id, issue_id = %result.issue_id, "confirmed pending match");
        Ok(result)
    }

    /// # Errors
    /// Returns validation errors for resolved matches.
    pub fn reject_pending(&self, pending_id: PendingMatchId, request: ResolvePendingRequest) -> Result<RejectReceipt> {
        let mut store = self.open_store()?;
        let receipt = self.reconciler().reject_match(
            &mut store,
            pending_id,
            request.promote,
            request.note,
            OffsetDateTime::now_utc(),
        )?;
        tracing::info!(%pending_id, promoted = receipt.promoted.is_some(), "rejected pending match");
        Ok(receipt)
    }

    /// Run a batch of candidate statements through the reconciliation pipeline and record
    /// the run window.
    ///
    /// # Errors
    /// Returns an error when the open-issue snapshot cannot be read.
    pub fn ingest(&self, request: IngestRequest) -> Result<IngestReport> {
        let items = request.candidates.into_iter().map(IngestItem::from).collect();
        self.record_run(|driver, open_store, now| driver.run(items, open_store, now))
    }

    /// Drain the deferred-candidate queue through the full pipeline.
    ///
    /// # Errors
    /// Returns an error when the queue or open-issue snapshot cannot be read.
    pub fn retry_deferred(&self) -> Result<IngestReport> {
        self.record_run(|driver, open_store, now| driver.retry_deferred(open_store, now))
    }

    fn record_run<R>(&self, run: R) -> Result<IngestReport>
    where
        R: FnOnce(&IngestDriver<'_>, &(dyn Fn() -> RegisterResult<SqliteStore> + Sync), OffsetDateTime) -> RegisterResult<IngestReport>,
    {
        let store = self.open_store()?;
        let started_at = OffsetDateTime::now_utc();
        store.set_app_state(LAST_INGEST_RUN_START, &rfc3339(started_at)?)?;

        let driver = IngestDriver::new(&self.config, self.oracle.as_ref()).with_clock(OffsetDateTime::now_utc);
        let db_path = self.db_path.clone();
        let open_store = move || open_register_store(&db_path);
        let report = run(&driver, &open_store, started_at)?;

        store.set_app_state(LAST_INGEST_RUN_END, &rfc3339(OffsetDateTime::now_utc())?)?;
        Ok(report)
    }

    /// # Errors
    /// Returns storage errors.
    pub fn last_ingest_run(&self) -> Result<IngestRunWindow> {
        let store = self.open_store()?;
        Ok(IngestRunWindow {
            started_at: store.app_state(LAST_INGEST_RUN_START)?,
            finished_at: store.app_state(LAST_INGEST_RUN_END)?,
        })
    }

    /// # Errors
    /// Returns storage errors.
    pub fn list_deferred(&self) -> Result<Vec<DeferredCandidate>> {
        Ok(self.open_store()?.deferred()?)
    }

    /// Pairwise similar open issues. Nothing is merged.
    ///
    /// # Errors
    /// Returns a validation error unless merge detection is enabled with a threshold.
    pub fn suggest_merges(&self) -> Result<Vec<MergeSuggestion>> {
        let store = self.open_store()?;
        let issues = store.list(&IssueFilter::default())?;
        Ok(detect_merge_candidates(
            &issues,
            self.oracle.as_ref(),
            &self.config.matcher,
            &self.config.merge_detection,
        )?)
    }

    /// # Errors
    /// Returns storage errors.
    pub fn agenda(&self, request: &AgendaRequest) -> Result<Vec<AgendaItem>> {
        let store = self.open_store()?;
        let as_of = request.as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let window_days = request.window_days.unwrap_or(self.config.agenda.window_days);
        if window_days == 0 || window_days > MAX_WINDOW_DAYS {
            return Err(RegisterError::Validation(format!("window_days MUST be in 1..={MAX_WINDOW_DAYS}")).into());
        }
        Ok(compose_agenda_from_store(&store, as_of, Duration::days(i64::from(window_days)), &self.config.agenda)?)
    }

    /// Meetings, System revisions and meeting-linked issues between two dates, plus the
    /// most recently updated issues.
    ///
    /// # Errors
    /// Returns a validation error for malformed or inverted dates.
    pub fn activity_report(&self, request: &ActivityReportRequest) -> Result<ActivityReport> {
        let start_date = parse_date(&request.start)?;
        let end_date = parse_date(&request.end)?;
        if end_date < start_date {
            return Err(RegisterError::Validation("report end MUST NOT precede start".to_string()).into());
        }
        let limit = request.limit.unwrap_or(DEFAULT_REPORT_LIMIT);
        let start = start_date.midnight().assume_utc();
        let end = end_date
            .with_hms_micro(23, 59, 59, 999_999)
            .context("failed to compute end of report range")?
            .assume_utc();

        let store = self.open_store()?;
        let meetings = store.meetings_between(start, end)?;

        let mut system_revisions = store
            .revisions_committed_between(start, end)?
            .into_iter()
            .filter(|revision| revision.author == Author::System)
            .collect::<Vec<_>>();
        system_revisions.sort_by(|left, right| {
            right
                .committed_at
                .cmp(&left.committed_at)
                .then_with(|| left.issue_id.cmp(&right.issue_id))
                .then_with(|| right.sequence.cmp(&left.sequence))
        });
        let system_revisions = system_revisions
            .into_iter()
            .take(limit)
            .map(|revision| RevisionActivity {
                issue_id: revision.issue_id,
                sequence: revision.sequence,
                title: revision.snapshot.title,
                change_summary: revision.change_summary,
                changed_fields: revision.changed_fields,
                committed_at: revision.committed_at,
            })
            .collect();

        let meeting_issues = meeting_issue_activity(&store, &meetings, limit)?;

        let recent_issues = store
            .list(&IssueFilter { limit: Some(limit), ..IssueFilter::default() })?
            .into_iter()
            .map(|issue| IssueActivity {
                issue_id: issue.id,
                title: issue.state.title,
                status: issue.state.status,
                updated_at: issue.updated_at,
            })
            .collect();

        Ok(ActivityReport {
            start: format_date(start_date),
            end: format_date(end_date),
            meetings,
            system_revisions,
            meeting_issues,
            recent_issues,
        })
    }

    /// Register a document by path. `Meetings.YYYY-MM-DD` tags register and link the
    /// meetings they name.
    ///
    /// # Errors
    /// Returns validation or storage errors.
    pub fn register_document(&self, draft: DocumentDraft) -> Result<DocumentRegistration> {
        let mut store = self.open_store()?;
        let now = OffsetDateTime::now_utc();
        let tags = draft.meeting_tags();
        let document = store.register_document(draft, now)?;
        let mut meetings = Vec::new();
        for (tag, _) in tags {
            let Some(meeting_draft) = MeetingDraft::from_tag(&tag) else { continue };
            let meeting = store.register_meeting(meeting_draft, now)?;
            store.link_meeting_document(&meeting.source_id, &document.source_id)?;
            meetings.push(meeting);
        }
        tracing::info!(source_id = %document.source_id, meetings = meetings.len(), "registered document");
        Ok(DocumentRegistration { document, meetings })
    }

    /// # Errors
    /// Returns validation or storage errors.
    pub fn register_meeting(&self, draft: MeetingDraft) -> Result<Meeting> {
        Ok(self.open_store()?.register_meeting(draft, OffsetDateTime::now_utc())?)
    }

    /// # Errors
    /// Returns [`RegisterError::NotFound`] when either side is unknown.
    pub fn link_meeting_document(&self, request: &LinkMeetingDocumentRequest) -> Result<MeetingDocumentLink> {
        self.open_store()?.link_meeting_document(&request.meeting_id, &request.document_id)?;
        Ok(MeetingDocumentLink { meeting_id: request.meeting_id.clone(), document_id: request.document_id.clone() })
    }

    /// # Errors
    /// Returns storage errors.
    pub fn list_documents(&self) -> Result<Vec<Document>> {
        Ok(self.open_store()?.documents()?)
    }

    /// # Errors
    /// Returns storage errors.
    pub fn list_meetings(&self) -> Result<Vec<Meeting>> {
        Ok(self.open_store()?.meetings()?)
    }

    /// # Errors
    /// Returns storage errors.
    pub fn meeting_document_links(&self) -> Result<Vec<MeetingDocumentLink>> {
        Ok(self.open_store()?.meeting_document_links()?)
    }
}

fn meeting_issue_activity(
    store: &SqliteStore,
    meetings: &[Meeting],
    limit: usize,
) -> Result<Vec<MeetingIssueActivity>> {
    let links = store.meeting_document_links()?;
    let mut seen = BTreeSet::new();
    for meeting in meetings {
        let mut sources = vec![SourceRef::meeting(meeting.source_id.clone())];
        sources.extend(
            links
                .iter()
                .filter(|link| link.meeting_id == meeting.source_id)
                .map(|link| SourceRef::document(link.document_id.clone())),
        );
        for source in &sources {
            for link in store.evidence_for_source(source)? {
                seen.insert((meeting.scheduled_at, link.issue_id, meeting.source_id.clone()));
            }
        }
    }

    let mut activity = Vec::new();
    for (scheduled_at, issue_id, meeting_id) in seen.into_iter().take(limit) {
        let issue = store.get(issue_id)?;
        activity.push(MeetingIssueActivity {
            meeting_id,
            meeting_date: format_date(scheduled_at.date()),
            issue_id,
            title: issue.state.title,
        });
    }
    Ok(activity)
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format timestamp as RFC3339")
}
