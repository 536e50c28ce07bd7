use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use issue_register_api::{
    load_config, AcceptStepsRequest, ActivityReportRequest, AgendaRequest, EditIssueRequest, IngestRequest,
    IssueRegisterApi, LinkMeetingDocumentRequest, MergeIssuesRequest, ResolvePendingRequest, SplitIssueRequest,
};
use issue_register_core::{
    CandidateStatement, DocumentDraft, EvidenceRequest, EvidenceRole, IssueDraft, IssueEdit, IssueFilter, IssueId,
    IssueStatus, MeetingDraft, PendingMatchId, PendingStatus, SourceKind, SourceRef, Span, SplitPart,
};
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ir")]
#[command(about = "Issue register CLI")]
struct Cli {
    #[arg(long, default_value = "./issue_register.sqlite3")]
    db: PathBuf,

    /// YAML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset. Logs go to stderr.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Issue {
        #[command(subcommand)]
        command: Box<IssueCommand>,
    },
    Source {
        #[command(subcommand)]
        command: SourceCommand,
    },
    Ingest {
        #[command(subcommand)]
        command: IngestCommand,
    },
    Pending {
        #[command(subcommand)]
        command: PendingCommand,
    },
    Agenda(AgendaArgs),
    Report(ReportArgs),
    Merges {
        #[command(subcommand)]
        command: MergesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum IssueCommand {
    Create(IssueCreateArgs),
    List(IssueListArgs),
    Show(IssueIdArg),
    History(IssueIdArg),
    Evidence(IssueIdArg),
    Edit(IssueEditArgs),
    AcceptSteps(IssueRevisionArgs),
    LinkEvidence(LinkEvidenceArgs),
    Merge(MergeArgs),
    Split(SplitArgs),
}

#[derive(Debug, Args)]
struct IssueCreateArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    domain: String,
    #[arg(long, default_value = "")]
    owner: String,
    #[arg(long, value_enum, default_value_t = StatusArg::Open)]
    status: StatusArg,
    #[arg(long, default_value_t = 0.5)]
    confidence: f32,
}

#[derive(Debug, Args)]
struct IssueListArgs {
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct IssueIdArg {
    issue_id: String,
}

#[derive(Debug, Args)]
struct IssueRevisionArgs {
    issue_id: String,
    #[arg(long)]
    base_revision: u32,
}

#[derive(Debug, Args)]
struct IssueEditArgs {
    issue_id: String,
    #[arg(long)]
    base_revision: u32,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    owner: Option<String>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long)]
    confidence: Option<f32>,
    #[arg(long)]
    summary: Option<String>,
}

#[derive(Debug, Args)]
struct LinkEvidenceArgs {
    issue_id: String,
    #[arg(long, value_enum, default_value_t = SourceKindArg::Document)]
    source_kind: SourceKindArg,
    #[arg(long)]
    source_id: String,
    #[arg(long, default_value = "")]
    excerpt: String,
    #[arg(long, value_enum, default_value_t = RoleArg::Supports)]
    role: RoleArg,
    #[arg(long, requires = "span_end")]
    span_start: Option<u32>,
    #[arg(long, requires = "span_start")]
    span_end: Option<u32>,
    #[arg(long, value_parser = parse_rfc3339)]
    observed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[arg(long)]
    survivor: String,
    #[arg(long)]
    absorbed: String,
}

#[derive(Debug, Args)]
struct SplitArgs {
    issue_id: String,
    #[arg(long)]
    base_revision: u32,
    /// JSON array of split parts.
    #[arg(long)]
    parts_file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SourceCommand {
    AddDocument(AddDocumentArgs),
    AddMeeting(AddMeetingArgs),
    Link(LinkMeetingArgs),
    Documents,
    Meetings,
    /// Evidence links citing one source, across every issue.
    Evidence(SourceEvidenceArgs),
}

#[derive(Debug, Args)]
struct SourceEvidenceArgs {
    #[arg(long, value_enum, default_value_t = SourceKindArg::Document)]
    source_kind: SourceKindArg,
    #[arg(long)]
    source_id: String,
}

#[derive(Debug, Args)]
struct AddDocumentArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    path: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// File whose text seeds the stored excerpt.
    #[arg(long)]
    text_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct AddMeetingArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    tag: String,
    #[arg(long, value_parser = parse_rfc3339)]
    at: OffsetDateTime,
}

#[derive(Debug, Args)]
struct LinkMeetingArgs {
    #[arg(long)]
    meeting: String,
    #[arg(long)]
    document: String,
}

#[derive(Debug, Subcommand)]
enum IngestCommand {
    /// Reconcile candidates from a JSON array or NDJSON file.
    Run(IngestRunArgs),
    RetryDeferred,
    Deferred,
    LastRun,
}

#[derive(Debug, Args)]
struct IngestRunArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum PendingCommand {
    List(PendingListArgs),
    Show(PendingShowArgs),
    Confirm(PendingResolveArgs),
    Reject(PendingRejectArgs),
}

#[derive(Debug, Args)]
struct PendingListArgs {
    #[arg(long, value_enum)]
    status: Option<PendingStatusArg>,
}

#[derive(Debug, Args)]
struct PendingShowArgs {
    pending_id: String,
}

#[derive(Debug, Args)]
struct PendingResolveArgs {
    pending_id: String,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
struct PendingRejectArgs {
    pending_id: String,
    #[arg(long)]
    note: Option<String>,
    /// Create a new issue from the rejected candidate.
    #[arg(long, default_value_t = false)]
    promote: bool,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    #[arg(long, value_parser = parse_rfc3339)]
    as_of: Option<OffsetDateTime>,
    #[arg(long)]
    window_days: Option<u32>,
}

#[derive(Debug, Args)]
struct ReportArgs {
    /// Start date (YYYY-MM-DD).
    #[arg(long)]
    start: String,
    /// End date (YYYY-MM-DD).
    #[arg(long)]
    end: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum MergesCommand {
    Suggest,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Open,
    Watching,
    Mitigated,
    Closed,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceKindArg {
    Document,
    Meeting,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Supports,
    Contradicts,
    Updates,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PendingStatusArg {
    Pending,
    Confirmed,
    Rejected,
}

impl From<StatusArg> for IssueStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Open => Self::Open,
            StatusArg::Watching => Self::Watching,
            StatusArg::Mitigated => Self::Mitigated,
            StatusArg::Closed => Self::Closed,
        }
    }
}

impl From<SourceKindArg> for SourceKind {
    fn from(value: SourceKindArg) -> Self {
        match value {
            SourceKindArg::Document => Self::Document,
            SourceKindArg::Meeting => Self::Meeting,
        }
    }
}

impl From<RoleArg> for EvidenceRole {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Supports => Self::Supports,
            RoleArg::Contradicts => Self::Contradicts,
            RoleArg::Updates => Self::Updates,
        }
    }
}

impl From<PendingStatusArg> for PendingStatus {
    fn from(value: PendingStatusArg) -> Self {
        match value {
            PendingStatusArg::Pending => Self::Pending,
            PendingStatusArg::Confirmed => Self::Confirmed,
            PendingStatusArg::Rejected => Self::Rejected,
        }
    }
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| format!("expected an RFC3339 timestamp: {err}"))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert("contract_version".to_string(), Value::String(CLI_CONTRACT_VERSION.to_string()));
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value)?)
}

fn init_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let config = load_config(cli.config.as_deref())?;
    let api = IssueRegisterApi::with_config(cli.db, config);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Issue { command } => run_issue(*command, &api),
        Command::Source { command } => run_source(command, &api),
        Command::Ingest { command } => run_ingest(command, &api),
        Command::Pending { command } => run_pending(command, &api),
        Command::Agenda(args) => {
            emit(&api.agenda(&AgendaRequest { as_of: args.as_of, window_days: args.window_days })?)
        }
        Command::Report(args) => emit(&api.activity_report(&ActivityReportRequest {
            start: args.start,
            end: args.end,
            limit: args.limit,
        })?),
        Command::Merges { command: MergesCommand::Suggest } => emit(&api.suggest_merges()?),
    }
}

fn run_db(command: DbCommand, api: &IssueRegisterApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::Export(args) => {
            let manifest = api.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => emit(&api.import_snapshot(&args.input, args.skip_existing)?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({ "backup_file": args.out }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.input)?;
            emit_json(serde_json::json!({ "restored_from": args.input }))
        }
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_issue(command: IssueCommand, api: &IssueRegisterApi) -> Result<()> {
    match command {
        IssueCommand::Create(args) => emit(&api.create_issue(IssueDraft {
            title: args.title,
            domain: args.domain,
            owner: args.owner,
            status: args.status.into(),
            confidence: args.confidence,
            body: None,
            next_steps: Vec::new(),
        })?),
        IssueCommand::List(args) => emit(&api.list_issues(&IssueFilter {
            status: args.status.map(Into::into),
            domain_contains: args.domain,
            owner_contains: args.owner,
            limit: args.limit,
        })?),
        IssueCommand::Show(args) => emit(&api.get_issue(IssueId::parse(&args.issue_id)?)?),
        IssueCommand::History(args) => emit(&api.issue_revisions(IssueId::parse(&args.issue_id)?)?),
        IssueCommand::Evidence(args) => emit(&api.issue_evidence(IssueId::parse(&args.issue_id)?)?),
        IssueCommand::Edit(args) => {
            let issue_id = IssueId::parse(&args.issue_id)?;
            let request = EditIssueRequest {
                base_revision: args.base_revision,
                edit: IssueEdit {
                    title: args.title,
                    domain: args.domain,
                    owner: args.owner,
                    status: args.status.map(Into::into),
                    confidence: args.confidence,
                    change_summary: args.summary,
                    ..IssueEdit::default()
                },
            };
            emit(&api.edit_issue(issue_id, &request)?)
        }
        IssueCommand::AcceptSteps(args) => emit(&api.accept_suggested_steps(
            IssueId::parse(&args.issue_id)?,
            AcceptStepsRequest { base_revision: args.base_revision },
        )?),
        IssueCommand::LinkEvidence(args) => {
            let span = match (args.span_start, args.span_end) {
                (Some(start), Some(end)) => Some(Span { start, end }),
                _ => None,
            };
            let request = EvidenceRequest {
                source: SourceRef { kind: args.source_kind.into(), id: args.source_id },
                span,
                excerpt: args.excerpt,
                role: args.role.into(),
                observed_at: args.observed_at,
            };
            emit(&api.link_evidence(IssueId::parse(&args.issue_id)?, request)?)
        }
        IssueCommand::Merge(args) => emit(&api.merge_issues(MergeIssuesRequest {
            survivor: IssueId::parse(&args.survivor)?,
            absorbed: IssueId::parse(&args.absorbed)?,
        })?),
        IssueCommand::Split(args) => {
            let raw = fs::read_to_string(&args.parts_file)
                .with_context(|| format!("failed to read parts file {}", args.parts_file.display()))?;
            let parts: Vec<SplitPart> = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse parts file {}", args.parts_file.display()))?;
            let request = SplitIssueRequest { base_revision: args.base_revision, parts };
            emit(&api.split_issue(IssueId::parse(&args.issue_id)?, &request)?)
        }
    }
}

fn run_source(command: SourceCommand, api: &IssueRegisterApi) -> Result<()> {
    match command {
        SourceCommand::AddDocument(args) => {
            let text = match &args.text_file {
                Some(path) => fs::read_to_string(path)
                    .with_context(|| format!("failed to read text file {}", path.display()))?,
                None => String::new(),
            };
            emit(&api.register_document(DocumentDraft { title: args.title, path: args.path, tags: args.tags, text })?)
        }
        SourceCommand::AddMeeting(args) => {
            emit(&api.register_meeting(MeetingDraft { title: args.title, source_tag: args.tag, scheduled_at: args.at })?)
        }
        SourceCommand::Link(args) => emit(&api.link_meeting_document(&LinkMeetingDocumentRequest {
            meeting_id: args.meeting,
            document_id: args.document,
        })?),
        SourceCommand::Documents => emit(&api.list_documents()?),
        SourceCommand::Meetings => emit(&api.list_meetings()?),
        SourceCommand::Evidence(args) => {
            emit(&api.evidence_for_source(&SourceRef { kind: args.source_kind.into(), id: args.source_id })?)
        }
    }
}

fn run_ingest(command: IngestCommand, api: &IssueRegisterApi) -> Result<()> {
    match command {
        IngestCommand::Run(args) => {
            let candidates = read_candidates(&args.file)?;
            emit(&api.ingest(IngestRequest { candidates })?)
        }
        IngestCommand::RetryDeferred => emit(&api.retry_deferred()?),
        IngestCommand::Deferred => emit(&api.list_deferred()?),
        IngestCommand::LastRun => emit(&api.last_ingest_run()?),
    }
}

fn run_pending(command: PendingCommand, api: &IssueRegisterApi) -> Result<()> {
    match command {
        PendingCommand::List(args) => emit(&api.list_pending(args.status.map(Into::into))?),
        PendingCommand::Show(args) => emit(&api.get_pending(PendingMatchId::parse(&args.pending_id)?)?),
        PendingCommand::Confirm(args) => emit(&api.confirm_pending(
            PendingMatchId::parse(&args.pending_id)?,
            ResolvePendingRequest { note: args.note, promote: false },
        )?),
        PendingCommand::Reject(args) => emit(&api.reject_pending(
            PendingMatchId::parse(&args.pending_id)?,
            ResolvePendingRequest { note: args.note, promote: args.promote },
        )?),
    }
}

/// A JSON array of candidates, or one candidate per line.
fn read_candidates(path: &Path) -> Result<Vec<CandidateStatement>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read candidates file {}", path.display()))?;
    if raw.trim_start().starts_with('[') {
        return serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse candidates array in {}", path.display()));
    }
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .map_err(|err| anyhow!("invalid candidate on line {} of {}: {err}", index + 1, path.display()))
        })
        .collect()
}
