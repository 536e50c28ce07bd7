use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::error::RegisterError;
use crate::framework::{IssueBody, ScrBody};

/// Per-issue revision sequence number. Sequence 1 is the creation revision.
pub type RevisionSeq = u32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IssueId(pub Ulid);

impl IssueId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a canonical ULID string into an issue identifier.
    ///
    /// # Errors
    /// Returns [`RegisterError::Validation`] when `raw` is not a valid ULID.
    pub fn parse(raw: &str) -> Result<Self, RegisterError> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|err| RegisterError::Validation(format!("invalid issue id {raw}: {err}")))
    }
}

impl Default for IssueId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for IssueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EvidenceLinkId(pub Ulid);

impl EvidenceLinkId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EvidenceLinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EvidenceLinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PendingMatchId(pub Ulid);

impl PendingMatchId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a canonical ULID string into a pending match identifier.
    ///
    /// # Errors
    /// Returns [`RegisterError::Validation`] when `raw` is not a valid ULID.
    pub fn parse(raw: &str) -> Result<Self, RegisterError> {
        Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
            RegisterError::Validation(format!("invalid pending match id {raw}: {err}"))
        })
    }
}

impl Default for PendingMatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PendingMatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Watching,
    Mitigated,
    Closed,
}

impl IssueStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Watching => "watching",
            Self::Mitigated => "mitigated",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "watching" => Some(Self::Watching),
            "mitigated" => Some(Self::Mitigated),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Issues in these states are eligible for agenda suggestions.
    #[must_use]
    pub fn is_agenda_eligible(self) -> bool {
        matches!(self, Self::Open | Self::Watching)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    System,
    User,
}

impl Author {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Document,
    Meeting,
}

impl SourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Meeting => "meeting",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "document" => Some(Self::Document),
            "meeting" => Some(Self::Meeting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SourceRef {
    pub kind: SourceKind,
    pub id: String,
}

impl SourceRef {
    #[must_use]
    pub fn document(id: impl Into<String>) -> Self {
        Self { kind: SourceKind::Document, id: id.into() }
    }

    #[must_use]
    pub fn meeting(id: impl Into<String>) -> Self {
        Self { kind: SourceKind::Meeting, id: id.into() }
    }
}

impl Display for SourceRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Character offsets into the source text, end exclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceSpan {
    pub source: SourceRef,
    pub span: Option<Span>,
    pub excerpt: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceRole {
    #[default]
    Supports,
    Contradicts,
    Updates,
}

impl EvidenceRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Supports => "supports",
            Self::Contradicts => "contradicts",
            Self::Updates => "updates",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "supports" => Some(Self::Supports),
            "contradicts" => Some(Self::Contradicts),
            "updates" => Some(Self::Updates),
            _ => None,
        }
    }
}

/// Which SCR block a candidate statement speaks to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScrFacet {
    #[default]
    Situation,
    Complication,
    Resolution,
}

impl ScrFacet {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Situation => "situation",
            Self::Complication => "complication",
            Self::Resolution => "resolution",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "situation" => Some(Self::Situation),
            "complication" => Some(Self::Complication),
            "resolution" => Some(Self::Resolution),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Open,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NextStep {
    pub description: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueField {
    Title,
    Domain,
    Owner,
    Status,
    Confidence,
    Body,
    NextSteps,
    SuggestedNextSteps,
}

impl IssueField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Domain => "domain",
            Self::Owner => "owner",
            Self::Status => "status",
            Self::Confidence => "confidence",
            Self::Body => "body",
            Self::NextSteps => "next_steps",
            Self::SuggestedNextSteps => "suggested_next_steps",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "title" => Some(Self::Title),
            "domain" => Some(Self::Domain),
            "owner" => Some(Self::Owner),
            "status" => Some(Self::Status),
            "confidence" => Some(Self::Confidence),
            "body" => Some(Self::Body),
            "next_steps" => Some(Self::NextSteps),
            "suggested_next_steps" => Some(Self::SuggestedNextSteps),
            _ => None,
        }
    }
}

/// The revisable content of an issue. Every revision snapshots one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueState {
    pub title: String,
    pub domain: String,
    #[serde(default)]
    pub owner: String,
    pub status: IssueStatus,
    pub confidence: f32,
    pub body: IssueBody,
    #[serde(default)]
    pub next_steps: Vec<NextStep>,
    #[serde(default)]
    pub suggested_next_steps: Vec<NextStep>,
}

impl IssueState {
    /// A fresh open SCR issue with empty blocks.
    #[must_use]
    pub fn open_scr(title: impl Into<String>, domain: impl Into<String>, confidence: f32) -> Self {
        Self {
            title: title.into(),
            domain: domain.into(),
            owner: String::new(),
            status: IssueStatus::Open,
            confidence,
            body: IssueBody::Scr(ScrBody::default()),
            next_steps: Vec::new(),
            suggested_next_steps: Vec::new(),
        }
    }

    /// Validate one proposed issue state.
    ///
    /// # Errors
    /// Returns [`RegisterError::Validation`] when title, domain, or confidence are invalid.
    pub fn validate(&self) -> Result<(), RegisterError> {
        if self.title.trim().is_empty() {
            return Err(RegisterError::Validation("title MUST be non-empty".to_string()));
        }
        if self.domain.trim().is_empty() {
            return Err(RegisterError::Validation("domain MUST be non-empty".to_string()));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(RegisterError::Validation("confidence MUST be in [0.0, 1.0]".to_string()));
        }
        for step in self.next_steps.iter().chain(&self.suggested_next_steps) {
            if step.description.trim().is_empty() {
                return Err(RegisterError::Validation(
                    "next step description MUST be non-empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Fields whose values differ between `self` and `next`, in declaration order.
    #[must_use]
    pub fn changed_fields(&self, next: &Self) -> Vec<IssueField> {
        let mut fields = Vec::new();
        if self.title != next.title {
            fields.push(IssueField::Title);
        }
        if self.domain != next.domain {
            fields.push(IssueField::Domain);
        }
        if self.owner != next.owner {
            fields.push(IssueField::Owner);
        }
        if self.status != next.status {
            fields.push(IssueField::Status);
        }
        if self.confidence.to_bits() != next.confidence.to_bits() {
            fields.push(IssueField::Confidence);
        }
        if self.body != next.body {
            fields.push(IssueField::Body);
        }
        if self.next_steps != next.next_steps {
            fields.push(IssueField::NextSteps);
        }
        if self.suggested_next_steps != next.suggested_next_steps {
            fields.push(IssueField::SuggestedNextSteps);
        }
        fields
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub id: IssueId,
    pub revision: RevisionSeq,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub state: IssueState,
}

/// Immutable record of one committed change to an issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Revision {
    pub issue_id: IssueId,
    pub sequence: RevisionSeq,
    pub author: Author,
    pub change_summary: String,
    pub rationale: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
    pub previous_snapshot: Option<IssueState>,
    pub snapshot: IssueState,
    #[serde(default)]
    pub changed_fields: Vec<IssueField>,
    pub supersedes: Option<RevisionSeq>,
    #[serde(default)]
    pub cross_references: Vec<IssueId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceLink {
    pub link_id: EvidenceLinkId,
    pub issue_id: IssueId,
    pub source: SourceRef,
    pub span: Option<Span>,
    pub excerpt: String,
    pub role: EvidenceRole,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub recorded_in_revision: Option<RevisionSeq>,
    pub reassigned_from: Option<IssueId>,
}

/// One unconfirmed issue statement produced by the extraction source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateStatement {
    #[serde(default)]
    pub source_kind: SourceKind,
    pub source_id: String,
    pub text: String,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub facet: ScrFacet,
    #[serde(default)]
    pub role: EvidenceRole,
    #[serde(default)]
    pub span: Option<Span>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub observed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub suggested_steps: Vec<NextStep>,
}

impl CandidateStatement {
    /// Minimal candidate carrying only the extraction-source contract fields.
    #[must_use]
    pub fn new(source: SourceRef, text: impl Into<String>, themes: Vec<String>) -> Self {
        Self {
            source_kind: source.kind,
            source_id: source.id,
            text: text.into(),
            themes,
            domain: None,
            title: None,
            facet: ScrFacet::Situation,
            role: EvidenceRole::Supports,
            span: None,
            observed_at: None,
            suggested_steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn source(&self) -> SourceRef {
        SourceRef { kind: self.source_kind, id: self.source_id.clone() }
    }

    /// Explicit domain, falling back to the first non-empty theme.
    #[must_use]
    pub fn domain_signal(&self) -> Option<&str> {
        self.domain
            .as_deref()
            .map(str::trim)
            .filter(|domain| !domain.is_empty())
            .or_else(|| self.themes.iter().map(|theme| theme.trim()).find(|t| !t.is_empty()))
    }

    /// Distinct non-empty themes, case-insensitively deduplicated.
    #[must_use]
    pub fn distinct_theme_count(&self) -> usize {
        let mut seen = std::collections::BTreeSet::new();
        for theme in &self.themes {
            let normalized = theme.trim().to_lowercase();
            if !normalized.is_empty() {
                seen.insert(normalized);
            }
        }
        seen.len()
    }

    /// Title used when this candidate seeds a new issue.
    #[must_use]
    pub fn draft_title(&self) -> String {
        if let Some(title) = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            return title.to_string();
        }
        let first_line = self.text.lines().map(str::trim).find(|line| !line.is_empty());
        let base = first_line.unwrap_or("Untitled issue");
        truncate_chars(base, 96)
    }

    #[must_use]
    pub fn source_span(&self) -> SourceSpan {
        SourceSpan { source: self.source(), span: self.span, excerpt: truncate_chars(&self.text, 800) }
    }

    /// Validate the extraction-source contract fields.
    ///
    /// # Errors
    /// Returns [`RegisterError::Validation`] when the source id or text is empty or the span is inverted.
    pub fn validate(&self) -> Result<(), RegisterError> {
        if self.source_id.trim().is_empty() {
            return Err(RegisterError::Validation("source_id MUST be provided".to_string()));
        }
        if self.text.trim().is_empty() {
            return Err(RegisterError::Validation("candidate text MUST be non-empty".to_string()));
        }
        if let Some(span) = self.span {
            if span.end < span.start {
                return Err(RegisterError::Validation("span end MUST be >= span start".to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl PendingStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMatch {
    pub pending_id: PendingMatchId,
    pub candidate: CandidateStatement,
    pub target_issue_id: IssueId,
    pub target_revision: RevisionSeq,
    pub score: f32,
    pub rationale: String,
    pub status: PendingStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    pub resolution_note: Option<String>,
}

/// A candidate whose oracle call failed; retried by the ingestion driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeferredCandidate {
    pub deferred_id: Ulid,
    pub candidate: CandidateStatement,
    pub attempts: u32,
    pub last_error: String,
    #[serde(with = "time::serde::rfc3339")]
    pub deferred_at: OffsetDateTime,
}

pub(crate) fn truncate_chars(value: &str, max_chars: usize) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().take(max_chars).collect::<String>().trim_end().to_string()
}
