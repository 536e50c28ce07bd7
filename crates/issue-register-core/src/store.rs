use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::error::RegisterResult;
use crate::model::{
    Author, CandidateStatement, DeferredCandidate, EvidenceLink, EvidenceLinkId, EvidenceRole, Issue,
    IssueId, IssueState, IssueStatus, PendingMatch, PendingMatchId, PendingStatus, Revision,
    RevisionSeq, SourceRef, Span,
};
use crate::registry::SourceRegistry;

/// A new issue inside a [`ChangeSet`]. The id is assigned by the caller so other
/// parts of the same change set can reference it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueCreation {
    pub id: IssueId,
    pub state: IssueState,
    pub author: Author,
    pub change_summary: String,
    pub rationale: Option<String>,
    #[serde(default)]
    pub cross_references: Vec<IssueId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedRevision {
    pub issue_id: IssueId,
    pub base_revision: RevisionSeq,
    pub state: IssueState,
    pub author: Author,
    pub change_summary: String,
    pub rationale: Option<String>,
    pub supersedes: Option<RevisionSeq>,
    #[serde(default)]
    pub cross_references: Vec<IssueId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceDraft {
    pub issue_id: IssueId,
    pub source: SourceRef,
    pub span: Option<Span>,
    pub excerpt: String,
    pub role: EvidenceRole,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    pub reassigned_from: Option<IssueId>,
}

impl EvidenceDraft {
    #[must_use]
    pub fn from_candidate(issue_id: IssueId, candidate: &CandidateStatement, fallback_observed: OffsetDateTime) -> Self {
        let span = candidate.source_span();
        Self {
            issue_id,
            source: span.source,
            span: span.span,
            excerpt: span.excerpt,
            role: candidate.role,
            observed_at: candidate.observed_at.unwrap_or(fallback_observed),
            reassigned_from: None,
        }
    }

    /// A new link on `target` re-citing an existing link's evidence.
    #[must_use]
    pub fn reassigned(link: &EvidenceLink, target: IssueId) -> Self {
        Self {
            issue_id: target,
            source: link.source.clone(),
            span: link.span,
            excerpt: link.excerpt.clone(),
            role: link.role,
            observed_at: link.observed_at,
            reassigned_from: Some(link.issue_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingResolution {
    pub pending_id: PendingMatchId,
    pub status: PendingStatus,
    pub note: Option<String>,
}

/// Everything one command commits, applied all-or-nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeSet {
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
    #[serde(default)]
    pub creations: Vec<IssueCreation>,
    #[serde(default)]
    pub revisions: Vec<ProposedRevision>,
    #[serde(default)]
    pub evidence: Vec<EvidenceDraft>,
    #[serde(default)]
    pub pending_resolutions: Vec<PendingResolution>,
}

impl ChangeSet {
    #[must_use]
    pub fn at(committed_at: OffsetDateTime) -> Self {
        Self {
            committed_at,
            creations: Vec::new(),
            revisions: Vec::new(),
            evidence: Vec::new(),
            pending_resolutions: Vec::new(),
        }
    }

    /// Issue ids whose current state the commit must read.
    #[must_use]
    pub fn touched_issue_ids(&self) -> Vec<IssueId> {
        let mut ids = self
            .creations
            .iter()
            .map(|creation| creation.id)
            .chain(self.revisions.iter().map(|revision| revision.issue_id))
            .chain(self.evidence.iter().map(|draft| draft.issue_id))
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitReceipt {
    pub created: Vec<IssueId>,
    pub revisions: Vec<(IssueId, RevisionSeq)>,
    pub evidence: Vec<EvidenceLinkId>,
}

impl CommitReceipt {
    #[must_use]
    pub fn revision_of(&self, issue_id: IssueId) -> Option<RevisionSeq> {
        self.revisions.iter().find(|(id, _)| *id == issue_id).map(|(_, sequence)| *sequence)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueFilter {
    pub status: Option<IssueStatus>,
    pub domain_contains: Option<String>,
    pub owner_contains: Option<String>,
    pub limit: Option<usize>,
}

impl IssueFilter {
    #[must_use]
    pub fn matches(&self, issue: &Issue) -> bool {
        if self.status.is_some_and(|status| status != issue.state.status) {
            return false;
        }
        if let Some(domain) = self.domain_contains.as_deref() {
            if !contains_ignore_case(&issue.state.domain, domain) {
                return false;
            }
        }
        if let Some(owner) = self.owner_contains.as_deref() {
            if !contains_ignore_case(&issue.state.owner, owner) {
                return false;
            }
        }
        true
    }

    /// Sort and truncate a filtered result the same way every backend does.
    pub fn finish(&self, issues: &mut Vec<Issue>) {
        issues.sort_by(compare_recent);
        if let Some(limit) = self.limit {
            issues.truncate(limit);
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.trim().to_lowercase())
}

/// Most recently updated first, then issue id.
#[must_use]
pub fn compare_recent(left: &Issue, right: &Issue) -> Ordering {
    right.updated_at.cmp(&left.updated_at).then_with(|| left.id.cmp(&right.id))
}

/// Durable issue state plus the append-only revision log.
///
/// [`IssueStore::commit`] is the only mutation path.
pub trait IssueStore {
    /// Apply a change set atomically.
    ///
    /// # Errors
    /// `StaleRevision` when a base revision is outdated, `InvalidTransition` for edits to
    /// closed issues, `Validation` for malformed states, `NotFound` for unknown issues.
    fn commit(&mut self, change: ChangeSet) -> RegisterResult<CommitReceipt>;

    /// # Errors
    /// Returns [`crate::RegisterError::NotFound`] for unknown ids.
    fn get(&self, issue_id: IssueId) -> RegisterResult<Issue>;

    /// # Errors
    /// Returns storage errors.
    fn list(&self, filter: &IssueFilter) -> RegisterResult<Vec<Issue>>;

    /// Revisions in sequence order.
    ///
    /// # Errors
    /// Returns [`crate::RegisterError::NotFound`] for unknown ids.
    fn revisions(&self, issue_id: IssueId) -> RegisterResult<Vec<Revision>>;

    /// Single-issue creation.
    ///
    /// # Errors
    /// Same as [`IssueStore::commit`].
    fn create(&mut self, creation: IssueCreation, committed_at: OffsetDateTime) -> RegisterResult<IssueId> {
        let issue_id = creation.id;
        let mut change = ChangeSet::at(committed_at);
        change.creations.push(creation);
        self.commit(change)?;
        Ok(issue_id)
    }

    /// Single-revision commit.
    ///
    /// # Errors
    /// Same as [`IssueStore::commit`].
    fn apply_revision(
        &mut self,
        proposal: ProposedRevision,
        committed_at: OffsetDateTime,
    ) -> RegisterResult<RevisionSeq> {
        let issue_id = proposal.issue_id;
        let mut change = ChangeSet::at(committed_at);
        change.revisions.push(proposal);
        let receipt = self.commit(change)?;
        receipt.revision_of(issue_id).ok_or_else(|| {
            crate::RegisterError::Storage(format!("commit did not report a revision for {issue_id}"))
        })
    }
}

/// Read side of evidence links. Links are only ever appended through [`IssueStore::commit`].
pub trait ProvenanceLedger {
    /// # Errors
    /// Returns storage errors.
    fn evidence_for_issue(&self, issue_id: IssueId) -> RegisterResult<Vec<EvidenceLink>>;

    /// # Errors
    /// Returns storage errors.
    fn evidence_for_source(&self, source: &SourceRef) -> RegisterResult<Vec<EvidenceLink>>;

    /// Links observed in `[start, end]`.
    ///
    /// # Errors
    /// Returns storage errors.
    fn evidence_observed_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> RegisterResult<Vec<EvidenceLink>>;
}

/// Pending matches awaiting confirmation. Resolved records stay readable.
pub trait PendingMatchBook {
    /// # Errors
    /// Returns storage errors.
    fn record_pending(&mut self, pending: PendingMatch) -> RegisterResult<()>;

    /// # Errors
    /// Returns [`crate::RegisterError::NotFound`] for unknown ids.
    fn pending_match(&self, pending_id: PendingMatchId) -> RegisterResult<PendingMatch>;

    /// Oldest first.
    ///
    /// # Errors
    /// Returns storage errors.
    fn list_pending(&self, status: Option<PendingStatus>) -> RegisterResult<Vec<PendingMatch>>;
}

/// Candidates deferred after the oracle was unavailable.
pub trait DeferredQueue {
    /// # Errors
    /// Returns storage errors.
    fn defer(
        &mut self,
        candidate: CandidateStatement,
        error: &str,
        at: OffsetDateTime,
    ) -> RegisterResult<DeferredCandidate>;

    /// Oldest first.
    ///
    /// # Errors
    /// Returns storage errors.
    fn deferred(&self) -> RegisterResult<Vec<DeferredCandidate>>;

    /// # Errors
    /// Returns [`crate::RegisterError::NotFound`] for unknown ids.
    fn record_deferred_failure(&mut self, deferred_id: Ulid, error: &str) -> RegisterResult<()>;

    /// # Errors
    /// Returns [`crate::RegisterError::NotFound`] for unknown ids.
    fn clear_deferred(&mut self, deferred_id: Ulid) -> RegisterResult<()>;
}

/// Everything the reconciler, ingestion driver and agenda composer need from a backend.
pub trait RegisterStore: IssueStore + ProvenanceLedger + PendingMatchBook + DeferredQueue + SourceRegistry {}

impl<T> RegisterStore for T where T: IssueStore + ProvenanceLedger + PendingMatchBook + DeferredQueue + SourceRegistry {}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn issue(id: u128, domain: &str, owner: &str, updated: u64) -> Issue {
        let mut state = IssueState::open_scr("Title", domain, 0.5);
        state.owner = owner.to_string();
        Issue {
            id: IssueId(Ulid::from(id)),
            revision: 1,
            created_at: OffsetDateTime::from(UNIX_EPOCH),
            updated_at: OffsetDateTime::from(UNIX_EPOCH + Duration::from_secs(updated)),
            state,
        }
    }

    #[test]
    fn filter_matches_substrings_case_insensitively() {
        let filter = IssueFilter {
            domain_contains: Some("chain".to_string()),
            owner_contains: Some("DANA".to_string()),
            ..IssueFilter::default()
        };
        assert!(filter.matches(&issue(1, "Supply Chain", "dana.k", 1)));
        assert!(!filter.matches(&issue(2, "Finance", "dana.k", 1)));
        assert!(!filter.matches(&issue(3, "Supply Chain", "lee", 1)));
    }

    #[test]
    fn finish_orders_by_recency_then_id_and_truncates() {
        let filter = IssueFilter { limit: Some(2), ..IssueFilter::default() };
        let mut issues = vec![issue(3, "a", "", 5), issue(1, "a", "", 9), issue(2, "a", "", 9)];
        filter.finish(&mut issues);
        let ids = issues.iter().map(|issue| issue.id.0).collect::<Vec<_>>();
        assert_eq!(ids, vec![Ulid::from(1), Ulid::from(2)]);
    }
}
