use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::classifier::{new_issue_confidence, Decision};
use crate::config::ClassifierConfig;
use crate::error::{RegisterError, RegisterResult};
use crate::framework::{normalize, EntrySelector, IssueBody, MergeEffect};
use crate::model::{
    Author, CandidateStatement, EvidenceLinkId, EvidenceRole, IssueField, IssueId, IssueState,
    IssueStatus, NextStep, PendingMatch, PendingMatchId, PendingStatus, RevisionSeq, SourceRef, Span,
};
use crate::revision::superseded_system_revision;
use crate::store::{
    ChangeSet, EvidenceDraft, IssueCreation, PendingResolution, ProposedRevision, RegisterStore,
};

/// Domain assigned to new issues whose candidate carries no domain or theme.
pub const UNCATEGORIZED_DOMAIN: &str = "Uncategorized";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Evidence merged through a new revision.
    Revised { revision: RevisionSeq },
    /// The exact evidence span was already merged; nothing committed.
    AlreadyRecorded { revision: RevisionSeq },
    PendingCreated { pending_id: PendingMatchId },
    Created,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileResult {
    pub issue_id: IssueId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Field-level edit submitted by a user. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IssueEdit {
    pub title: Option<String>,
    pub domain: Option<String>,
    pub owner: Option<String>,
    pub status: Option<IssueStatus>,
    pub confidence: Option<f32>,
    pub body: Option<IssueBody>,
    pub next_steps: Option<Vec<NextStep>>,
    pub suggested_next_steps: Option<Vec<NextStep>>,
    pub change_summary: Option<String>,
}

impl IssueEdit {
    #[must_use]
    pub fn apply_to(&self, state: &IssueState) -> IssueState {
        let mut next = state.clone();
        if let Some(title) = &self.title {
            next.title.clone_from(title);
        }
        if let Some(domain) = &self.domain {
            next.domain.clone_from(domain);
        }
        if let Some(owner) = &self.owner {
            next.owner.clone_from(owner);
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(confidence) = self.confidence {
            next.confidence = confidence;
        }
        if let Some(body) = &self.body {
            next.body = body.clone();
        }
        if let Some(steps) = &self.next_steps {
            next.next_steps.clone_from(steps);
        }
        if let Some(steps) = &self.suggested_next_steps {
            next.suggested_next_steps.clone_from(steps);
        }
        next
    }
}

/// A manually drafted issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueDraft {
    pub title: String,
    pub domain: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default = "default_draft_status")]
    pub status: IssueStatus,
    pub confidence: f32,
    #[serde(default)]
    pub body: Option<IssueBody>,
    #[serde(default)]
    pub next_steps: Vec<NextStep>,
}

fn default_draft_status() -> IssueStatus {
    IssueStatus::Open
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitPart {
    pub title: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub entries: Vec<EntrySelector>,
    #[serde(default)]
    pub evidence: Vec<EvidenceLinkId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeReceipt {
    pub survivor: IssueId,
    pub absorbed: IssueId,
    pub survivor_revision: RevisionSeq,
    pub absorbed_revision: RevisionSeq,
    pub reassigned_evidence: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitReceipt {
    pub source: IssueId,
    pub source_revision: RevisionSeq,
    pub created: Vec<IssueId>,
    pub reassigned_evidence: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectReceipt {
    pub pending_id: PendingMatchId,
    pub promoted: Option<IssueId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceRequest {
    pub source: SourceRef,
    #[serde(default)]
    pub span: Option<Span>,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub role: EvidenceRole,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub observed_at: Option<OffsetDateTime>,
}

/// Confidence after one more piece of evidence at similarity `score`.
#[must_use]
pub fn reevaluate_confidence(current: f32, score: f32, role: EvidenceRole, reinforcement: f32) -> f32 {
    let step = (score * reinforcement).clamp(0.0, 1.0);
    let next = match role {
        EvidenceRole::Supports => current + (1.0 - current) * step,
        EvidenceRole::Contradicts => current - current * step,
        EvidenceRole::Updates => current,
    };
    next.clamp(0.0, 1.0)
}

/// Applies classification outcomes and user commands, always through the store's commit path.
#[derive(Debug, Clone)]
pub struct Reconciler {
    config: ClassifierConfig,
}

impl Reconciler {
    #[must_use]
    pub fn new(config: &ClassifierConfig) -> Self {
        Self { config: config.clone() }
    }

    /// Apply a classifier decision for `candidate`.
    ///
    /// # Errors
    /// Propagates store errors; `StaleRevision` on an ExistingMatch means the caller must re-derive.
    pub fn reconcile<S: RegisterStore + ?Sized>(
        &self,
        store: &mut S,
        decision: &Decision,
        candidate: &CandidateStatement,
        now: OffsetDateTime,
    ) -> RegisterResult<ReconcileResult> {
        candidate.validate()?;
        match decision {
            Decision::ExistingMatch { issue_id, confidence, rationale } => {
                self.apply_existing_match(store, *issue_id, candidate, *confidence, rationale, now)
            }
            Decision::PossibleMatch { issue_id, confidence, rationale } => {
                let target = store.get(*issue_id)?;
                if let Some(existing) = find_open_pending(store, *issue_id, candidate)? {
                    tracing::debug!(%issue_id, pending_id = %existing, "candidate already awaits review");
                    return Ok(ReconcileResult {
                        issue_id: *issue_id,
                        outcome: Outcome::PendingCreated { pending_id: existing },
                    });
                }
                let pending = PendingMatch {
                    pending_id: PendingMatchId::new(),
                    candidate: candidate.clone(),
                    target_issue_id: *issue_id,
                    target_revision: target.revision,
                    score: *confidence,
                    rationale: rationale.clone(),
                    status: PendingStatus::Pending,
                    created_at: now,
                    resolved_at: None,
                    resolution_note: None,
                };
                let pending_id = pending.pending_id;
                store.record_pending(pending)?;
                tracing::info!(%issue_id, %pending_id, "recorded pending match");
                Ok(ReconcileResult { issue_id: *issue_id, outcome: Outcome::PendingCreated { pending_id } })
            }
            Decision::NewIssue { confidence, rationale } => {
                let creation = new_issue_from_candidate(candidate, *confidence, Author::System, Some(rationale.clone()));
                let issue_id = creation.id;
                let mut change = ChangeSet::at(now);
                change.evidence.push(EvidenceDraft::from_candidate(issue_id, candidate, now));
                change.creations.push(creation);
                store.commit(change)?;
                tracing::info!(%issue_id, source = %candidate.source(), "created issue from candidate");
                Ok(ReconcileResult { issue_id, outcome: Outcome::Created })
            }
        }
    }

    /// Merge a candidate's evidence into the current state of `issue_id` as a System revision.
    ///
    /// Re-reads the issue, so calling it again after `StaleRevision` re-derives the proposal.
    ///
    /// # Errors
    /// `StaleRevision` on a concurrent commit, `InvalidTransition` when the issue is closed.
    pub fn apply_existing_match<S: RegisterStore + ?Sized>(
        &self,
        store: &mut S,
        issue_id: IssueId,
        candidate: &CandidateStatement,
        score: f32,
        rationale: &str,
        now: OffsetDateTime,
    ) -> RegisterResult<ReconcileResult> {
        let issue = store.get(issue_id)?;
        if issue.state.status == IssueStatus::Closed {
            return Err(RegisterError::InvalidTransition {
                from: IssueStatus::Closed,
                to: IssueStatus::Closed,
                reason: format!("issue {issue_id} was closed; evidence is not merged into closed issues"),
            });
        }
        let Some(proposal) =
            self.evidence_proposal(&issue.state, issue.revision, issue_id, candidate, score, Author::System, rationale)
        else {
            return Ok(ReconcileResult { issue_id, outcome: Outcome::AlreadyRecorded { revision: issue.revision } });
        };
        let mut change = ChangeSet::at(now);
        change.revisions.push(proposal);
        change.evidence.push(EvidenceDraft::from_candidate(issue_id, candidate, now));
        let receipt = store.commit(change)?;
        let revision = receipt.revision_of(issue_id).unwrap_or(issue.revision + 1);
        tracing::info!(%issue_id, revision, score, "merged candidate evidence");
        Ok(ReconcileResult { issue_id, outcome: Outcome::Revised { revision } })
    }

    #[allow(clippy::too_many_arguments)]
    fn evidence_proposal(
        &self,
        state: &IssueState,
        base_revision: RevisionSeq,
        issue_id: IssueId,
        candidate: &CandidateStatement,
        score: f32,
        author: Author,
        rationale: &str,
    ) -> Option<ProposedRevision> {
        let mut next = state.clone();
        let effect = next.body.merge_evidence(candidate);
        if effect == MergeEffect::AlreadyCited {
            return None;
        }
        next.confidence =
            reevaluate_confidence(state.confidence, score, candidate.role, self.config.reinforcement);
        for step in &candidate.suggested_steps {
            push_distinct_step(&mut next.suggested_next_steps, &next.next_steps, step);
        }
        let verb = match effect {
            MergeEffect::Appended => "Added",
            MergeEffect::Corroborated | MergeEffect::AlreadyCited => "Corroborated",
        };
        Some(ProposedRevision {
            issue_id,
            base_revision,
            state: next,
            author,
            change_summary: format!(
                "{verb} {} evidence from {} ({})",
                candidate.facet.as_str(),
                candidate.source(),
                candidate.role.as_str()
            ),
            rationale: Some(rationale.to_string()),
            supersedes: None,
            cross_references: Vec::new(),
        })
    }

    /// Accept a pending match: the candidate's evidence becomes a revision on the target.
    ///
    /// # Errors
    /// `NotFound` for unknown ids, `Validation` when already resolved, `InvalidTransition`
    /// when the target was closed meanwhile, `StaleRevision` on a concurrent commit.
    pub fn confirm_match<S: RegisterStore + ?Sized>(
        &self,
        store: &mut S,
        pending_id: PendingMatchId,
        note: Option<String>,
        now: OffsetDateTime,
    ) -> RegisterResult<ReconcileResult> {
        let pending = open_pending(store, pending_id)?;
        let issue = store.get(pending.target_issue_id)?;
        if issue.state.status == IssueStatus::Closed {
            return Err(RegisterError::InvalidTransition {
                from: IssueStatus::Closed,
                to: IssueStatus::Closed,
                reason: format!(
                    "issue {} was closed after pending match {pending_id} was proposed; reopen it first",
                    issue.id
                ),
            });
        }
        let rationale = format!("confirmed pending match {pending_id}: {}", pending.rationale);
        let proposal = self.evidence_proposal(
            &issue.state,
            issue.revision,
            issue.id,
            &pending.candidate,
            pending.score,
            Author::User,
            &rationale,
        );
        let mut change = ChangeSet::at(now);
        let has_revision = proposal.is_some();
        if let Some(proposal) = proposal {
            change.revisions.push(proposal);
            change.evidence.push(EvidenceDraft::from_candidate(issue.id, &pending.candidate, now));
        }
        change.pending_resolutions.push(PendingResolution {
            pending_id,
            status: PendingStatus::Confirmed,
            note,
        });
        let receipt = store.commit(change)?;
        tracing::info!(%pending_id, issue_id = %issue.id, "confirmed pending match");
        let outcome = match receipt.revision_of(issue.id) {
            Some(revision) if has_revision => Outcome::Revised { revision },
            _ => Outcome::AlreadyRecorded { revision: issue.revision },
        };
        Ok(ReconcileResult { issue_id: issue.id, outcome })
    }

    /// Reject a pending match, optionally promoting its candidate to a new issue.
    ///
    /// # Errors
    /// `NotFound` for unknown ids, `Validation` when already resolved.
    pub fn reject_match<S: RegisterStore + ?Sized>(
        &self,
        store: &mut S,
        pending_id: PendingMatchId,
        promote: bool,
        note: Option<String>,
        now: OffsetDateTime,
    ) -> RegisterResult<RejectReceipt> {
        let pending = open_pending(store, pending_id)?;
        let mut change = ChangeSet::at(now);
        change.pending_resolutions.push(PendingResolution { pending_id, status: PendingStatus::Rejected, note });
        let promoted = if promote {
            let confidence = new_issue_confidence(&pending.candidate, &self.config.new_issue);
            let mut creation = new_issue_from_candidate(&pending.candidate, confidence, Author::User, None);
            creation.change_summary = format!("Promoted rejected pending match {pending_id}");
            let issue_id = creation.id;
            change.evidence.push(EvidenceDraft::from_candidate(issue_id, &pending.candidate, now));
            change.creations.push(creation);
            Some(issue_id)
        } else {
            None
        };
        store.commit(change)?;
        tracing::info!(%pending_id, promoted = ?promoted, "rejected pending match");
        Ok(RejectReceipt { pending_id, promoted })
    }

    /// Apply a user edit as a User revision against `base_revision`.
    ///
    /// # Errors
    /// `StaleRevision` when `base_revision` is outdated, `InvalidTransition` for closed issues.
    pub fn edit_issue<S: RegisterStore + ?Sized>(
        &self,
        store: &mut S,
        issue_id: IssueId,
        base_revision: RevisionSeq,
        edit: &IssueEdit,
        now: OffsetDateTime,
    ) -> RegisterResult<RevisionSeq> {
        let issue = store.get(issue_id)?;
        let next = edit.apply_to(&issue.state);
        let changed = issue.state.changed_fields(&next);
        let history = store.revisions(issue_id)?;
        let summary = edit.change_summary.clone().unwrap_or_else(|| describe_fields("Edited", &changed));
        let proposal = ProposedRevision {
            issue_id,
            base_revision,
            state: next,
            author: Author::User,
            change_summary: summary,
            rationale: None,
            supersedes: superseded_system_revision(&history, &changed),
            cross_references: Vec::new(),
        };
        let revision = store.apply_revision(proposal, now)?;
        tracing::info!(%issue_id, revision, "applied user edit");
        Ok(revision)
    }

    /// Move System-suggested next steps into the issue's next steps.
    ///
    /// # Errors
    /// `Validation` when nothing is suggested, plus the errors of [`Reconciler::edit_issue`].
    pub fn accept_suggested_steps<S: RegisterStore + ?Sized>(
        &self,
        store: &mut S,
        issue_id: IssueId,
        base_revision: RevisionSeq,
        now: OffsetDateTime,
    ) -> RegisterResult<RevisionSeq> {
        let issue = store.get(issue_id)?;
        if issue.state.suggested_next_steps.is_empty() {
            return Err(RegisterError::Validation(format!("issue {issue_id} has no suggested next steps")));
        }
        let mut next_steps = issue.state.next_steps.clone();
        for step in &issue.state.suggested_next_steps {
            push_distinct_step(&mut next_steps, &[], step);
        }
        let edit = IssueEdit {
            next_steps: Some(next_steps),
            suggested_next_steps: Some(Vec::new()),
            change_summary: Some(format!(
                "Accepted {} suggested next step(s)",
                issue.state.suggested_next_steps.len()
            )),
            ..IssueEdit::default()
        };
        self.edit_issue(store, issue_id, base_revision, &edit, now)
    }

    /// Merge `absorbed` into `survivor`: paired User revisions plus re-linked evidence.
    ///
    /// # Errors
    /// `Validation` for a self-merge, `InvalidTransition` when either issue is closed.
    pub fn merge_issues<S: RegisterStore + ?Sized>(
        &self,
        store: &mut S,
        survivor: IssueId,
        absorbed: IssueId,
        now: OffsetDateTime,
    ) -> RegisterResult<MergeReceipt> {
        if survivor == absorbed {
            return Err(RegisterError::Validation("an issue MUST NOT be merged into itself".to_string()));
        }
        let keep = store.get(survivor)?;
        let gone = store.get(absorbed)?;
        for issue in [&keep, &gone] {
            if issue.state.status == IssueStatus::Closed {
                return Err(RegisterError::InvalidTransition {
                    from: IssueStatus::Closed,
                    to: IssueStatus::Closed,
                    reason: format!("issue {} is closed and cannot take part in a merge", issue.id),
                });
            }
        }
        let links = store.evidence_for_issue(absorbed)?;

        let mut survivor_state = keep.state.clone();
        survivor_state.body.absorb_body(&gone.state.body)?;
        for step in &gone.state.next_steps {
            push_distinct_step(&mut survivor_state.next_steps, &[], step);
        }
        for step in &gone.state.suggested_next_steps {
            push_distinct_step(&mut survivor_state.suggested_next_steps, &survivor_state.next_steps, step);
        }
        let mut absorbed_state = gone.state.clone();
        absorbed_state.status = IssueStatus::Closed;

        let mut change = ChangeSet::at(now);
        change.revisions.push(ProposedRevision {
            issue_id: survivor,
            base_revision: keep.revision,
            state: survivor_state,
            author: Author::User,
            change_summary: format!("Absorbed issue {absorbed}"),
            rationale: None,
            supersedes: None,
            cross_references: vec![absorbed],
        });
        change.revisions.push(ProposedRevision {
            issue_id: absorbed,
            base_revision: gone.revision,
            state: absorbed_state,
            author: Author::User,
            change_summary: format!("Merged into issue {survivor}"),
            rationale: None,
            supersedes: None,
            cross_references: vec![survivor],
        });
        change.evidence.extend(links.iter().map(|link| EvidenceDraft::reassigned(link, survivor)));

        let receipt = store.commit(change)?;
        let merge = MergeReceipt {
            survivor,
            absorbed,
            survivor_revision: receipt.revision_of(survivor).unwrap_or(keep.revision + 1),
            absorbed_revision: receipt.revision_of(absorbed).unwrap_or(gone.revision + 1),
            reassigned_evidence: links.len(),
        };
        tracing::info!(%survivor, %absorbed, reassigned = merge.reassigned_evidence, "merged issues");
        Ok(merge)
    }

    /// Split selected body entries and evidence of `source` into new issues.
    ///
    /// # Errors
    /// `Validation` for empty or overlapping parts and foreign evidence ids, `StaleRevision`
    /// when `base_revision` is outdated, `InvalidTransition` when the source is closed.
    pub fn split_issue<S: RegisterStore + ?Sized>(
        &self,
        store: &mut S,
        source: IssueId,
        base_revision: RevisionSeq,
        parts: &[SplitPart],
        now: OffsetDateTime,
    ) -> RegisterResult<SplitReceipt> {
        if parts.is_empty() {
            return Err(RegisterError::Validation("split MUST name at least one part".to_string()));
        }
        let issue = store.get(source)?;
        let links = store
            .evidence_for_issue(source)?
            .into_iter()
            .map(|link| (link.link_id, link))
            .collect::<BTreeMap<_, _>>();

        let mut all_selectors = Vec::new();
        let mut claimed_links = BTreeSet::new();
        for part in parts {
            all_selectors.extend_from_slice(&part.entries);
            for link_id in &part.evidence {
                if !links.contains_key(link_id) {
                    return Err(RegisterError::Validation(format!(
                        "evidence link {link_id} does not belong to issue {source}"
                    )));
                }
                if !claimed_links.insert(*link_id) {
                    return Err(RegisterError::Validation(format!(
                        "evidence link {link_id} MUST be assigned to one part"
                    )));
                }
            }
        }
        let mut remaining = issue.state.body.clone();
        remaining.take_entries(&all_selectors)?;

        let mut change = ChangeSet::at(now);
        let mut created = Vec::with_capacity(parts.len());
        for part in parts {
            let body = issue.state.body.clone().take_entries(&part.entries)?;
            let id = IssueId::new();
            let state = IssueState {
                title: part.title.clone(),
                domain: part.domain.clone().unwrap_or_else(|| issue.state.domain.clone()),
                owner: part.owner.clone().unwrap_or_else(|| issue.state.owner.clone()),
                status: IssueStatus::Open,
                confidence: issue.state.confidence,
                body,
                next_steps: Vec::new(),
                suggested_next_steps: Vec::new(),
            };
            change.creations.push(IssueCreation {
                id,
                state,
                author: Author::User,
                change_summary: format!("Split from issue {source}"),
                rationale: None,
                cross_references: vec![source],
            });
            change.evidence.extend(
                part.evidence.iter().filter_map(|link_id| links.get(link_id)).map(|link| EvidenceDraft::reassigned(link, id)),
            );
            created.push(id);
        }

        let mut source_state = issue.state.clone();
        source_state.body = remaining;
        change.revisions.push(ProposedRevision {
            issue_id: source,
            base_revision,
            state: source_state,
            author: Author::User,
            change_summary: format!("Split into {} issue(s)", created.len()),
            rationale: None,
            supersedes: None,
            cross_references: created.clone(),
        });

        let receipt = store.commit(change)?;
        let split = SplitReceipt {
            source,
            source_revision: receipt.revision_of(source).unwrap_or(base_revision + 1),
            created,
            reassigned_evidence: claimed_links.len(),
        };
        tracing::info!(%source, parts = split.created.len(), "split issue");
        Ok(split)
    }

    /// Create an issue drafted by a user.
    ///
    /// # Errors
    /// `Validation` for malformed drafts.
    pub fn create_issue<S: RegisterStore + ?Sized>(
        &self,
        store: &mut S,
        draft: IssueDraft,
        now: OffsetDateTime,
    ) -> RegisterResult<IssueId> {
        let state = IssueState {
            title: draft.title,
            domain: draft.domain,
            owner: draft.owner,
            status: draft.status,
            confidence: draft.confidence,
            body: draft.body.unwrap_or_else(|| IssueBody::Scr(crate::framework::ScrBody::default())),
            next_steps: draft.next_steps,
            suggested_next_steps: Vec::new(),
        };
        let creation = IssueCreation {
            id: IssueId::new(),
            state,
            author: Author::User,
            change_summary: "Created manually".to_string(),
            rationale: None,
            cross_references: Vec::new(),
        };
        let issue_id = store.create(creation, now)?;
        tracing::info!(%issue_id, "created issue manually");
        Ok(issue_id)
    }

    /// Record user-supplied evidence on an issue without revising it.
    ///
    /// # Errors
    /// `NotFound` for unknown issues, `Validation` for an empty source id.
    pub fn link_evidence<S: RegisterStore + ?Sized>(
        &self,
        store: &mut S,
        issue_id: IssueId,
        request: EvidenceRequest,
        now: OffsetDateTime,
    ) -> RegisterResult<EvidenceLinkId> {
        store.get(issue_id)?;
        let mut change = ChangeSet::at(now);
        change.evidence.push(EvidenceDraft {
            issue_id,
            source: request.source,
            span: request.span,
            excerpt: request.excerpt,
            role: request.role,
            observed_at: request.observed_at.unwrap_or(now),
            reassigned_from: None,
        });
        let receipt = store.commit(change)?;
        receipt
            .evidence
            .first()
            .copied()
            .ok_or_else(|| RegisterError::Storage("commit did not report the evidence link".to_string()))
    }
}

fn open_pending<S: RegisterStore + ?Sized>(store: &S, pending_id: PendingMatchId) -> RegisterResult<PendingMatch> {
    let pending = store.pending_match(pending_id)?;
    if pending.status != PendingStatus::Pending {
        return Err(RegisterError::Validation(format!(
            "pending match {pending_id} is already {}",
            pending.status.as_str()
        )));
    }
    Ok(pending)
}

/// An unresolved pending match proposing the same statement for `issue_id`.
fn find_open_pending<S: RegisterStore + ?Sized>(
    store: &S,
    issue_id: IssueId,
    candidate: &CandidateStatement,
) -> RegisterResult<Option<PendingMatchId>> {
    let text = normalize(&candidate.text);
    Ok(store
        .list_pending(Some(PendingStatus::Pending))?
        .into_iter()
        .find(|pending| {
            pending.target_issue_id == issue_id
                && pending.candidate.source() == candidate.source()
                && pending.candidate.span == candidate.span
                && normalize(&pending.candidate.text) == text
        })
        .map(|pending| pending.pending_id))
}

fn new_issue_from_candidate(
    candidate: &CandidateStatement,
    confidence: f32,
    author: Author,
    rationale: Option<String>,
) -> IssueCreation {
    let domain = candidate.domain_signal().unwrap_or(UNCATEGORIZED_DOMAIN).to_string();
    let mut state = IssueState::open_scr(candidate.draft_title(), domain, confidence);
    state.body = IssueBody::seeded_scr(candidate);
    for step in &candidate.suggested_steps {
        push_distinct_step(&mut state.suggested_next_steps, &[], step);
    }
    IssueCreation {
        id: IssueId::new(),
        state,
        author,
        change_summary: format!("Created from {}", candidate.source()),
        rationale,
        cross_references: Vec::new(),
    }
}

fn push_distinct_step(target: &mut Vec<NextStep>, also_check: &[NextStep], step: &NextStep) {
    let key = step.description.trim().to_lowercase();
    if key.is_empty() {
        return;
    }
    let exists = target
        .iter()
        .chain(also_check)
        .any(|existing| existing.description.trim().to_lowercase() == key);
    if !exists {
        target.push(step.clone());
    }
}

fn describe_fields(prefix: &str, fields: &[IssueField]) -> String {
    if fields.is_empty() {
        return format!("{prefix} nothing");
    }
    let names = fields.iter().map(|field| field.as_str()).collect::<Vec<_>>();
    format!("{prefix} {}", names.join(", "))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::classifier::classify;
    use crate::config::MatcherConfig;
    use crate::framework::ScrBody;
    use crate::matcher::rank;
    use crate::memory::MemoryStore;
    use crate::model::{Issue, ScrFacet, StepStatus};
    use crate::oracle::testing::StubOracle;
    use crate::store::{IssueFilter, IssueStore, PendingMatchBook, ProvenanceLedger};

    fn fixture_time(offset: u64) -> OffsetDateTime {
        OffsetDateTime::from(UNIX_EPOCH + Duration::from_secs(1_700_000_000 + offset))
    }

    fn semantic_only() -> MatcherConfig {
        MatcherConfig { semantic_weight: 1.0, domain_weight: 0.0, hierarchy_credit: 0.5 }
    }

    fn seed_issue(store: &mut MemoryStore, reconciler: &Reconciler, title: &str, confidence: f32) -> RegisterResult<IssueId> {
        let mut seed = CandidateStatement::new(SourceRef::document("seed-doc"), title, vec!["Supply Chain".to_string()]);
        seed.title = Some(title.to_string());
        let result = reconciler.reconcile(
            store,
            &Decision::NewIssue { confidence, rationale: "seed".to_string() },
            &seed,
            fixture_time(0),
        )?;
        Ok(result.issue_id)
    }

    fn open_issues(store: &MemoryStore) -> RegisterResult<Vec<Issue>> {
        store.list(&IssueFilter::default())
    }

    #[test]
    fn existing_match_appends_revision_reevaluates_confidence_and_links_evidence() -> RegisterResult<()> {
        let config = ClassifierConfig::default();
        let reconciler = Reconciler::new(&config);
        let mut store = MemoryStore::new();
        let vendor = seed_issue(&mut store, &reconciler, "Vendor X delivery risk", 0.6)?;

        let candidate = CandidateStatement::new(
            SourceRef::meeting("mtg-2023-11-14"),
            "Vendor X confirmed another two-week slip on the controller boards",
            vec!["Supply Chain".to_string()],
        );
        let oracle = StubOracle::with(&[("Vendor X delivery risk", 0.92)]);
        let ranked = rank(&candidate, &open_issues(&store)?, &oracle, &semantic_only())?;
        let decision = classify(&candidate, &ranked, &config);
        assert_eq!(decision.kind(), "existing_match");

        let result = reconciler.reconcile(&mut store, &decision, &candidate, fixture_time(60))?;
        assert_eq!(result, ReconcileResult { issue_id: vendor, outcome: Outcome::Revised { revision: 2 } });

        let issue = store.get(vendor)?;
        let expected = 0.6 + 0.4 * 0.92 * config.reinforcement;
        assert!((issue.state.confidence - expected).abs() < 1e-6);
        assert_eq!(issue.updated_at, fixture_time(60));

        let revisions = store.revisions(vendor)?;
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[1].author, Author::System);
        assert!(revisions[1].rationale.as_deref().is_some_and(|r| r.contains("meets t_high")));

        let evidence = store.evidence_for_issue(vendor)?;
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[1].source, SourceRef::meeting("mtg-2023-11-14"));
        assert_eq!(evidence[1].recorded_in_revision, Some(2));
        Ok(())
    }

    #[test]
    fn reprocessing_the_same_candidate_commits_nothing_new() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let id = seed_issue(&mut store, &reconciler, "Vendor X delivery risk", 0.6)?;
        let candidate = CandidateStatement::new(SourceRef::document("doc-2"), "Vendor X slipped", vec![]);
        let decision = Decision::ExistingMatch { issue_id: id, confidence: 0.9, rationale: "match".to_string() };

        reconciler.reconcile(&mut store, &decision, &candidate, fixture_time(10))?;
        let again = reconciler.reconcile(&mut store, &decision, &candidate, fixture_time(20))?;
        assert_eq!(again.outcome, Outcome::AlreadyRecorded { revision: 2 });
        assert_eq!(store.revisions(id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn late_writer_cannot_rewind_issue_timestamps() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let id = seed_issue(&mut store, &reconciler, "Vendor X delivery risk", 0.6)?;
        let edit = IssueEdit { owner: Some("dana".to_string()), ..IssueEdit::default() };
        reconciler.edit_issue(&mut store, id, 1, &edit, fixture_time(200))?;

        let candidate = CandidateStatement::new(SourceRef::document("doc-5"), "Vendor X slipped again", vec![]);
        let decision = Decision::ExistingMatch { issue_id: id, confidence: 0.9, rationale: "match".to_string() };
        let result = reconciler.reconcile(&mut store, &decision, &candidate, fixture_time(100))?;
        assert_eq!(result.outcome, Outcome::Revised { revision: 3 });

        let issue = store.get(id)?;
        assert_eq!(issue.updated_at, fixture_time(200));
        let revisions = store.revisions(id)?;
        assert!(revisions.windows(2).all(|pair| pair[0].committed_at <= pair[1].committed_at));
        assert_eq!(crate::revision::replay(&revisions)?, issue.state);
        Ok(())
    }

    #[test]
    fn reprocessing_a_possible_match_reuses_the_open_pending_match() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let id = seed_issue(&mut store, &reconciler, "Vendor X delivery risk", 0.6)?;
        let candidate = CandidateStatement::new(SourceRef::document("doc-3"), "Supplier lead times are growing", vec![]);
        let decision = Decision::PossibleMatch { issue_id: id, confidence: 0.55, rationale: "similar".to_string() };

        let first = reconciler.reconcile(&mut store, &decision, &candidate, fixture_time(30))?;
        let mut reworded = candidate.clone();
        reworded.text = "  supplier LEAD times   are growing ".to_string();
        let second = reconciler.reconcile(&mut store, &decision, &reworded, fixture_time(40))?;
        assert_eq!(first, second);
        assert_eq!(store.list_pending(None)?.len(), 1);

        let other_source = CandidateStatement::new(SourceRef::document("doc-4"), "Supplier lead times are growing", vec![]);
        let third = reconciler.reconcile(&mut store, &decision, &other_source, fixture_time(50))?;
        assert_ne!(third, first);
        assert_eq!(store.list_pending(Some(PendingStatus::Pending))?.len(), 2);

        let Outcome::PendingCreated { pending_id } = first.outcome else {
            panic!("expected pending match, got {:?}", first.outcome);
        };
        reconciler.reject_match(&mut store, pending_id, false, None, fixture_time(60))?;
        let after_rejection = reconciler.reconcile(&mut store, &decision, &candidate, fixture_time(70))?;
        assert_ne!(after_rejection, first);
        assert_eq!(store.list_pending(Some(PendingStatus::Pending))?.len(), 2);
        Ok(())
    }

    #[test]
    fn possible_match_leaves_store_unchanged_until_confirmed() -> RegisterResult<()> {
        let config = ClassifierConfig { t_high: 0.8, t_low: 0.4, ..ClassifierConfig::default() };
        let reconciler = Reconciler::new(&config);
        let mut store = MemoryStore::new();
        let id = seed_issue(&mut store, &reconciler, "Vendor X delivery risk", 0.6)?;
        let before = store.get(id)?;

        let candidate = CandidateStatement::new(SourceRef::document("doc-3"), "Supplier lead times are growing", vec![]);
        let oracle = StubOracle::with(&[("Vendor X", 0.55)]);
        let ranked = rank(&candidate, &open_issues(&store)?, &oracle, &semantic_only())?;
        let decision = classify(&candidate, &ranked, &config);
        let result = reconciler.reconcile(&mut store, &decision, &candidate, fixture_time(30))?;
        let Outcome::PendingCreated { pending_id } = result.outcome else {
            panic!("expected pending match, got {:?}", result.outcome);
        };
        assert_eq!(store.get(id)?, before);
        assert_eq!(store.list_pending(Some(PendingStatus::Pending))?.len(), 1);

        let confirmed = reconciler.confirm_match(&mut store, pending_id, Some("same vendor".to_string()), fixture_time(40))?;
        assert_eq!(confirmed.outcome, Outcome::Revised { revision: 2 });
        let revisions = store.revisions(id)?;
        assert_eq!(revisions[1].author, Author::User);

        let resolved = store.pending_match(pending_id)?;
        assert_eq!(resolved.status, PendingStatus::Confirmed);
        assert_eq!(resolved.resolved_at, Some(fixture_time(40)));
        assert!(store.list_pending(Some(PendingStatus::Pending))?.is_empty());

        match reconciler.confirm_match(&mut store, pending_id, None, fixture_time(50)) {
            Err(RegisterError::Validation(message)) => assert!(message.contains("already confirmed")),
            other => panic!("expected already-resolved error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn reject_with_promotion_creates_a_user_authored_issue() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let id = seed_issue(&mut store, &reconciler, "Vendor X delivery risk", 0.6)?;
        let candidate = CandidateStatement::new(SourceRef::document("doc-4"), "Warehouse roof leak", vec!["Facilities".to_string()]);
        let decision = Decision::PossibleMatch { issue_id: id, confidence: 0.5, rationale: "ambiguous".to_string() };
        let Outcome::PendingCreated { pending_id } =
            reconciler.reconcile(&mut store, &decision, &candidate, fixture_time(5))?.outcome
        else {
            panic!("expected pending match");
        };

        let receipt = reconciler.reject_match(&mut store, pending_id, true, None, fixture_time(6))?;
        let Some(promoted) = receipt.promoted else { panic!("expected promotion") };
        let issue = store.get(promoted)?;
        assert_eq!(issue.state.domain, "Facilities");
        assert_eq!(store.revisions(promoted)?[0].author, Author::User);
        assert_eq!(store.pending_match(pending_id)?.status, PendingStatus::Rejected);
        assert_eq!(store.get(id)?.revision, 1);
        Ok(())
    }

    #[test]
    fn concurrent_edits_with_same_base_yield_one_stale_revision() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let id = seed_issue(&mut store, &reconciler, "Budget freeze", 0.5)?;

        let first = IssueEdit { owner: Some("dana".to_string()), ..IssueEdit::default() };
        let second = IssueEdit { title: Some("Budget freeze for Q3".to_string()), ..IssueEdit::default() };
        assert_eq!(reconciler.edit_issue(&mut store, id, 1, &first, fixture_time(10))?, 2);
        match reconciler.edit_issue(&mut store, id, 1, &second, fixture_time(11)) {
            Err(RegisterError::StaleRevision(conflict)) => {
                assert_eq!(conflict.base_revision, 1);
                assert_eq!(conflict.current_revision, 2);
                assert_eq!(conflict.competing_author, Author::User);
                assert_eq!(conflict.attempted_fields, vec![IssueField::Title]);
            }
            other => panic!("expected stale revision, got {other:?}"),
        }
        assert_eq!(store.get(id)?.state.title, "Budget freeze");
        Ok(())
    }

    #[test]
    fn user_override_supersedes_the_system_revision() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let id = seed_issue(&mut store, &reconciler, "Vendor X delivery risk", 0.6)?;
        let candidate = CandidateStatement::new(SourceRef::document("doc-2"), "Vendor X slipped", vec![]);
        let decision = Decision::ExistingMatch { issue_id: id, confidence: 0.9, rationale: "match".to_string() };
        reconciler.reconcile(&mut store, &decision, &candidate, fixture_time(10))?;

        let edit = IssueEdit { confidence: Some(0.2), ..IssueEdit::default() };
        let revision = reconciler.edit_issue(&mut store, id, 2, &edit, fixture_time(20))?;
        let history = store.revisions(id)?;
        assert_eq!(revision, 3);
        assert_eq!(history[2].supersedes, Some(2));
        assert_eq!(history[1].author, Author::System);
        assert_eq!(history.len(), 3);
        Ok(())
    }

    #[test]
    fn merge_closes_absorbed_issue_and_relinks_evidence() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let a = seed_issue(&mut store, &reconciler, "Vendor X delivery risk", 0.6)?;
        let b = seed_issue(&mut store, &reconciler, "Vendor X shipment slip", 0.4)?;
        let b_revisions_before = store.revisions(b)?;
        let b_links = store.evidence_for_issue(b)?;

        let receipt = reconciler.merge_issues(&mut store, a, b, fixture_time(100))?;
        assert_eq!(receipt.reassigned_evidence, b_links.len());

        let absorbed = store.get(b)?;
        assert_eq!(absorbed.state.status, IssueStatus::Closed);
        let b_revisions = store.revisions(b)?;
        assert_eq!(&b_revisions[..b_revisions_before.len()], b_revisions_before.as_slice());
        assert_eq!(b_revisions.last().map(|r| r.cross_references.clone()), Some(vec![a]));

        let a_links = store.evidence_for_issue(a)?;
        let reassigned = a_links.iter().filter(|link| link.reassigned_from == Some(b)).count();
        assert_eq!(reassigned, b_links.len());
        assert_eq!(store.evidence_for_issue(b)?, b_links);

        let IssueBody::Scr(body) = store.get(a)?.state.body;
        assert_eq!(body.situation.len(), 2);

        match reconciler.merge_issues(&mut store, a, b, fixture_time(101)) {
            Err(RegisterError::InvalidTransition { .. }) => {}
            other => panic!("expected invalid transition, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn split_moves_selected_entries_and_evidence() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let id = seed_issue(&mut store, &reconciler, "Facilities backlog", 0.5)?;
        let mut roof = CandidateStatement::new(SourceRef::document("doc-roof"), "Roof leak in bay 3", vec![]);
        roof.facet = ScrFacet::Complication;
        let decision = Decision::ExistingMatch { issue_id: id, confidence: 0.9, rationale: "match".to_string() };
        reconciler.reconcile(&mut store, &decision, &roof, fixture_time(5))?;
        let roof_link = store
            .evidence_for_issue(id)?
            .into_iter()
            .find(|link| link.source.id == "doc-roof")
            .map(|link| link.link_id);
        let Some(roof_link) = roof_link else { panic!("roof evidence should exist") };

        let parts = vec![SplitPart {
            title: "Roof leak".to_string(),
            domain: None,
            owner: Some("facilities".to_string()),
            entries: vec![EntrySelector { facet: ScrFacet::Complication, index: 0 }],
            evidence: vec![roof_link],
        }];
        let receipt = reconciler.split_issue(&mut store, id, 2, &parts, fixture_time(10))?;
        assert_eq!(receipt.created.len(), 1);
        assert_eq!(receipt.source_revision, 3);

        let created = store.get(receipt.created[0])?;
        let IssueBody::Scr(created_body) = &created.state.body;
        assert_eq!(created_body.complication.len(), 1);
        assert_eq!(created.state.domain, "Supply Chain");
        let source_issue = store.get(id)?;
        let IssueBody::Scr(source_body) = &source_issue.state.body;
        assert!(source_body.complication.is_empty());
        assert_eq!(store.evidence_for_issue(receipt.created[0])?[0].reassigned_from, Some(id));
        Ok(())
    }

    #[test]
    fn accept_suggested_steps_moves_them_into_next_steps() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let mut candidate = CandidateStatement::new(SourceRef::document("doc"), "Printer fleet aging", vec!["IT".to_string()]);
        candidate.suggested_steps.push(NextStep {
            description: "Get replacement quotes".to_string(),
            owner: "lee".to_string(),
            due_date: Some("2023-12-01".to_string()),
            status: StepStatus::Open,
        });
        let created = reconciler.reconcile(
            &mut store,
            &Decision::NewIssue { confidence: 0.5, rationale: "new".to_string() },
            &candidate,
            fixture_time(0),
        )?;
        let revision = reconciler.accept_suggested_steps(&mut store, created.issue_id, 1, fixture_time(5))?;
        assert_eq!(revision, 2);
        let issue = store.get(created.issue_id)?;
        assert_eq!(issue.state.next_steps.len(), 1);
        assert!(issue.state.suggested_next_steps.is_empty());
        assert!(reconciler.accept_suggested_steps(&mut store, created.issue_id, 2, fixture_time(6)).is_err());
        Ok(())
    }

    #[test]
    fn closed_issue_rejects_edits_but_accepts_reopen() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let id = reconciler.create_issue(
            &mut store,
            IssueDraft {
                title: "Old lease".to_string(),
                domain: "Facilities".to_string(),
                owner: String::new(),
                status: IssueStatus::Closed,
                confidence: 0.5,
                body: Some(IssueBody::Scr(ScrBody::default())),
                next_steps: Vec::new(),
            },
            fixture_time(0),
        )?;
        let rename = IssueEdit { title: Some("New lease".to_string()), ..IssueEdit::default() };
        assert!(matches!(
            reconciler.edit_issue(&mut store, id, 1, &rename, fixture_time(1)),
            Err(RegisterError::InvalidTransition { .. })
        ));
        let reopen = IssueEdit { status: Some(IssueStatus::Open), ..IssueEdit::default() };
        assert_eq!(reconciler.edit_issue(&mut store, id, 1, &reopen, fixture_time(2))?, 2);
        assert_eq!(reconciler.edit_issue(&mut store, id, 2, &rename, fixture_time(3))?, 3);
        Ok(())
    }

    #[test]
    fn link_evidence_appends_without_revising() -> RegisterResult<()> {
        let reconciler = Reconciler::new(&ClassifierConfig::default());
        let mut store = MemoryStore::new();
        let id = seed_issue(&mut store, &reconciler, "Budget freeze", 0.5)?;
        reconciler.link_evidence(
            &mut store,
            id,
            EvidenceRequest {
                source: SourceRef::meeting("mtg-1"),
                span: Some(Span { start: 4, end: 30 }),
                excerpt: "CFO confirmed freeze".to_string(),
                role: EvidenceRole::Updates,
                observed_at: None,
            },
            fixture_time(9),
        )?;
        assert_eq!(store.get(id)?.revision, 1);
        let links = store.evidence_for_issue(id)?;
        assert_eq!(links.len(), 2);
        assert_eq!(links[1].recorded_in_revision, None);
        Ok(())
    }

    #[test]
    fn confidence_reevaluation_by_role() {
        assert!((reevaluate_confidence(0.6, 1.0, EvidenceRole::Supports, 0.5) - 0.8).abs() < 1e-6);
        assert!((reevaluate_confidence(0.6, 1.0, EvidenceRole::Contradicts, 0.5) - 0.3).abs() < 1e-6);
        assert!((reevaluate_confidence(0.6, 1.0, EvidenceRole::Updates, 0.5) - 0.6).abs() < 1e-6);
    }
}
