//! Commit planning and revision replay.
//!
//! Every backend funnels its commits through [`plan_commit`] so the optimistic
//! concurrency check, the closed-issue rule and revision numbering are identical
//! whether issues live in memory or in SQLite.

use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;

use crate::error::{RegisterError, RegisterResult, StaleRevisionConflict};
use crate::model::{
    Author, EvidenceLink, EvidenceLinkId, Issue, IssueField, IssueId, IssueState, IssueStatus,
    PendingStatus, Revision, RevisionSeq,
};
use crate::store::{ChangeSet, CommitReceipt, PendingResolution};

const ALL_FIELDS: [IssueField; 8] = [
    IssueField::Title,
    IssueField::Domain,
    IssueField::Owner,
    IssueField::Status,
    IssueField::Confidence,
    IssueField::Body,
    IssueField::NextSteps,
    IssueField::SuggestedNextSteps,
];

/// Committed state of one issue as a backend sees it inside its commit transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentIssue {
    pub issue: Issue,
    pub latest: Revision,
}

/// Fully validated records a backend persists verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitPlan {
    pub committed_at: OffsetDateTime,
    pub created: Vec<(Issue, Revision)>,
    pub updated: Vec<(Issue, Revision)>,
    pub evidence: Vec<EvidenceLink>,
    pub pending_resolutions: Vec<PendingResolution>,
}

impl CommitPlan {
    #[must_use]
    pub fn receipt(&self) -> CommitReceipt {
        CommitReceipt {
            created: self.created.iter().map(|(issue, _)| issue.id).collect(),
            revisions: self
                .created
                .iter()
                .chain(&self.updated)
                .map(|(issue, revision)| (issue.id, revision.sequence))
                .collect(),
            evidence: self.evidence.iter().map(|link| link.link_id).collect(),
        }
    }
}

/// Validate a change set against current committed state and build the records to persist.
///
/// `current` must hold every existing issue named by [`ChangeSet::touched_issue_ids`].
///
/// # Errors
/// See [`crate::store::IssueStore::commit`].
pub fn plan_commit(
    change: ChangeSet,
    current: &BTreeMap<IssueId, CurrentIssue>,
) -> RegisterResult<CommitPlan> {
    if change.creations.is_empty()
        && change.revisions.is_empty()
        && change.evidence.is_empty()
        && change.pending_resolutions.is_empty()
    {
        return Err(RegisterError::Validation("change set MUST contain at least one change".to_string()));
    }
    // Commit times never precede what a touched issue already records, so a late-arriving
    // writer holding an old clock reading cannot break replay ordering.
    let committed_at = current
        .values()
        .map(|entry| entry.issue.updated_at.max(entry.latest.committed_at))
        .fold(change.committed_at, OffsetDateTime::max);
    let mut sequences: BTreeMap<IssueId, RevisionSeq> = BTreeMap::new();

    let mut created = Vec::with_capacity(change.creations.len());
    for creation in change.creations {
        if current.contains_key(&creation.id) || sequences.contains_key(&creation.id) {
            return Err(RegisterError::Validation(format!("issue {} already exists", creation.id)));
        }
        creation.state.validate()?;
        require_rationale(creation.author, creation.rationale.as_deref())?;
        let revision = Revision {
            issue_id: creation.id,
            sequence: 1,
            author: creation.author,
            change_summary: creation.change_summary,
            rationale: creation.rationale,
            committed_at,
            previous_snapshot: None,
            snapshot: creation.state.clone(),
            changed_fields: ALL_FIELDS.to_vec(),
            supersedes: None,
            cross_references: creation.cross_references,
        };
        let issue = Issue {
            id: creation.id,
            revision: 1,
            created_at: committed_at,
            updated_at: committed_at,
            state: creation.state,
        };
        sequences.insert(issue.id, 1);
        created.push((issue, revision));
    }

    let mut updated = Vec::with_capacity(change.revisions.len());
    for proposal in change.revisions {
        if sequences.contains_key(&proposal.issue_id) {
            return Err(RegisterError::Validation(format!(
                "issue {} MUST appear at most once per change set",
                proposal.issue_id
            )));
        }
        let Some(existing) = current.get(&proposal.issue_id) else {
            return Err(RegisterError::NotFound(format!("issue {}", proposal.issue_id)));
        };
        let changed_fields = existing.issue.state.changed_fields(&proposal.state);
        if proposal.base_revision != existing.issue.revision {
            return Err(RegisterError::stale(StaleRevisionConflict {
                issue_id: proposal.issue_id,
                base_revision: proposal.base_revision,
                current_revision: existing.issue.revision,
                competing_author: existing.latest.author,
                competing_summary: existing.latest.change_summary.clone(),
                attempted_fields: changed_fields,
            }));
        }
        proposal.state.validate()?;
        require_rationale(proposal.author, proposal.rationale.as_deref())?;
        if changed_fields.is_empty() && proposal.cross_references.is_empty() {
            return Err(RegisterError::Validation(format!(
                "proposed state for issue {} MUST differ from its current state",
                proposal.issue_id
            )));
        }
        check_transition(existing.issue.state.status, proposal.state.status, &changed_fields)?;
        if proposal.supersedes.is_some_and(|sequence| sequence > existing.issue.revision) {
            return Err(RegisterError::Validation(
                "supersedes MUST reference an already committed revision".to_string(),
            ));
        }

        let sequence = existing.issue.revision + 1;
        let revision = Revision {
            issue_id: proposal.issue_id,
            sequence,
            author: proposal.author,
            change_summary: proposal.change_summary,
            rationale: proposal.rationale,
            committed_at,
            previous_snapshot: Some(existing.issue.state.clone()),
            snapshot: proposal.state.clone(),
            changed_fields,
            supersedes: proposal.supersedes,
            cross_references: proposal.cross_references,
        };
        let issue = Issue {
            id: proposal.issue_id,
            revision: sequence,
            created_at: existing.issue.created_at,
            updated_at: committed_at,
            state: proposal.state,
        };
        sequences.insert(issue.id, sequence);
        updated.push((issue, revision));
    }

    let mut evidence = Vec::with_capacity(change.evidence.len());
    for draft in change.evidence {
        if !current.contains_key(&draft.issue_id) && !sequences.contains_key(&draft.issue_id) {
            return Err(RegisterError::NotFound(format!("issue {}", draft.issue_id)));
        }
        if draft.source.id.trim().is_empty() {
            return Err(RegisterError::Validation("evidence source id MUST be non-empty".to_string()));
        }
        evidence.push(EvidenceLink {
            link_id: EvidenceLinkId::new(),
            issue_id: draft.issue_id,
            source: draft.source,
            span: draft.span,
            excerpt: draft.excerpt,
            role: draft.role,
            observed_at: draft.observed_at,
            recorded_at: committed_at,
            recorded_in_revision: sequences.get(&draft.issue_id).copied(),
            reassigned_from: draft.reassigned_from,
        });
    }

    let mut seen_pending = BTreeSet::new();
    for resolution in &change.pending_resolutions {
        if resolution.status == PendingStatus::Pending {
            return Err(RegisterError::Validation(
                "pending resolution MUST be confirmed or rejected".to_string(),
            ));
        }
        if !seen_pending.insert(resolution.pending_id) {
            return Err(RegisterError::Validation(format!(
                "pending match {} MUST be resolved once",
                resolution.pending_id
            )));
        }
    }

    Ok(CommitPlan {
        committed_at,
        created,
        updated,
        evidence,
        pending_resolutions: change.pending_resolutions,
    })
}

fn require_rationale(author: Author, rationale: Option<&str>) -> RegisterResult<()> {
    let has_rationale = rationale.is_some_and(|value| !value.trim().is_empty());
    if author == Author::System && !has_rationale {
        return Err(RegisterError::Validation(
            "system-authored revisions MUST carry a rationale".to_string(),
        ));
    }
    Ok(())
}

/// A closed issue only accepts a status-only reopen to Open or Watching.
///
/// # Errors
/// Returns [`RegisterError::InvalidTransition`] for any other change to a closed issue.
pub fn check_transition(
    from: IssueStatus,
    to: IssueStatus,
    changed_fields: &[IssueField],
) -> RegisterResult<()> {
    if from != IssueStatus::Closed || changed_fields.is_empty() {
        return Ok(());
    }
    let reopening = matches!(to, IssueStatus::Open | IssueStatus::Watching);
    if reopening && changed_fields == [IssueField::Status] {
        return Ok(());
    }
    let reason = if reopening {
        "reopen a closed issue with a status-only revision before editing other fields".to_string()
    } else {
        let fields = changed_fields.iter().map(|field| field.as_str()).collect::<Vec<_>>();
        format!("closed issues accept only an explicit reopen; attempted fields: {}", fields.join(", "))
    };
    Err(RegisterError::InvalidTransition { from, to, reason })
}

/// Rebuild an issue's current state from its complete revision history.
///
/// # Errors
/// Returns [`RegisterError::Validation`] when the history is empty, out of order, mixes
/// issues, or a `previous_snapshot` does not reproduce the prior state.
pub fn replay(revisions: &[Revision]) -> RegisterResult<IssueState> {
    let Some(first) = revisions.first() else {
        return Err(RegisterError::Validation("revision history MUST be non-empty".to_string()));
    };
    if first.sequence != 1 || first.previous_snapshot.is_some() {
        return Err(RegisterError::Validation(
            "revision history MUST start with the creation revision".to_string(),
        ));
    }
    let mut state = &first.snapshot;
    for pair in revisions.windows(2) {
        let (prior, next) = (&pair[0], &pair[1]);
        if next.issue_id != first.issue_id {
            return Err(RegisterError::Validation("revision history MUST cover one issue".to_string()));
        }
        if next.sequence != prior.sequence + 1 {
            return Err(RegisterError::Validation(format!(
                "revision sequence MUST be contiguous; {} follows {}",
                next.sequence, prior.sequence
            )));
        }
        if next.previous_snapshot.as_ref() != Some(state) {
            return Err(RegisterError::Validation(format!(
                "revision {} previous_snapshot MUST equal the state committed by revision {}",
                next.sequence, prior.sequence
            )));
        }
        if next.committed_at < prior.committed_at {
            return Err(RegisterError::Validation(format!(
                "revision {} MUST NOT be committed before revision {}",
                next.sequence, prior.sequence
            )));
        }
        state = &next.snapshot;
    }
    Ok(state.clone())
}

/// Latest System revision that changed any of `fields`; a User revision touching those
/// fields supersedes it.
#[must_use]
pub fn superseded_system_revision(history: &[Revision], fields: &[IssueField]) -> Option<RevisionSeq> {
    history
        .iter()
        .rev()
        .find(|revision| {
            revision.author == Author::System
                && revision.changed_fields.iter().any(|field| fields.contains(field))
        })
        .map(|revision| revision.sequence)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use ulid::Ulid;

    use super::*;
    use crate::store::{IssueCreation, ProposedRevision};

    fn fixture_time(offset: u64) -> OffsetDateTime {
        OffsetDateTime::from(UNIX_EPOCH + Duration::from_secs(1_700_000_000 + offset))
    }

    fn creation(id: IssueId) -> IssueCreation {
        IssueCreation {
            id,
            state: IssueState::open_scr("Vendor X delivery risk", "Supply Chain", 0.6),
            author: Author::System,
            change_summary: "Created from document:doc-1".to_string(),
            rationale: Some("no open issues to match against".to_string()),
            cross_references: Vec::new(),
        }
    }

    fn committed(id: IssueId) -> RegisterResult<(BTreeMap<IssueId, CurrentIssue>, Revision)> {
        let mut change = ChangeSet::at(fixture_time(0));
        change.creations.push(creation(id));
        let plan = plan_commit(change, &BTreeMap::new())?;
        let Some((issue, revision)) = plan.created.into_iter().next() else {
            panic!("creation should be planned");
        };
        let mut current = BTreeMap::new();
        current.insert(id, CurrentIssue { issue, latest: revision.clone() });
        Ok((current, revision))
    }

    fn proposal(id: IssueId, base: RevisionSeq, state: IssueState) -> ProposedRevision {
        ProposedRevision {
            issue_id: id,
            base_revision: base,
            state,
            author: Author::User,
            change_summary: "edit".to_string(),
            rationale: None,
            supersedes: None,
            cross_references: Vec::new(),
        }
    }

    #[test]
    fn system_creation_without_rationale_is_rejected() {
        let mut change = ChangeSet::at(fixture_time(0));
        let mut draft = creation(IssueId(Ulid::from(1)));
        draft.rationale = None;
        change.creations.push(draft);
        assert!(matches!(plan_commit(change, &BTreeMap::new()), Err(RegisterError::Validation(_))));
    }

    #[test]
    fn stale_base_reports_competing_revision() -> RegisterResult<()> {
        let id = IssueId(Ulid::from(1));
        let (current, _) = committed(id)?;
        let mut state = current[&id].issue.state.clone();
        state.owner = "dana".to_string();

        let mut change = ChangeSet::at(fixture_time(5));
        change.revisions.push(proposal(id, 0, state));
        match plan_commit(change, &current) {
            Err(RegisterError::StaleRevision(conflict)) => {
                assert_eq!(conflict.base_revision, 0);
                assert_eq!(conflict.current_revision, 1);
                assert_eq!(conflict.competing_author, Author::System);
                assert_eq!(conflict.attempted_fields, vec![IssueField::Owner]);
            }
            other => panic!("expected stale revision, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn closed_issue_accepts_only_status_only_reopen() -> RegisterResult<()> {
        let id = IssueId(Ulid::from(1));
        let (mut current, _) = committed(id)?;
        if let Some(entry) = current.get_mut(&id) {
            entry.issue.state.status = IssueStatus::Closed;
        }

        let mut edit = current[&id].issue.state.clone();
        edit.title = "Renamed".to_string();
        let mut change = ChangeSet::at(fixture_time(5));
        change.revisions.push(proposal(id, 1, edit));
        assert!(matches!(plan_commit(change, &current), Err(RegisterError::InvalidTransition { .. })));

        let mut reopen_and_edit = current[&id].issue.state.clone();
        reopen_and_edit.status = IssueStatus::Open;
        reopen_and_edit.owner = "lee".to_string();
        let mut change = ChangeSet::at(fixture_time(5));
        change.revisions.push(proposal(id, 1, reopen_and_edit));
        assert!(matches!(plan_commit(change, &current), Err(RegisterError::InvalidTransition { .. })));

        let mut reopen = current[&id].issue.state.clone();
        reopen.status = IssueStatus::Watching;
        let mut change = ChangeSet::at(fixture_time(5));
        change.revisions.push(proposal(id, 1, reopen));
        let plan = plan_commit(change, &current)?;
        assert_eq!(plan.updated[0].1.changed_fields, vec![IssueField::Status]);
        Ok(())
    }

    #[test]
    fn identical_proposal_is_rejected() -> RegisterResult<()> {
        let id = IssueId(Ulid::from(1));
        let (current, _) = committed(id)?;
        let mut change = ChangeSet::at(fixture_time(5));
        change.revisions.push(proposal(id, 1, current[&id].issue.state.clone()));
        assert!(matches!(plan_commit(change, &current), Err(RegisterError::Validation(_))));
        Ok(())
    }

    #[test]
    fn replay_reconstructs_state_and_detects_broken_chain() -> RegisterResult<()> {
        let id = IssueId(Ulid::from(1));
        let (current, first) = committed(id)?;
        let mut next_state = current[&id].issue.state.clone();
        next_state.confidence = 0.75;
        let mut change = ChangeSet::at(fixture_time(9));
        change.revisions.push(proposal(id, 1, next_state.clone()));
        let plan = plan_commit(change, &current)?;
        let second = plan.updated[0].1.clone();
        assert_eq!(plan.updated[0].0.updated_at, second.committed_at);

        assert_eq!(replay(&[first.clone(), second.clone()])?, next_state);

        let mut tampered = second;
        if let Some(previous) = tampered.previous_snapshot.as_mut() {
            previous.title = "Tampered".to_string();
        }
        assert!(replay(&[first, tampered]).is_err());
        Ok(())
    }

    #[test]
    fn commit_time_never_precedes_latest_revision() -> RegisterResult<()> {
        let id = IssueId(Ulid::from(1));
        let (mut current, first) = committed(id)?;
        let mut edited = current[&id].issue.state.clone();
        edited.owner = "dana".to_string();
        let mut change = ChangeSet::at(fixture_time(200));
        change.revisions.push(proposal(id, 1, edited.clone()));
        let plan = plan_commit(change, &current)?;
        let Some((issue, second)) = plan.updated.into_iter().next() else {
            panic!("edit should be planned");
        };
        current.insert(id, CurrentIssue { issue, latest: second.clone() });

        let mut late = edited;
        late.confidence = 0.9;
        let mut change = ChangeSet::at(fixture_time(100));
        change.revisions.push(proposal(id, 2, late.clone()));
        let plan = plan_commit(change, &current)?;
        assert_eq!(plan.committed_at, fixture_time(200));
        let Some((issue, third)) = plan.updated.into_iter().next() else {
            panic!("late write should be planned");
        };
        assert_eq!(third.committed_at, fixture_time(200));
        assert_eq!(issue.updated_at, fixture_time(200));
        assert_eq!(replay(&[first, second, third])?, late);
        Ok(())
    }

    #[test]
    fn superseded_revision_is_latest_system_revision_touching_fields() {
        let id = IssueId(Ulid::from(1));
        let state = IssueState::open_scr("t", "d", 0.5);
        let revision = |sequence, author, fields: Vec<IssueField>| Revision {
            issue_id: id,
            sequence,
            author,
            change_summary: String::new(),
            rationale: None,
            committed_at: fixture_time(0),
            previous_snapshot: None,
            snapshot: state.clone(),
            changed_fields: fields,
            supersedes: None,
            cross_references: Vec::new(),
        };
        let history = vec![
            revision(1, Author::System, ALL_FIELDS.to_vec()),
            revision(2, Author::System, vec![IssueField::Confidence, IssueField::Body]),
            revision(3, Author::User, vec![IssueField::Confidence]),
            revision(4, Author::System, vec![IssueField::Body]),
        ];
        assert_eq!(superseded_system_revision(&history, &[IssueField::Confidence]), Some(2));
        assert_eq!(superseded_system_revision(&history, &[IssueField::Body]), Some(4));
        assert_eq!(superseded_system_revision(&history[2..3], &[IssueField::Owner]), None);
    }
}
