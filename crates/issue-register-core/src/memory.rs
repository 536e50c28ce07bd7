//! In-process register sharded by issue id.
//!
//! Clones share state, so each worker thread takes its own handle the same way it
//! would open its own database connection. A commit locks only the shards that hold
//! the issues it touches, in shard order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use time::OffsetDateTime;
use ulid::Ulid;

use crate::error::{RegisterError, RegisterResult};
use crate::model::{
    CandidateStatement, DeferredCandidate, EvidenceLink, Issue, IssueId, PendingMatch, PendingMatchId,
    PendingStatus, Revision, SourceRef,
};
use crate::registry::{
    Document, DocumentDraft, Meeting, MeetingDocumentLink, MeetingDraft, SourceRegistry,
};
use crate::revision::{plan_commit, CurrentIssue};
use crate::store::{
    ChangeSet, CommitReceipt, DeferredQueue, IssueFilter, IssueStore, PendingMatchBook,
    ProvenanceLedger,
};

pub const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    shards: Vec<Mutex<Shard>>,
    pending: Mutex<BTreeMap<PendingMatchId, PendingMatch>>,
    deferred: Mutex<BTreeMap<Ulid, DeferredCandidate>>,
    registry: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Shard {
    issues: BTreeMap<IssueId, IssueRecord>,
}

#[derive(Debug)]
struct IssueRecord {
    issue: Issue,
    revisions: Vec<Revision>,
    evidence: Vec<EvidenceLink>,
}

#[derive(Debug, Default)]
struct Registry {
    documents: BTreeMap<String, Document>,
    meetings: BTreeMap<String, Meeting>,
    links: BTreeSet<MeetingDocumentLink>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_shards(count: usize) -> Self {
        let shards = (0..count.max(1)).map(|_| Mutex::new(Shard::default())).collect();
        Self {
            inner: Arc::new(MemoryInner {
                shards,
                pending: Mutex::new(BTreeMap::new()),
                deferred: Mutex::new(BTreeMap::new()),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    fn shard_index(&self, issue_id: IssueId) -> usize {
        shard_for(issue_id, self.inner.shards.len())
    }

    fn shard(&self, issue_id: IssueId) -> RegisterResult<MutexGuard<'_, Shard>> {
        lock(&self.inner.shards[self.shard_index(issue_id)])
    }

    fn each_shard<F>(&self, mut visit: F) -> RegisterResult<()>
    where
        F: FnMut(&Shard),
    {
        for shard in &self.inner.shards {
            let guard = lock(shard)?;
            visit(&guard);
        }
        Ok(())
    }
}

/// Stable shard assignment from the random tail of the ULID.
#[must_use]
pub fn shard_for(issue_id: IssueId, shard_count: usize) -> usize {
    let bytes = issue_id.0.to_bytes();
    let tail = u16::from_be_bytes([bytes[14], bytes[15]]);
    usize::from(tail) % shard_count.max(1)
}

fn lock<T>(mutex: &Mutex<T>) -> RegisterResult<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| RegisterError::Storage("memory store lock poisoned".to_string()))
}

impl IssueStore for MemoryStore {
    fn commit(&mut self, change: ChangeSet) -> RegisterResult<CommitReceipt> {
        let ids = change.touched_issue_ids();
        let shard_indices = ids.iter().map(|id| self.shard_index(*id)).collect::<BTreeSet<_>>();
        let mut guards = BTreeMap::new();
        for index in shard_indices {
            guards.insert(index, lock(&self.inner.shards[index])?);
        }
        let mut pending_book =
            if change.pending_resolutions.is_empty() { None } else { Some(lock(&self.inner.pending)?) };

        let mut current = BTreeMap::new();
        for id in &ids {
            let Some(shard) = guards.get(&self.shard_index(*id)) else { continue };
            if let Some(record) = shard.issues.get(id) {
                let Some(latest) = record.revisions.last() else {
                    return Err(RegisterError::Storage(format!("issue {id} has no revisions")));
                };
                current.insert(*id, CurrentIssue { issue: record.issue.clone(), latest: latest.clone() });
            }
        }

        let plan = plan_commit(change, &current)?;
        if let Some(book) = pending_book.as_ref() {
            for resolution in &plan.pending_resolutions {
                match book.get(&resolution.pending_id) {
                    None => {
                        return Err(RegisterError::NotFound(format!("pending match {}", resolution.pending_id)));
                    }
                    Some(pending) if pending.status != PendingStatus::Pending => {
                        return Err(RegisterError::Validation(format!(
                            "pending match {} is already {}",
                            resolution.pending_id,
                            pending.status.as_str()
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        let receipt = plan.receipt();
        for (issue, revision) in plan.created {
            let shard = guards
                .get_mut(&self.shard_index(issue.id))
                .ok_or_else(|| RegisterError::Storage(format!("shard for {} not locked", issue.id)))?;
            shard.issues.insert(issue.id, IssueRecord { issue, revisions: vec![revision], evidence: Vec::new() });
        }
        for (issue, revision) in plan.updated {
            let shard = guards
                .get_mut(&self.shard_index(issue.id))
                .ok_or_else(|| RegisterError::Storage(format!("shard for {} not locked", issue.id)))?;
            let record = shard
                .issues
                .get_mut(&issue.id)
                .ok_or_else(|| RegisterError::NotFound(format!("issue {}", issue.id)))?;
            record.issue = issue;
            record.revisions.push(revision);
        }
        for link in plan.evidence {
            let shard = guards
                .get_mut(&self.shard_index(link.issue_id))
                .ok_or_else(|| RegisterError::Storage(format!("shard for {} not locked", link.issue_id)))?;
            let record = shard
                .issues
                .get_mut(&link.issue_id)
                .ok_or_else(|| RegisterError::NotFound(format!("issue {}", link.issue_id)))?;
            record.evidence.push(link);
        }
        if let Some(book) = pending_book.as_mut() {
            for resolution in plan.pending_resolutions {
                if let Some(pending) = book.get_mut(&resolution.pending_id) {
                    pending.status = resolution.status;
                    pending.resolved_at = Some(plan.committed_at);
                    pending.resolution_note = resolution.note;
                }
            }
        }
        Ok(receipt)
    }

    fn get(&self, issue_id: IssueId) -> RegisterResult<Issue> {
        self.shard(issue_id)?
            .issues
            .get(&issue_id)
            .map(|record| record.issue.clone())
            .ok_or_else(|| RegisterError::NotFound(format!("issue {issue_id}")))
    }

    fn list(&self, filter: &IssueFilter) -> RegisterResult<Vec<Issue>> {
        let mut issues = Vec::new();
        self.each_shard(|shard| {
            issues.extend(
                shard.issues.values().filter(|record| filter.matches(&record.issue)).map(|record| record.issue.clone()),
            );
        })?;
        filter.finish(&mut issues);
        Ok(issues)
    }

    fn revisions(&self, issue_id: IssueId) -> RegisterResult<Vec<Revision>> {
        self.shard(issue_id)?
            .issues
            .get(&issue_id)
            .map(|record| record.revisions.clone())
            .ok_or_else(|| RegisterError::NotFound(format!("issue {issue_id}")))
    }
}

fn sort_links(links: &mut [EvidenceLink]) {
    links.sort_by(|left, right| {
        left.observed_at.cmp(&right.observed_at).then_with(|| left.link_id.cmp(&right.link_id))
    });
}

impl ProvenanceLedger for MemoryStore {
    fn evidence_for_issue(&self, issue_id: IssueId) -> RegisterResult<Vec<EvidenceLink>> {
        let mut links = self
            .shard(issue_id)?
            .issues
            .get(&issue_id)
            .map(|record| record.evidence.clone())
            .ok_or_else(|| RegisterError::NotFound(format!("issue {issue_id}")))?;
        sort_links(&mut links);
        Ok(links)
    }

    fn evidence_for_source(&self, source: &SourceRef) -> RegisterResult<Vec<EvidenceLink>> {
        let mut links = Vec::new();
        self.each_shard(|shard| {
            for record in shard.issues.values() {
                links.extend(record.evidence.iter().filter(|link| &link.source == source).cloned());
            }
        })?;
        sort_links(&mut links);
        Ok(links)
    }

    fn evidence_observed_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> RegisterResult<Vec<EvidenceLink>> {
        let mut links = Vec::new();
        self.each_shard(|shard| {
            for record in shard.issues.values() {
                links.extend(
                    record
                        .evidence
                        .iter()
                        .filter(|link| link.observed_at >= start && link.observed_at <= end)
                        .cloned(),
                );
            }
        })?;
        sort_links(&mut links);
        Ok(links)
    }
}

impl PendingMatchBook for MemoryStore {
    fn record_pending(&mut self, pending: PendingMatch) -> RegisterResult<()> {
        let mut book = lock(&self.inner.pending)?;
        if book.contains_key(&pending.pending_id) {
            return Err(RegisterError::Validation(format!("pending match {} already exists", pending.pending_id)));
        }
        book.insert(pending.pending_id, pending);
        Ok(())
    }

    fn pending_match(&self, pending_id: PendingMatchId) -> RegisterResult<PendingMatch> {
        lock(&self.inner.pending)?
            .get(&pending_id)
            .cloned()
            .ok_or_else(|| RegisterError::NotFound(format!("pending match {pending_id}")))
    }

    fn list_pending(&self, status: Option<PendingStatus>) -> RegisterResult<Vec<PendingMatch>> {
        let mut pending = lock(&self.inner.pending)?
            .values()
            .filter(|entry| status.is_none() || status == Some(entry.status))
            .cloned()
            .collect::<Vec<_>>();
        pending.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.pending_id.cmp(&right.pending_id))
        });
        Ok(pending)
    }
}

impl DeferredQueue for MemoryStore {
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
        lock(&self.inner.deferred)?.insert(deferred.deferred_id, deferred.clone());
        Ok(deferred)
    }

    fn deferred(&self) -> RegisterResult<Vec<DeferredCandidate>> {
        let mut queue = lock(&self.inner.deferred)?.values().cloned().collect::<Vec<_>>();
        queue.sort_by(|left, right| {
            left.deferred_at.cmp(&right.deferred_at).then_with(|| left.deferred_id.cmp(&right.deferred_id))
        });
        Ok(queue)
    }

    fn record_deferred_failure(&mut self, deferred_id: Ulid, error: &str) -> RegisterResult<()> {
        let mut queue = lock(&self.inner.deferred)?;
        let entry = queue
            .get_mut(&deferred_id)
            .ok_or_else(|| RegisterError::NotFound(format!("deferred candidate {deferred_id}")))?;
        entry.attempts += 1;
        entry.last_error = error.to_string();
        Ok(())
    }

    fn clear_deferred(&mut self, deferred_id: Ulid) -> RegisterResult<()> {
        lock(&self.inner.deferred)?
            .remove(&deferred_id)
            .map(|_| ())
            .ok_or_else(|| RegisterError::NotFound(format!("deferred candidate {deferred_id}")))
    }
}

impl SourceRegistry for MemoryStore {
    fn register_document(&mut self, draft: DocumentDraft, at: OffsetDateTime) -> RegisterResult<Document> {
        draft.validate()?;
        let excerpt = draft.excerpt();
        let mut registry = lock(&self.inner.registry)?;
        let path = draft.path.trim().to_string();
        if let Some(existing) = registry.documents.values_mut().find(|document| document.path == path) {
            existing.title = draft.title;
            existing.tags = draft.tags;
            existing.excerpt = excerpt;
            return Ok(existing.clone());
        }
        let document = Document {
            source_id: Ulid::new().to_string(),
            title: draft.title,
            path,
            tags: draft.tags,
            excerpt,
            created_at: at,
        };
        registry.documents.insert(document.source_id.clone(), document.clone());
        Ok(document)
    }

    fn register_meeting(&mut self, draft: MeetingDraft, at: OffsetDateTime) -> RegisterResult<Meeting> {
        draft.validate()?;
        let key = draft.upsert_key();
        let mut registry = lock(&self.inner.registry)?;
        if let Some(existing) = registry
            .meetings
            .values_mut()
            .find(|meeting| (meeting.scheduled_at.date(), meeting.source_tag.clone()) == key)
        {
            existing.title = draft.title;
            existing.scheduled_at = draft.scheduled_at;
            return Ok(existing.clone());
        }
        let meeting = Meeting {
            source_id: Ulid::new().to_string(),
            title: draft.title,
            source_tag: key.1,
            scheduled_at: draft.scheduled_at,
            created_at: at,
        };
        registry.meetings.insert(meeting.source_id.clone(), meeting.clone());
        Ok(meeting)
    }

    fn link_meeting_document(&mut self, meeting_id: &str, document_id: &str) -> RegisterResult<()> {
        let mut registry = lock(&self.inner.registry)?;
        if !registry.meetings.contains_key(meeting_id) {
            return Err(RegisterError::NotFound(format!("meeting {meeting_id}")));
        }
        if !registry.documents.contains_key(document_id) {
            return Err(RegisterError::NotFound(format!("document {document_id}")));
        }
        registry.links.insert(MeetingDocumentLink {
            meeting_id: meeting_id.to_string(),
            document_id: document_id.to_string(),
        });
        Ok(())
    }

    fn documents(&self) -> RegisterResult<Vec<Document>> {
        let mut documents = lock(&self.inner.registry)?.documents.values().cloned().collect::<Vec<_>>();
        documents.sort_by(|left, right| left.path.cmp(&right.path));
        Ok(documents)
    }

    fn meetings(&self) -> RegisterResult<Vec<Meeting>> {
        let mut meetings = lock(&self.inner.registry)?.meetings.values().cloned().collect::<Vec<_>>();
        meetings.sort_by(|left, right| {
            left.scheduled_at.cmp(&right.scheduled_at).then_with(|| left.source_id.cmp(&right.source_id))
        });
        Ok(meetings)
    }

    fn meetings_between(&self, start: OffsetDateTime, end: OffsetDateTime) -> RegisterResult<Vec<Meeting>> {
        let mut meetings = self.meetings()?;
        meetings.retain(|meeting| meeting.scheduled_at >= start && meeting.scheduled_at <= end);
        Ok(meetings)
    }

    fn meeting_document_links(&self) -> RegisterResult<Vec<MeetingDocumentLink>> {
        Ok(lock(&self.inner.registry)?.links.iter().cloned().collect())
    }
}
