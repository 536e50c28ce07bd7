use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::config::AgendaConfig;
use crate::error::{RegisterError, RegisterResult};
use crate::model::{EvidenceLink, Issue, IssueId, IssueStatus, SourceKind, SourceRef};
use crate::registry::{Meeting, MeetingDocumentLink};
use crate::store::{IssueFilter, RegisterStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgendaItem {
    pub issue_id: IssueId,
    pub title: String,
    pub domain: String,
    pub status: IssueStatus,
    pub confidence: f32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
    pub activity_sources: Vec<SourceRef>,
    pub framing_questions: Vec<String>,
    pub unresolved_hypotheses: usize,
    pub suggested_minutes: u32,
}

/// Committed state the composer reads.
#[derive(Debug, Clone, Copy)]
pub struct AgendaInputs<'a> {
    pub issues: &'a [Issue],
    pub evidence: &'a [EvidenceLink],
    pub meetings: &'a [Meeting],
    pub meeting_documents: &'a [MeetingDocumentLink],
}

/// Rank Open/Watching issues with activity around `as_of`.
///
/// Evidence counts when observed in `[as_of - window, as_of]`; a meeting counts when
/// scheduled in `[as_of - window, as_of + window]`, and so do documents linked to it.
/// Most recent activity first, then lower confidence, then issue id.
///
/// # Errors
/// `Validation` when the window reaches outside the representable date range.
pub fn compose_agenda(
    as_of: OffsetDateTime,
    window: Duration,
    inputs: AgendaInputs<'_>,
    config: &AgendaConfig,
) -> RegisterResult<Vec<AgendaItem>> {
    let (evidence_start, meeting_end) = window_bounds(as_of, window)?;

    let meeting_times = inputs
        .meetings
        .iter()
        .filter(|meeting| meeting.scheduled_at >= evidence_start && meeting.scheduled_at <= meeting_end)
        .map(|meeting| (meeting.source_id.as_str(), meeting.scheduled_at))
        .collect::<BTreeMap<_, _>>();
    let mut document_times: BTreeMap<&str, OffsetDateTime> = BTreeMap::new();
    for link in inputs.meeting_documents {
        if let Some(scheduled_at) = meeting_times.get(link.meeting_id.as_str()) {
            let entry = document_times.entry(link.document_id.as_str()).or_insert(*scheduled_at);
            *entry = (*entry).max(*scheduled_at);
        }
    }

    let mut activity: BTreeMap<IssueId, (OffsetDateTime, Vec<SourceRef>)> = BTreeMap::new();
    for link in inputs.evidence {
        let observed = (link.observed_at >= evidence_start && link.observed_at <= as_of).then_some(link.observed_at);
        let scheduled = match link.source.kind {
            SourceKind::Meeting => meeting_times.get(link.source.id.as_str()).copied(),
            SourceKind::Document => document_times.get(link.source.id.as_str()).copied(),
        };
        let Some(at) = observed.max(scheduled) else { continue };
        let entry = activity.entry(link.issue_id).or_insert((at, Vec::new()));
        entry.0 = entry.0.max(at);
        if !entry.1.contains(&link.source) {
            entry.1.push(link.source.clone());
        }
    }

    let mut items = inputs
        .issues
        .iter()
        .filter(|issue| issue.state.status.is_agenda_eligible())
        .filter_map(|issue| {
            let (last_activity_at, mut activity_sources) = activity.get(&issue.id)?.clone();
            activity_sources.sort();
            let summary = issue.state.body.summarize_for_agenda();
            Some(AgendaItem {
                issue_id: issue.id,
                title: issue.state.title.clone(),
                domain: issue.state.domain.clone(),
                status: issue.state.status,
                confidence: issue.state.confidence,
                last_activity_at,
                activity_sources,
                suggested_minutes: suggested_minutes(summary.unresolved_hypotheses, config),
                framing_questions: summary.framing_questions,
                unresolved_hypotheses: summary.unresolved_hypotheses,
            })
        })
        .collect::<Vec<_>>();
    items.sort_by(|left, right| {
        right
            .last_activity_at
            .cmp(&left.last_activity_at)
            .then_with(|| left.confidence.total_cmp(&right.confidence))
            .then_with(|| left.issue_id.cmp(&right.issue_id))
    });
    Ok(items)
}

fn window_bounds(as_of: OffsetDateTime, window: Duration) -> RegisterResult<(OffsetDateTime, OffsetDateTime)> {
    if window.is_negative() {
        return Err(RegisterError::Validation("agenda window MUST NOT be negative".to_string()));
    }
    match (as_of.checked_sub(window), as_of.checked_add(window)) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(RegisterError::Validation(format!("agenda window of {} days around {as_of} is out of range", window.whole_days()))),
    }
}

fn suggested_minutes(unresolved_hypotheses: usize, config: &AgendaConfig) -> u32 {
    let hypotheses = u32::try_from(unresolved_hypotheses.max(1)).unwrap_or(u32::MAX);
    config.minutes_per_hypothesis.saturating_mul(hypotheses).min(config.max_item_minutes)
}

/// Read committed state from `store` and compose the agenda.
///
/// # Errors
/// Returns storage errors from the reads and `Validation` for an out-of-range window.
pub fn compose_agenda_from_store<S: RegisterStore + ?Sized>(
    store: &S,
    as_of: OffsetDateTime,
    window: Duration,
    config: &AgendaConfig,
) -> RegisterResult<Vec<AgendaItem>> {
    let (start, end) = window_bounds(as_of, window)?;
    let issues = store
        .list(&IssueFilter::default())?
        .into_iter()
        .filter(|issue| issue.state.status.is_agenda_eligible())
        .collect::<Vec<_>>();
    let mut evidence = Vec::new();
    for issue in &issues {
        evidence.extend(store.evidence_for_issue(issue.id)?);
    }
    let meetings = store.meetings_between(start, end)?;
    let meeting_documents = store.meeting_document_links()?;
    compose_agenda(
        as_of,
        window,
        AgendaInputs { issues: &issues, evidence: &evidence, meetings: &meetings, meeting_documents: &meeting_documents },
        config,
    )
}
