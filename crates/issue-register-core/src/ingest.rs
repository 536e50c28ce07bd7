//! Ingestion driver.
//!
//! Candidates are matched and classified in parallel against one snapshot of the
//! non-closed issues. Outcomes are then applied in lanes keyed by target issue, so
//! each issue is mutated by at most one lane and every lane commits sequentially.

use std::thread;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::classifier::{classify, Decision};
use crate::config::RegisterConfig;
use crate::error::{RegisterError, RegisterResult};
use crate::matcher::rank;
use crate::memory::shard_for;
use crate::model::{CandidateStatement, Issue, IssueId, IssueStatus, SourceRef};
use crate::oracle::SimilarityOracle;
use crate::reconcile::{Outcome, ReconcileResult, Reconciler};
use crate::store::{IssueFilter, RegisterStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestItem {
    pub candidate: CandidateStatement,
    pub deferred_id: Option<Ulid>,
}

impl From<CandidateStatement> for IngestItem {
    fn from(candidate: CandidateStatement) -> Self {
        Self { candidate, deferred_id: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CandidateOutcome {
    Reconciled { decision: Decision, issue_id: IssueId, outcome: Outcome },
    Deferred { deferred_id: Ulid, reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateReport {
    pub index: usize,
    pub source: SourceRef,
    #[serde(flatten)]
    pub outcome: CandidateOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub created: usize,
    pub revised: usize,
    pub unchanged: usize,
    pub pending: usize,
    pub deferred: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestReport {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub summary: IngestSummary,
    pub candidates: Vec<CandidateReport>,
}

enum Work {
    Apply(Decision),
    Defer(String),
    Fail(String),
}

/// Runs candidates through Matcher, Classifier and Reconciler.
pub struct IngestDriver<'a> {
    config: &'a RegisterConfig,
    oracle: &'a dyn SimilarityOracle,
    clock: Option<fn() -> OffsetDateTime>,
}

impl<'a> IngestDriver<'a> {
    #[must_use]
    pub fn new(config: &'a RegisterConfig, oracle: &'a dyn SimilarityOracle) -> Self {
        Self { config, oracle, clock: None }
    }

    /// Read `clock` when each candidate is applied instead of reusing the batch start time.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = Some(clock);
        self
    }

    fn apply_time(&self, started_at: OffsetDateTime) -> OffsetDateTime {
        self.clock.map_or(started_at, |clock| clock().max(started_at))
    }

    /// Process a batch. Each lane opens its own store handle through `open_store`.
    ///
    /// # Errors
    /// Returns an error only when the open-issue snapshot cannot be read; per-candidate
    /// failures are reported in the returned [`IngestReport`].
    pub fn run<S, F>(&self, items: Vec<IngestItem>, open_store: F, now: OffsetDateTime) -> RegisterResult<IngestReport>
    where
        S: RegisterStore,
        F: Fn() -> RegisterResult<S> + Sync,
    {
        let snapshot = open_store()?
            .list(&IssueFilter::default())?
            .into_iter()
            .filter(|issue| issue.state.status != IssueStatus::Closed)
            .collect::<Vec<_>>();
        let workers = self.config.ingest.workers.max(1);

        let work = self.classify_all(&items, &snapshot, workers);

        let mut lanes: Vec<Vec<(usize, Work)>> = (0..workers).map(|_| Vec::new()).collect();
        for (index, item_work) in work.into_iter().enumerate() {
            let lane = match &item_work {
                Work::Apply(decision) => decision.target().map_or(index % workers, |id| shard_for(id, workers)),
                Work::Defer(_) | Work::Fail(_) => index % workers,
            };
            lanes[lane].push((index, item_work));
        }

        let reconciler = Reconciler::new(&self.config.classifier);
        let mut candidates = thread::scope(|scope| {
            let handles = lanes
                .into_iter()
                .filter(|lane| !lane.is_empty())
                .map(|lane| {
                    let items = &items;
                    let open_store = &open_store;
                    let reconciler = &reconciler;
                    scope.spawn(move || self.run_lane(lane, items, open_store, reconciler, now))
                })
                .collect::<Vec<_>>();
            let mut reports = Vec::with_capacity(items.len());
            for handle in handles {
                match handle.join() {
                    Ok(lane_reports) => reports.extend(lane_reports),
                    Err(_) => tracing::error!("ingestion lane panicked"),
                }
            }
            reports
        });
        candidates.sort_by_key(|report| report.index);

        let summary = summarize(&candidates);
        tracing::info!(
            candidates = candidates.len(),
            created = summary.created,
            revised = summary.revised,
            pending = summary.pending,
            deferred = summary.deferred,
            failed = summary.failed,
            "ingestion batch finished"
        );
        Ok(IngestReport { started_at: now, summary, candidates })
    }

    /// Re-run every deferred candidate through the full pipeline.
    ///
    /// # Errors
    /// Same as [`IngestDriver::run`].
    pub fn retry_deferred<S, F>(&self, open_store: F, now: OffsetDateTime) -> RegisterResult<IngestReport>
    where
        S: RegisterStore,
        F: Fn() -> RegisterResult<S> + Sync,
    {
        let items = open_store()?
            .deferred()?
            .into_iter()
            .map(|deferred| IngestItem { candidate: deferred.candidate, deferred_id: Some(deferred.deferred_id) })
            .collect::<Vec<_>>();
        self.run(items, open_store, now)
    }

    fn classify_all(&self, items: &[IngestItem], snapshot: &[Issue], workers: usize) -> Vec<Work> {
        let chunk_size = items.len().div_ceil(workers).max(1);
        thread::scope(|scope| {
            let handles = items
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || chunk.iter().map(|item| self.classify_one(&item.candidate, snapshot)).collect::<Vec<_>>())
                })
                .collect::<Vec<_>>();
            let mut work = Vec::with_capacity(items.len());
            for (handle, chunk) in handles.into_iter().zip(items.chunks(chunk_size)) {
                match handle.join() {
                    Ok(chunk_work) => work.extend(chunk_work),
                    Err(_) => {
                        work.extend(chunk.iter().map(|_| Work::Fail("classification worker panicked".to_string())));
                    }
                }
            }
            work
        })
    }

    fn classify_one(&self, candidate: &CandidateStatement, snapshot: &[Issue]) -> Work {
        if let Err(err) = candidate.validate() {
            return Work::Fail(err.to_string());
        }
        match rank(candidate, snapshot, self.oracle, &self.config.matcher) {
            Ok(ranked) => Work::Apply(classify(candidate, &ranked, &self.config.classifier)),
            Err(RegisterError::OracleUnavailable(reason)) => Work::Defer(reason),
            Err(other) => Work::Fail(other.to_string()),
        }
    }

    fn run_lane<S, F>(
        &self,
        lane: Vec<(usize, Work)>,
        items: &[IngestItem],
        open_store: &F,
        reconciler: &Reconciler,
        now: OffsetDateTime,
    ) -> Vec<CandidateReport>
    where
        S: RegisterStore,
        F: Fn() -> RegisterResult<S>,
    {
        let mut store = match open_store() {
            Ok(store) => store,
            Err(err) => {
                return lane
                    .into_iter()
                    .map(|(index, _)| CandidateReport {
                        index,
                        source: items[index].candidate.source(),
                        outcome: CandidateOutcome::Failed { reason: format!("store unavailable: {err}") },
                    })
                    .collect();
            }
        };

        lane.into_iter()
            .map(|(index, work)| {
                let item = &items[index];
                let outcome = match work {
                    Work::Apply(decision) => self.apply(&mut store, reconciler, item, decision, now),
                    Work::Defer(reason) => defer(&mut store, item, &reason, now),
                    Work::Fail(reason) => CandidateOutcome::Failed { reason },
                };
                if let CandidateOutcome::Failed { reason } = &outcome {
                    tracing::warn!(index, source = %item.candidate.source(), %reason, "candidate failed");
                }
                CandidateReport { index, source: item.candidate.source(), outcome }
            })
            .collect()
    }

    fn apply<S: RegisterStore>(
        &self,
        store: &mut S,
        reconciler: &Reconciler,
        item: &IngestItem,
        decision: Decision,
        now: OffsetDateTime,
    ) -> CandidateOutcome {
        let mut rederived = 0;
        let result = loop {
            match reconciler.reconcile(store, &decision, &item.candidate, self.apply_time(now)) {
                Err(RegisterError::StaleRevision(conflict)) if rederived < self.config.ingest.rederive_attempts => {
                    rederived += 1;
                    tracing::warn!(
                        issue_id = %conflict.issue_id,
                        current = conflict.current_revision,
                        attempt = rederived,
                        "stale revision; re-deriving proposal"
                    );
                }
                other => break other,
            }
        };
        let outcome = match result {
            Ok(ReconcileResult { issue_id, outcome }) => {
                CandidateOutcome::Reconciled { decision, issue_id, outcome }
            }
            Err(RegisterError::StaleRevision(conflict)) => CandidateOutcome::Failed {
                reason: format!(
                    "issue {} kept changing ({} re-derivations, current revision {}); not merged",
                    conflict.issue_id, rederived, conflict.current_revision
                ),
            },
            Err(RegisterError::InvalidTransition { reason, .. }) => {
                // The target closed after the snapshot; keep the candidate queued so a
                // retry classifies it against the issues that are still open.
                return defer(store, item, &format!("target closed before merge: {reason}"), now);
            }
            Err(err) => CandidateOutcome::Failed { reason: err.to_string() },
        };
        if let Some(deferred_id) = item.deferred_id {
            if let Err(err) = store.clear_deferred(deferred_id) {
                tracing::warn!(%deferred_id, error = %err, "could not clear deferred candidate");
            }
        }
        outcome
    }
}

fn defer<S: RegisterStore>(store: &mut S, item: &IngestItem, reason: &str, now: OffsetDateTime) -> CandidateOutcome {
    let recorded = match item.deferred_id {
        Some(deferred_id) => store.record_deferred_failure(deferred_id, reason).map(|()| deferred_id),
        None => store.defer(item.candidate.clone(), reason, now).map(|deferred| deferred.deferred_id),
    };
    match recorded {
        Ok(deferred_id) => {
            tracing::warn!(%deferred_id, source = %item.candidate.source(), %reason, "candidate deferred");
            CandidateOutcome::Deferred { deferred_id, reason: reason.to_string() }
        }
        Err(err) => CandidateOutcome::Failed { reason: format!("could not defer candidate: {err}") },
    }
}

fn summarize(reports: &[CandidateReport]) -> IngestSummary {
    let mut summary = IngestSummary::default();
    for report in reports {
        match &report.outcome {
            CandidateOutcome::Reconciled { outcome, .. } => match outcome {
                Outcome::Created => summary.created += 1,
                Outcome::Revised { .. } => summary.revised += 1,
                Outcome::AlreadyRecorded { .. } => summary.unchanged += 1,
                Outcome::PendingCreated { .. } => summary.pending += 1,
            },
            CandidateOutcome::Deferred { .. } => summary.deferred += 1,
            CandidateOutcome::Failed { .. } => summary.failed += 1,
        }
    }
    summary
}
