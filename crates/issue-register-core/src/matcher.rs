use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::{MatcherConfig, MergeDetectionConfig};
use crate::error::{RegisterError, RegisterResult};
use crate::model::{CandidateStatement, Issue, IssueId, IssueStatus};
use crate::oracle::SimilarityOracle;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredMatch {
    pub issue_id: IssueId,
    pub score: f32,
    pub semantic_score: f32,
    pub domain_match: f32,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Text the oracle compares a candidate against.
#[must_use]
pub fn issue_match_text(issue: &Issue) -> String {
    let body = issue.state.body.match_text();
    if body.is_empty() {
        issue.state.title.clone()
    } else {
        format!("{}\n{body}", issue.state.title)
    }
}

/// Rank every non-closed issue against `candidate`, best first.
///
/// # Errors
/// Propagates [`RegisterError::OracleUnavailable`] from the oracle; the caller defers the candidate.
pub fn rank(
    candidate: &CandidateStatement,
    issues: &[Issue],
    oracle: &dyn SimilarityOracle,
    config: &MatcherConfig,
) -> RegisterResult<Vec<ScoredMatch>> {
    let candidate_domain = candidate.domain_signal();
    let mut ranked = Vec::new();
    for issue in issues.iter().filter(|issue| issue.state.status != IssueStatus::Closed) {
        let semantic_score = oracle.score(&candidate.text, &issue_match_text(issue))?;
        let domain_match = candidate_domain.map_or(0.0, |domain| {
            domain_alignment(domain, &issue.state.domain, config.hierarchy_credit)
        });
        ranked.push(ScoredMatch {
            issue_id: issue.id,
            score: combine(semantic_score, domain_match, config),
            semantic_score,
            domain_match,
            updated_at: issue.updated_at,
        });
    }
    ranked.sort_by(compare_matches);
    Ok(ranked)
}

/// Score desc, then most recently updated, then issue id.
#[must_use]
pub fn compare_matches(left: &ScoredMatch, right: &ScoredMatch) -> Ordering {
    right
        .score
        .total_cmp(&left.score)
        .then_with(|| right.updated_at.cmp(&left.updated_at))
        .then_with(|| left.issue_id.cmp(&right.issue_id))
}

fn combine(semantic: f32, domain: f32, config: &MatcherConfig) -> f32 {
    let total = config.semantic_weight + config.domain_weight;
    if total <= 0.0 {
        return 0.0;
    }
    ((config.semantic_weight * semantic + config.domain_weight * domain) / total).clamp(0.0, 1.0)
}

/// 1.0 for the same domain, `hierarchy_credit` when one `/`-path is an ancestor of the other.
#[must_use]
pub fn domain_alignment(left: &str, right: &str, hierarchy_credit: f32) -> f32 {
    let left = domain_path(left);
    let right = domain_path(right);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    if left == right {
        return 1.0;
    }
    let shorter = left.len().min(right.len());
    if left[..shorter] == right[..shorter] {
        hierarchy_credit
    } else {
        0.0
    }
}

fn domain_path(domain: &str) -> Vec<String> {
    domain
        .split('/')
        .map(|segment| segment.trim().to_lowercase())
        .filter(|segment| !segment.is_empty())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeSuggestion {
    pub left: IssueId,
    pub right: IssueId,
    pub score: f32,
}

/// Pairwise similarity between non-closed issues, at or above the configured threshold.
///
/// Suggestions only; nothing is merged.
///
/// # Errors
/// Returns [`RegisterError::Validation`] unless merge detection is enabled with a threshold,
/// and propagates oracle failures.
pub fn detect_merge_candidates(
    issues: &[Issue],
    oracle: &dyn SimilarityOracle,
    matcher: &MatcherConfig,
    detection: &MergeDetectionConfig,
) -> RegisterResult<Vec<MergeSuggestion>> {
    if !detection.enabled {
        return Err(RegisterError::Validation(
            "merge detection is disabled; enable merge_detection with an explicit threshold"
                .to_string(),
        ));
    }
    let Some(threshold) = detection.threshold else {
        return Err(RegisterError::Validation(
            "merge_detection.threshold MUST be set when merge detection is enabled".to_string(),
        ));
    };

    let mut open = issues
        .iter()
        .filter(|issue| issue.state.status != IssueStatus::Closed)
        .collect::<Vec<_>>();
    open.sort_by_key(|issue| issue.id);

    let mut suggestions = Vec::new();
    for (index, left) in open.iter().enumerate() {
        let left_text = issue_match_text(left);
        for right in &open[index + 1..] {
            let semantic = oracle.score(&left_text, &issue_match_text(right))?;
            let domain =
                domain_alignment(&left.state.domain, &right.state.domain, matcher.hierarchy_credit);
            let score = combine(semantic, domain, matcher);
            if score >= threshold {
                suggestions.push(MergeSuggestion { left: left.id, right: right.id, score });
            }
        }
    }
    suggestions.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.left.cmp(&b.left))
            .then_with(|| a.right.cmp(&b.right))
    });
    Ok(suggestions)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use ulid::Ulid;

    use super::*;
    use crate::model::{IssueState, SourceRef};
    use crate::oracle::testing::StubOracle;

    fn fixture_time(offset_secs: u64) -> OffsetDateTime {
        OffsetDateTime::from(UNIX_EPOCH + Duration::from_secs(1_700_000_000 + offset_secs))
    }

    fn fixture_issue(id: u128, title: &str, domain: &str, updated_offset: u64) -> Issue {
        Issue {
            id: IssueId(Ulid::from(id)),
            revision: 1,
            created_at: fixture_time(0),
            updated_at: fixture_time(updated_offset),
            state: IssueState::open_scr(title, domain, 0.5),
        }
    }

    #[test]
    fn domain_alignment_credits_exact_and_ancestor_paths() {
        assert!((domain_alignment("Supply Chain", "supply chain ", 0.5) - 1.0).abs() < f32::EPSILON);
        assert!((domain_alignment("Ops", "ops/vendors", 0.5) - 0.5).abs() < f32::EPSILON);
        assert!((domain_alignment("Ops/Vendors", "Ops", 0.25) - 0.25).abs() < f32::EPSILON);
        assert!(domain_alignment("Ops/Vendors", "Ops/Facilities", 0.5).abs() < f32::EPSILON);
        assert!(domain_alignment("", "Ops", 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn rank_orders_by_score_then_recency_then_id() -> RegisterResult<()> {
        let issues = vec![
            fixture_issue(3, "Stale twin", "IT", 10),
            fixture_issue(2, "Active twin", "IT", 50),
            fixture_issue(1, "Low", "IT", 90),
            fixture_issue(4, "Same recency", "IT", 50),
        ];
        let oracle = StubOracle::with(&[
            ("Stale twin", 0.7),
            ("Active twin", 0.7),
            ("Same recency", 0.7),
            ("Low", 0.1),
        ]);
        let candidate =
            CandidateStatement::new(SourceRef::document("doc"), "printer fleet", vec!["IT".to_string()]);
        let config = MatcherConfig { semantic_weight: 1.0, domain_weight: 0.0, hierarchy_credit: 0.5 };

        let ranked = rank(&candidate, &issues, &oracle, &config)?;
        let order = ranked.iter().map(|entry| entry.issue_id.0).collect::<Vec<_>>();
        assert_eq!(order, vec![Ulid::from(2), Ulid::from(4), Ulid::from(3), Ulid::from(1)]);
        Ok(())
    }

    #[test]
    fn rank_skips_closed_issues_and_blends_domain() -> RegisterResult<()> {
        let mut closed = fixture_issue(9, "Closed twin", "Finance", 5);
        closed.state.status = IssueStatus::Closed;
        let issues = vec![closed, fixture_issue(1, "Budget", "Finance/Capex", 5)];
        let oracle = StubOracle { fallback: 0.6, ..StubOracle::default() };
        let mut candidate =
            CandidateStatement::new(SourceRef::document("doc"), "capex freeze", vec![]);
        candidate.domain = Some("Finance".to_string());
        let config = MatcherConfig { semantic_weight: 0.5, domain_weight: 0.5, hierarchy_credit: 0.4 };

        let ranked = rank(&candidate, &issues, &oracle, &config)?;
        assert_eq!(ranked.len(), 1);
        assert!((ranked[0].score - 0.5).abs() < 1e-6);
        assert!((ranked[0].domain_match - 0.4).abs() < f32::EPSILON);
        Ok(())
    }

    #[test]
    fn oracle_failure_propagates() {
        let issues = vec![fixture_issue(1, "Budget", "Finance", 5)];
        let candidate = CandidateStatement::new(SourceRef::document("doc"), "capex", vec![]);
        let result = rank(&candidate, &issues, &StubOracle::failing(), &MatcherConfig::default());
        assert!(matches!(result, Err(RegisterError::OracleUnavailable(_))));
    }

    #[test]
    fn merge_detection_is_disabled_by_default() {
        let issues = vec![fixture_issue(1, "A", "IT", 1), fixture_issue(2, "B", "IT", 1)];
        let result = detect_merge_candidates(
            &issues,
            &StubOracle::default(),
            &MatcherConfig::default(),
            &MergeDetectionConfig::default(),
        );
        assert!(matches!(result, Err(RegisterError::Validation(_))));
    }

    #[test]
    fn merge_detection_reports_pairs_above_threshold() -> RegisterResult<()> {
        let issues = vec![
            fixture_issue(1, "Printer fleet aging", "IT", 1),
            fixture_issue(2, "Printer fleet old", "IT", 1),
            fixture_issue(3, "Budget freeze", "Finance", 1),
        ];
        let oracle = StubOracle::with(&[("Printer", 0.9)]);
        let detection = MergeDetectionConfig { enabled: true, threshold: Some(0.85) };
        let suggestions =
            detect_merge_candidates(&issues, &oracle, &MatcherConfig::default(), &detection)?;
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].left.0, Ulid::from(1));
        assert_eq!(suggestions[0].right.0, Ulid::from(2));
        Ok(())
    }
}
