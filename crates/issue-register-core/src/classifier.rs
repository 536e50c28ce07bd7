use serde::{Deserialize, Serialize};

use crate::config::{ClassifierConfig, NewIssueConfidence};
use crate::matcher::ScoredMatch;
use crate::model::{CandidateStatement, IssueId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    NewIssue { confidence: f32, rationale: String },
    PossibleMatch { issue_id: IssueId, confidence: f32, rationale: String },
    ExistingMatch { issue_id: IssueId, confidence: f32, rationale: String },
}

impl Decision {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewIssue { .. } => "new_issue",
            Self::PossibleMatch { .. } => "possible_match",
            Self::ExistingMatch { .. } => "existing_match",
        }
    }

    #[must_use]
    pub fn target(&self) -> Option<IssueId> {
        match self {
            Self::NewIssue { .. } => None,
            Self::PossibleMatch { issue_id, .. } | Self::ExistingMatch { issue_id, .. } => {
                Some(*issue_id)
            }
        }
    }

    #[must_use]
    pub fn confidence(&self) -> f32 {
        match self {
            Self::NewIssue { confidence, .. }
            | Self::PossibleMatch { confidence, .. }
            | Self::ExistingMatch { confidence, .. } => *confidence,
        }
    }

    #[must_use]
    pub fn rationale(&self) -> &str {
        match self {
            Self::NewIssue { rationale, .. }
            | Self::PossibleMatch { rationale, .. }
            | Self::ExistingMatch { rationale, .. } => rationale,
        }
    }
}

/// Apply the two-threshold decision rule to an already ranked match list.
///
/// `ranked` must be ordered best first, as [`crate::matcher::rank`] returns it.
#[must_use]
pub fn classify(
    candidate: &CandidateStatement,
    ranked: &[ScoredMatch],
    config: &ClassifierConfig,
) -> Decision {
    let Some(top) = ranked.first() else {
        return Decision::NewIssue {
            confidence: new_issue_confidence(candidate, &config.new_issue),
            rationale: "no open issues to match against".to_string(),
        };
    };

    let detail = format!(
        "top score {:.3} (semantic {:.3}, domain {:.3}) against issue {}",
        top.score, top.semantic_score, top.domain_match, top.issue_id
    );
    let decision = if top.score >= config.t_high {
        Decision::ExistingMatch {
            issue_id: top.issue_id,
            confidence: top.score,
            rationale: format!("{detail} meets t_high {:.3}", config.t_high),
        }
    } else if top.score >= config.t_low {
        Decision::PossibleMatch {
            issue_id: top.issue_id,
            confidence: top.score,
            rationale: format!(
                "{detail} is between t_low {:.3} and t_high {:.3}; needs confirmation",
                config.t_low, config.t_high
            ),
        }
    } else {
        Decision::NewIssue {
            confidence: new_issue_confidence(candidate, &config.new_issue),
            rationale: format!("{detail} is below t_low {:.3}", config.t_low),
        }
    };
    tracing::debug!(decision = decision.kind(), rationale = decision.rationale(), "classified candidate");
    decision
}

/// Confidence from the candidate's own theme and domain signal.
#[must_use]
pub fn new_issue_confidence(candidate: &CandidateStatement, policy: &NewIssueConfidence) -> f32 {
    let themes = candidate.distinct_theme_count().min(policy.max_themes);
    let has_domain =
        candidate.domain.as_deref().is_some_and(|domain| !domain.trim().is_empty());
    #[allow(clippy::cast_precision_loss)]
    let theme_signal = policy.per_theme * themes as f32;
    let domain_signal = if has_domain { policy.domain_bonus } else { 0.0 };
    (policy.base + theme_signal + domain_signal).clamp(0.0, policy.cap)
}
