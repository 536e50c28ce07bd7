use serde::{Deserialize, Serialize};

use crate::error::RegisterError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegisterConfig {
    pub matcher: MatcherConfig,
    pub classifier: ClassifierConfig,
    pub agenda: AgendaConfig,
    pub oracle: OracleConfig,
    pub ingest: IngestConfig,
    pub merge_detection: MergeDetectionConfig,
}

impl RegisterConfig {
    /// Validate every section.
    ///
    /// # Errors
    /// Returns [`RegisterError::Validation`] naming the first offending option.
    pub fn validate(&self) -> Result<(), RegisterError> {
        self.matcher.validate()?;
        self.classifier.validate()?;
        self.agenda.validate()?;
        self.oracle.validate()?;
        self.ingest.validate()?;
        self.merge_detection.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatcherConfig {
    pub semantic_weight: f32,
    pub domain_weight: f32,
    /// Domain credit when one domain path is an ancestor of the other.
    pub hierarchy_credit: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self { semantic_weight: 0.85, domain_weight: 0.15, hierarchy_credit: 0.5 }
    }
}

impl MatcherConfig {
    fn validate(&self) -> Result<(), RegisterError> {
        let weights = [self.semantic_weight, self.domain_weight];
        if weights.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
            return Err(RegisterError::Validation(
                "matcher weights MUST be finite and non-negative".to_string(),
            ));
        }
        if self.semantic_weight + self.domain_weight <= 0.0 {
            return Err(RegisterError::Validation(
                "matcher weights MUST have a positive sum".to_string(),
            ));
        }
        unit_interval("matcher.hierarchy_credit", self.hierarchy_credit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifierConfig {
    pub t_high: f32,
    pub t_low: f32,
    pub new_issue: NewIssueConfidence,
    /// Scales how far one piece of evidence moves an existing issue's confidence.
    pub reinforcement: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { t_high: 0.8, t_low: 0.4, new_issue: NewIssueConfidence::default(), reinforcement: 0.5 }
    }
}

impl ClassifierConfig {
    fn validate(&self) -> Result<(), RegisterError> {
        unit_interval("classifier.t_low", self.t_low)?;
        unit_interval("classifier.t_high", self.t_high)?;
        if self.t_low >= self.t_high {
            return Err(RegisterError::Validation(
                "classifier.t_low MUST be strictly below classifier.t_high".to_string(),
            ));
        }
        unit_interval("classifier.reinforcement", self.reinforcement)?;
        self.new_issue.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NewIssueConfidence {
    pub base: f32,
    pub per_theme: f32,
    pub max_themes: usize,
    pub domain_bonus: f32,
    pub cap: f32,
}

impl Default for NewIssueConfidence {
    fn default() -> Self {
        Self { base: 0.3, per_theme: 0.1, max_themes: 3, domain_bonus: 0.1, cap: 0.9 }
    }
}

impl NewIssueConfidence {
    fn validate(&self) -> Result<(), RegisterError> {
        unit_interval("classifier.new_issue.base", self.base)?;
        unit_interval("classifier.new_issue.per_theme", self.per_theme)?;
        unit_interval("classifier.new_issue.domain_bonus", self.domain_bonus)?;
        unit_interval("classifier.new_issue.cap", self.cap)
    }
}

/// Largest agenda look-around window, in days.
pub const MAX_WINDOW_DAYS: u32 = 3650;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgendaConfig {
    pub window_days: u32,
    pub minutes_per_hypothesis: u32,
    pub max_item_minutes: u32,
}

impl Default for AgendaConfig {
    fn default() -> Self {
        Self { window_days: 7, minutes_per_hypothesis: 5, max_item_minutes: 30 }
    }
}

impl AgendaConfig {
    fn validate(&self) -> Result<(), RegisterError> {
        if self.window_days == 0 || self.window_days > MAX_WINDOW_DAYS {
            return Err(RegisterError::Validation(format!("agenda.window_days MUST be in 1..={MAX_WINDOW_DAYS}")));
        }
        if self.minutes_per_hypothesis == 0 || self.max_item_minutes < self.minutes_per_hypothesis {
            return Err(RegisterError::Validation(
                "agenda.max_item_minutes MUST be >= agenda.minutes_per_hypothesis > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    #[default]
    Lexical,
    HttpEmbedding,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    pub kind: OracleKind,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            kind: OracleKind::Lexical,
            timeout_ms: 5_000,
            max_retries: 2,
            retry_delay_ms: 250,
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl OracleConfig {
    fn validate(&self) -> Result<(), RegisterError> {
        if self.timeout_ms == 0 {
            return Err(RegisterError::Validation("oracle.timeout_ms MUST be > 0".to_string()));
        }
        if self.kind == OracleKind::HttpEmbedding
            && (self.endpoint.trim().is_empty() || self.model.trim().is_empty())
        {
            return Err(RegisterError::Validation(
                "oracle.endpoint and oracle.model MUST be set for http_embedding".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    pub workers: usize,
    /// How many times a stale ExistingMatch proposal is re-derived before the candidate fails.
    pub rederive_attempts: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { workers: 4, rederive_attempts: 3 }
    }
}

impl IngestConfig {
    fn validate(&self) -> Result<(), RegisterError> {
        if self.workers == 0 {
            return Err(RegisterError::Validation("ingest.workers MUST be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeDetectionConfig {
    pub enabled: bool,
    pub threshold: Option<f32>,
}

impl MergeDetectionConfig {
    fn validate(&self) -> Result<(), RegisterError> {
        match (self.enabled, self.threshold) {
            (true, None) => Err(RegisterError::Validation(
                "merge_detection.threshold MUST be set when merge detection is enabled".to_string(),
            )),
            (_, Some(threshold)) => unit_interval("merge_detection.threshold", threshold),
            (false, None) => Ok(()),
        }
    }
}

fn unit_interval(name: &str, value: f32) -> Result<(), RegisterError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(RegisterError::Validation(format!("{name} MUST be in [0.0, 1.0]")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(RegisterConfig::default().validate(), Ok(()));
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let mut config = RegisterConfig::default();
        config.classifier.t_low = 0.8;
        config.classifier.t_high = 0.8;
        match config.validate() {
            Err(RegisterError::Validation(message)) => {
                assert!(message.contains("t_low MUST be strictly below"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn enabled_merge_detection_requires_threshold() {
        let mut config = RegisterConfig::default();
        config.merge_detection.enabled = true;
        assert!(config.validate().is_err());
        config.merge_detection.threshold = Some(0.9);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_weight_sum_is_rejected() {
        let mut config = RegisterConfig::default();
        config.matcher.semantic_weight = 0.0;
        config.matcher.domain_weight = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn agenda_window_is_bounded() {
        let mut config = RegisterConfig::default();
        config.agenda.window_days = MAX_WINDOW_DAYS;
        assert_eq!(config.validate(), Ok(()));
        config.agenda.window_days = u32::MAX;
        match config.validate() {
            Err(RegisterError::Validation(message)) => assert!(message.contains("agenda.window_days")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
