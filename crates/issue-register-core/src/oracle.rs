use std::collections::BTreeSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::OracleConfig;
use crate::error::{RegisterError, RegisterResult};

/// Semantic similarity between two texts, in `[0, 1]`.
///
/// Implementations fail with [`RegisterError::OracleUnavailable`] on timeout,
/// network or quota errors.
pub trait SimilarityOracle: Send + Sync {
    /// Score how similar `left` and `right` are.
    ///
    /// # Errors
    /// Returns [`RegisterError::OracleUnavailable`] when no score can be produced.
    fn score(&self, left: &str, right: &str) -> RegisterResult<f32>;
}

impl<T: SimilarityOracle + ?Sized> SimilarityOracle for Arc<T> {
    fn score(&self, left: &str, right: &str) -> RegisterResult<f32> {
        (**self).score(left, right)
    }
}

/// Deterministic token-overlap (Dice) similarity. Needs no network.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalOracle;

impl SimilarityOracle for LexicalOracle {
    fn score(&self, left: &str, right: &str) -> RegisterResult<f32> {
        let left_terms = tokenize_terms(left);
        let right_terms = tokenize_terms(right);
        if left_terms.is_empty() || right_terms.is_empty() {
            return Ok(0.0);
        }
        let shared = left_terms.intersection(&right_terms).count();
        #[allow(clippy::cast_precision_loss)]
        let score = (2 * shared) as f32 / (left_terms.len() + right_terms.len()) as f32;
        Ok(score.clamp(0.0, 1.0))
    }
}

pub(crate) fn tokenize_terms(value: &str) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    for raw in value.split_whitespace() {
        let normalized = raw
            .chars()
            .filter(|ch| ch.is_alphanumeric() || *ch == '_' || *ch == '-')
            .collect::<String>()
            .to_lowercase();
        if normalized.chars().count() >= 2 {
            terms.insert(normalized);
        }
    }
    terms
}

/// Wraps an oracle with a per-call timeout and bounded retries with linear backoff.
pub struct GuardedOracle {
    inner: Arc<dyn SimilarityOracle>,
    timeout: Duration,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl GuardedOracle {
    #[must_use]
    pub fn new(inner: Arc<dyn SimilarityOracle>, config: &OracleConfig) -> Self {
        Self {
            inner,
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        }
    }

    fn attempt(&self, left: &str, right: &str) -> RegisterResult<f32> {
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let left = left.to_string();
        let right = right.to_string();
        thread::Builder::new()
            .name("similarity-oracle".to_string())
            .spawn(move || {
                // Receiver may already have timed out; nothing to do then.
                let _ = sender.send(inner.score(&left, &right));
            })
            .map_err(|err| RegisterError::OracleUnavailable(format!("spawn failed: {err}")))?;

        match receiver.recv_timeout(self.timeout) {
            Ok(Ok(score)) if score.is_finite() && (0.0..=1.0).contains(&score) => Ok(score),
            Ok(Ok(score)) => {
                Err(RegisterError::OracleUnavailable(format!("score {score} outside [0, 1]")))
            }
            Ok(Err(err)) => Err(err),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(RegisterError::OracleUnavailable(format!(
                "timed out after {}ms",
                self.timeout.as_millis()
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(RegisterError::OracleUnavailable("oracle worker panicked".to_string()))
            }
        }
    }
}

impl SimilarityOracle for GuardedOracle {
    fn score(&self, left: &str, right: &str) -> RegisterResult<f32> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.attempt(left, right) {
                Ok(score) => return Ok(score),
                Err(RegisterError::OracleUnavailable(reason)) => {
                    tracing::warn!(attempt, max_retries = self.max_retries, %reason, "similarity oracle call failed");
                    last_error = Some(reason);
                    if attempt < self.max_retries {
                        thread::sleep(Duration::from_millis(
                            self.retry_delay_ms * (u64::from(attempt) + 1),
                        ));
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(RegisterError::OracleUnavailable(format!(
            "gave up after {} attempts: {}",
            self.max_retries + 1,
            last_error.unwrap_or_default()
        )))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::{RegisterError, RegisterResult, SimilarityOracle};

    /// Scores by the first key contained in the right-hand text; everything else scores `fallback`.
    #[derive(Debug, Default)]
    pub(crate) struct StubOracle {
        pub scores: BTreeMap<String, f32>,
        pub fallback: f32,
        pub failing: bool,
        pub calls: AtomicU32,
    }

    impl StubOracle {
        pub(crate) fn with(entries: &[(&str, f32)]) -> Self {
            Self {
                scores: entries.iter().map(|(key, score)| ((*key).to_string(), *score)).collect(),
                ..Self::default()
            }
        }

        pub(crate) fn failing() -> Self {
            Self { failing: true, ..Self::default() }
        }
    }

    impl SimilarityOracle for StubOracle {
        fn score(&self, _left: &str, right: &str) -> RegisterResult<f32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                return Err(RegisterError::OracleUnavailable("quota exceeded".to_string()));
            }
            Ok(self
                .scores
                .iter()
                .find(|(key, _)| right.contains(key.as_str()))
                .map_or(self.fallback, |(_, score)| *score))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::StubOracle;
    use super::*;

    struct SlowOracle;

    impl SimilarityOracle for SlowOracle {
        fn score(&self, _left: &str, _right: &str) -> RegisterResult<f32> {
            thread::sleep(Duration::from_millis(200));
            Ok(0.5)
        }
    }

    fn fast_config(max_retries: u32) -> OracleConfig {
        OracleConfig { timeout_ms: 50, max_retries, retry_delay_ms: 1, ..OracleConfig::default() }
    }

    #[test]
    fn lexical_oracle_scores_overlap() -> RegisterResult<()> {
        let oracle = LexicalOracle;
        assert!((oracle.score("Vendor X delivery risk", "vendor x delivery risk")? - 1.0).abs() < f32::EPSILON);
        assert!(oracle.score("Vendor delivery", "Budget freeze")?.abs() < f32::EPSILON);
        let partial = oracle.score("Vendor delivery late", "Vendor delivery risk")?;
        assert!(partial > 0.5 && partial < 1.0);
        Ok(())
    }

    #[test]
    fn guarded_oracle_retries_then_surfaces_unavailable() {
        let stub = Arc::new(StubOracle::failing());
        let guarded = GuardedOracle::new(stub.clone(), &fast_config(2));
        match guarded.score("a", "b") {
            Err(RegisterError::OracleUnavailable(message)) => {
                assert!(message.contains("gave up after 3 attempts"));
            }
            other => panic!("expected OracleUnavailable, got {other:?}"),
        }
        assert_eq!(stub.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn guarded_oracle_times_out_slow_calls() {
        let guarded = GuardedOracle::new(Arc::new(SlowOracle), &fast_config(0));
        match guarded.score("a", "b") {
            Err(RegisterError::OracleUnavailable(message)) => assert!(message.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn guarded_oracle_passes_scores_through() -> RegisterResult<()> {
        let guarded =
            GuardedOracle::new(Arc::new(StubOracle::with(&[("Vendor", 0.92)])), &fast_config(1));
        assert!((guarded.score("x", "Vendor X")? - 0.92).abs() < f32::EPSILON);
        Ok(())
    }
}
