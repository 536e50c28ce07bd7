use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use issue_register_core::{OracleConfig, RegisterError, RegisterResult, SimilarityOracle};
use serde::Deserialize;
use serde_json::json;

/// Cosine similarity over embeddings from an OpenAI-compatible `/embeddings` endpoint.
///
/// Embeddings are cached per text for the lifetime of the oracle, so one ingestion
/// run embeds each issue once.
pub struct HttpEmbeddingOracle {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl HttpEmbeddingOracle {
    /// Build from oracle settings. The API key is read from the configured environment
    /// variable; when unset, requests carry no `Authorization` header.
    #[must_use]
    pub fn from_config(config: &OracleConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|key| !key.trim().is_empty());
        let agent = ureq::AgentBuilder::new().timeout(Duration::from_millis(config.timeout_ms)).build();
        Self {
            agent,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn embed(&self, texts: &[&str]) -> RegisterResult<Vec<Vec<f32>>> {
        let mut missing = Vec::new();
        {
            let cache = self.lock_cache()?;
            for text in texts {
                if !cache.contains_key(*text) && !missing.contains(text) {
                    missing.push(*text);
                }
            }
        }

        if !missing.is_empty() {
            let fetched = self.request(&missing)?;
            let mut cache = self.lock_cache()?;
            for (text, embedding) in missing.iter().zip(fetched) {
                cache.insert((*text).to_string(), embedding);
            }
        }

        let cache = self.lock_cache()?;
        texts
            .iter()
            .map(|text| {
                cache.get(*text).cloned().ok_or_else(|| {
                    RegisterError::OracleUnavailable("embedding missing from response".to_string())
                })
            })
            .collect()
    }

    fn request(&self, inputs: &[&str]) -> RegisterResult<Vec<Vec<f32>>> {
        let mut request = self.agent.post(&self.endpoint);
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }
        let response = request
            .send_json(json!({ "model": self.model, "input": inputs }))
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => {
                    RegisterError::OracleUnavailable(format!("embedding endpoint returned HTTP {code}"))
                }
                ureq::Error::Transport(transport) => {
                    RegisterError::OracleUnavailable(format!("embedding request failed: {transport}"))
                }
            })?;
        let body: EmbeddingResponse = response
            .into_json()
            .map_err(|err| RegisterError::OracleUnavailable(format!("invalid embedding response: {err}")))?;
        order_embeddings(body, inputs.len())
    }

    fn lock_cache(&self) -> RegisterResult<std::sync::MutexGuard<'_, HashMap<String, Vec<f32>>>> {
        self.cache
            .lock()
            .map_err(|_| RegisterError::OracleUnavailable("embedding cache lock poisoned".to_string()))
    }
}

impl SimilarityOracle for HttpEmbeddingOracle {
    fn score(&self, left: &str, right: &str) -> RegisterResult<f32> {
        let embeddings = self.embed(&[left, right])?;
        Ok(cosine_similarity(&embeddings[0], &embeddings[1]).clamp(0.0, 1.0))
    }
}

fn order_embeddings(body: EmbeddingResponse, expected: usize) -> RegisterResult<Vec<Vec<f32>>> {
    if body.data.len() != expected {
        return Err(RegisterError::OracleUnavailable(format!(
            "embedding response has {} vectors, expected {expected}",
            body.data.len()
        )));
    }
    let mut data = body.data.into_iter().enumerate().collect::<Vec<_>>();
    data.sort_by_key(|(position, datum)| datum.index.unwrap_or(*position));
    Ok(data.into_iter().map(|(_, datum)| datum.embedding).collect())
}

/// Cosine of the angle between `a` and `b`; 0 for mismatched or zero vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}
