//! Text-generation collaborators.
//!
//! The planner only ever sees [`TextGenerator`]: prompt in, text out. Calls go
//! through [`generate_bounded`] (per-attempt timeout, bounded retries) and, for
//! reproducible re-plans, through [`GenerationContext`], which caches accepted
//! outputs keyed by prompt hash and model.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use linkweave_shared::{AppConfig, GenerationPolicy, LinkweaveError, Result, resolve_api_key};
use linkweave_storage::Storage;

/// Narrow interface over a generative text service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Model identifier, part of the cache key.
    fn model_id(&self) -> &str;

    /// Whether calls can succeed at all (an offline generator never can).
    fn is_available(&self) -> bool {
        true
    }

    /// Generate text for `prompt`. Timeouts and retries belong to the caller.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// OpenRouter
// ---------------------------------------------------------------------------

/// OpenAI-compatible chat completions client pointed at OpenRouter.
pub struct OpenRouterGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenRouterGenerator {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert("X-Title", header::HeaderValue::from_static("linkweave"));

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| LinkweaveError::Generation(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Build from the `[openrouter]` config section, reading the API key from
    /// the configured environment variable.
    pub fn from_config(config: &AppConfig, model: Option<&str>) -> Result<Self> {
        let api_key = resolve_api_key(config)?;
        Self::new(
            config.openrouter.base_url.as_str(),
            model.unwrap_or(&config.openrouter.default_model),
            api_key,
        )
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

#[async_trait]
impl TextGenerator for OpenRouterGenerator {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(self.chat_completions_url())
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| LinkweaveError::Generation(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(200).collect();
            return Err(LinkweaveError::Generation(format!(
                "openrouter returned {status}: {excerpt}"
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| LinkweaveError::Generation(format!("invalid response: {e}")))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LinkweaveError::Generation("empty completion".into()))
    }
}

/// Generator used with `--offline`: every call fails, so fallback edges
/// degrade to unplaced unless a cached rewrite exists.
pub struct OfflineGenerator;

#[async_trait]
impl TextGenerator for OfflineGenerator {
    fn model_id(&self) -> &str {
        "offline"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(LinkweaveError::Generation(
            "generation is disabled in offline mode".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Bounded calls and caching
// ---------------------------------------------------------------------------

/// Call `generator` with a per-attempt timeout and linear backoff between
/// at most `policy.max_attempts` attempts.
pub async fn generate_bounded(
    generator: &dyn TextGenerator,
    prompt: &str,
    policy: &GenerationPolicy,
) -> Result<String> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, generator.generate(prompt)).await {
            Ok(Ok(text)) => return Ok(text),
            Ok(Err(e)) => {
                warn!(attempt, model = generator.model_id(), error = %e, "generation attempt failed");
                last_error = Some(e);
            }
            Err(_) => {
                warn!(attempt, model = generator.model_id(), "generation attempt timed out");
                last_error = Some(LinkweaveError::Generation(format!(
                    "timed out after {:?}",
                    policy.timeout
                )));
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.backoff * attempt).await;
        }
    }

    Err(last_error.unwrap_or_else(|| LinkweaveError::Generation("no attempt made".into())))
}

/// Compute a prompt hash for cache keying.
pub fn prompt_hash(prompt: &str, kind: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A generator plus its call policy and optional result cache.
pub struct GenerationContext<'a> {
    generator: &'a dyn TextGenerator,
    policy: &'a GenerationPolicy,
    cache: Option<&'a Storage>,
}

impl<'a> GenerationContext<'a> {
    pub fn new(
        generator: &'a dyn TextGenerator,
        policy: &'a GenerationPolicy,
        cache: Option<&'a Storage>,
    ) -> Self {
        Self {
            generator,
            policy,
            cache,
        }
    }

    pub fn model_id(&self) -> &str {
        self.generator.model_id()
    }

    /// Generate (or reuse) an output for `prompt` that `accept` turns into a
    /// value. Only accepted outputs are cached; a rejected output is an error.
    pub async fn complete<T, F>(&self, kind: &str, prompt: &str, accept: F) -> Result<T>
    where
        F: Fn(&str) -> Option<T> + Send + Sync,
    {
        let hash = prompt_hash(prompt, kind);
        let model = self.generator.model_id();

        if let Some(storage) = self.cache {
            if let Some(cached) = storage.get_generation_cache(&hash, model).await? {
                if let Some(value) = accept(&cached) {
                    debug!(kind, model, "generation cache hit");
                    return Ok(value);
                }
            }
        }

        if !self.generator.is_available() {
            return Err(LinkweaveError::Generation(format!(
                "generator {model} is unavailable"
            )));
        }

        let output = generate_bounded(self.generator, prompt, self.policy).await?;
        let value = accept(&output).ok_or_else(|| {
            LinkweaveError::Generation(format!("unusable {kind} output from {model}"))
        })?;

        if let Some(storage) = self.cache {
            if let Err(e) = storage
                .set_generation_cache(kind, &hash, model, &output)
                .await
            {
                warn!(error = %e, "failed to cache generation result");
            }
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Term enrichment
// ---------------------------------------------------------------------------

/// Widens a target's anchor pool with variations of its primary term.
#[async_trait]
pub trait TermEnricher: Send + Sync {
    /// Identifier used as the cache model key.
    fn id(&self) -> &str;

    /// Ranked variations of `term`.
    async fn variations(&self, term: &str) -> Result<Vec<String>>;
}

/// Term enrichment backed by a [`TextGenerator`].
pub struct LlmTermEnricher {
    generator: Arc<dyn TextGenerator>,
    policy: GenerationPolicy,
    id: String,
    max_variations: usize,
}

impl LlmTermEnricher {
    pub fn new(generator: Arc<dyn TextGenerator>, policy: GenerationPolicy) -> Self {
        let id = format!("enrich:{}", generator.model_id());
        Self {
            generator,
            policy,
            id,
            max_variations: 5,
        }
    }
}

#[async_trait]
impl TermEnricher for LlmTermEnricher {
    fn id(&self) -> &str {
        &self.id
    }

    async fn variations(&self, term: &str) -> Result<Vec<String>> {
        if !self.generator.is_available() {
            return Ok(Vec::new());
        }
        let prompt = enrichment_prompt(term, self.max_variations);
        let output = generate_bounded(self.generator.as_ref(), &prompt, &self.policy).await?;
        Ok(parse_variations(&output, term, self.max_variations))
    }
}

pub(crate) fn enrichment_prompt(term: &str, max: usize) -> String {
    format!(
        "List up to {max} short search phrases (2 to 6 words) that are close variations of \
         \"{term}\" and could serve as link text pointing at a page about it. \
         One phrase per line, most relevant first, no numbering, no commentary."
    )
}

/// One variation per line; bullets, numbering and quotes are stripped.
pub(crate) fn parse_variations(output: &str, term: &str, max: usize) -> Vec<String> {
    let term_key = linkweave_shared::anchor_key(term);
    let mut seen = std::collections::HashSet::new();
    output
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || "-*•.) ".contains(c))
                .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
                .trim()
        })
        .filter(|line| !line.is_empty() && line.split_whitespace().count() <= 8)
        .filter(|line| {
            let key = linkweave_shared::anchor_key(line);
            key != term_key && seen.insert(key)
        })
        .take(max)
        .map(String::from)
        .collect()
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::testing::ScriptedGenerator;
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(attempts: u32) -> GenerationPolicy {
        GenerationPolicy {
            timeout: Duration::from_millis(200),
            max_attempts: attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn openrouter_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "rewritten"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let generator =
            OpenRouterGenerator::new(format!("{}/api/v1/", server.uri()), "test/model", "test-key")
                .unwrap();
        assert_eq!(generator.model_id(), "test/model");
        assert_eq!(generator.generate("prompt").await.unwrap(), "rewritten");
    }

    #[tokio::test]
    async fn openrouter_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let generator = OpenRouterGenerator::new(server.uri(), "m", "k").unwrap();
        let err = generator.generate("prompt").await.unwrap_err();
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("slow down"));
    }

    #[tokio::test]
    async fn bounded_generation_retries_then_succeeds() {
        let generator = ScriptedGenerator::new(vec![
            Err(LinkweaveError::Generation("flaky".into())),
            Ok("done".into()),
        ]);
        let text = generate_bounded(&generator, "p", &fast_policy(3)).await.unwrap();
        assert_eq!(text, "done");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bounded_generation_gives_up_after_max_attempts() {
        let generator = ScriptedGenerator::new(vec![]);
        let err = generate_bounded(&generator, "p", &fast_policy(2)).await.unwrap_err();
        assert!(matches!(err, LinkweaveError::Generation(_)));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    struct Sleeper;

    #[async_trait]
    impl TextGenerator for Sleeper {
        fn model_id(&self) -> &str {
            "sleeper"
        }

        async fn generate(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".into())
        }
    }

    #[tokio::test]
    async fn bounded_generation_times_out() {
        let policy = GenerationPolicy {
            timeout: Duration::from_millis(20),
            max_attempts: 1,
            backoff: Duration::ZERO,
        };
        let err = generate_bounded(&Sleeper, "p", &policy).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn context_caches_accepted_outputs_only() {
        let tmp = std::env::temp_dir().join(format!("lw_gen_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.unwrap();
        let policy = fast_policy(1);

        let generator = ScriptedGenerator::new(vec![Ok("bad".into()), Ok("good".into())]);
        let ctx = GenerationContext::new(&generator, &policy, Some(&storage));
        let accept = |s: &str| (s == "good").then(|| s.to_string());

        assert!(ctx.complete("rewrite", "prompt", accept).await.is_err());
        assert_eq!(ctx.complete("rewrite", "prompt", accept).await.unwrap(), "good");

        // A later run with a silent generator of the same model reuses the cache.
        let silent = ScriptedGenerator::new(vec![]);
        let ctx = GenerationContext::new(&silent, &policy, Some(&storage));
        assert_eq!(ctx.complete("rewrite", "prompt", accept).await.unwrap(), "good");
        assert_eq!(silent.calls.load(Ordering::SeqCst), 0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

        // A different model id misses the cache.
        let ctx = GenerationContext::new(&OfflineGenerator, &policy, Some(&storage));
        assert!(ctx.complete("rewrite", "prompt", accept).await.is_err());
    }

    #[tokio::test]
    async fn offline_generator_is_never_called() {
        let policy = fast_policy(3);
        let ctx = GenerationContext::new(&OfflineGenerator, &policy, None);
        let err = ctx
            .complete("rewrite", "p", |s: &str| Some(s.to_string()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }

    #[tokio::test]
    async fn llm_enricher_parses_one_variation_per_line() {
        let generator: Arc<dyn TextGenerator> = Arc::new(ScriptedGenerator::new(vec![Ok(
            "1. Trail Shoes\n- \"off road runners\"\n\ntrail running shoes\nTRAIL SHOES\n".into(),
        )]));
        let enricher = LlmTermEnricher::new(generator, fast_policy(1));
        assert_eq!(enricher.id(), "enrich:scripted");
        let variations = enricher.variations("trail running shoes").await.unwrap();
        assert_eq!(variations, vec!["Trail Shoes", "off road runners"]);
    }
}
