//! Talks to OpenAI-compatible or Anthropic-native APIs for LLM calls,
//! and OpenAI-compatible APIs for embeddings.
//! All optional — see AiConfig::from_env().

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::HmlrError;

const AI_TIMEOUT: Duration = Duration::from_secs(30);

fn ai_err(msg: impl Into<String>) -> HmlrError {
    HmlrError::AiBackend(msg.into())
}

/// Classify an HTTP failure: auth/quota rejections are permanent, the
/// rest are retryable backend errors.
fn status_err(status: reqwest::StatusCode, body: String) -> HmlrError {
    if status.as_u16() == 401 || status.as_u16() == 403 || status.as_u16() == 429 {
        HmlrError::AiRejected(format!("{status}: {body}"))
    } else {
        HmlrError::AiBackend(format!("{status}: {body}"))
    }
}

/// Which LLM API wire format to use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Anthropic,
}

/// Model tier selected per call: the large default model writes chat
/// responses; the small governor model does routing, filtering, metadata,
/// and extraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelTier {
    Default,
    Governor,
}

#[derive(Clone)]
pub struct AiConfig {
    pub provider: LlmProvider,
    pub llm_url: String,
    pub llm_key: String,
    pub default_model: String,
    pub governor_model: String,
    pub embed_url: String,
    pub embed_key: String,
    pub embed_model: String,
    pub embed_dimensions: usize,
    pub client: reqwest::Client,
}

impl AiConfig {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Default => &self.default_model,
            ModelTier::Governor => &self.governor_model,
        }
    }

    /// Returns `None` if `HMLR_LLM_URL` is not set.
    pub fn from_env(embed_dimensions: usize) -> Option<Self> {
        let llm_url = std::env::var("HMLR_LLM_URL").ok()?;
        let llm_key = std::env::var("HMLR_LLM_KEY").unwrap_or_default();
        let default_model =
            std::env::var("HMLR_LLM_MODEL").unwrap_or_else(|_| "gpt-4o".into());
        let governor_model =
            std::env::var("HMLR_GOVERNOR_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());

        let provider = match std::env::var("HMLR_LLM_PROVIDER").unwrap_or_default().to_lowercase().as_str()
        {
            "anthropic" | "claude" => LlmProvider::Anthropic,
            _ => LlmProvider::OpenAI,
        };

        let embed_url = std::env::var("HMLR_EMBED_URL").unwrap_or_else(|_| {
            if llm_url.contains("/chat/completions") {
                llm_url.replace("/chat/completions", "/embeddings")
            } else {
                format!("{}/embeddings", llm_url.trim_end_matches('/'))
            }
        });
        let embed_key = std::env::var("HMLR_EMBED_KEY").unwrap_or_else(|_| llm_key.clone());
        let embed_model = std::env::var("HMLR_EMBED_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".into());

        let client = reqwest::Client::builder()
            .timeout(AI_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Some(Self {
            provider,
            llm_url,
            llm_key,
            default_model,
            governor_model,
            embed_url,
            embed_key,
            embed_model,
            embed_dimensions,
            client,
        })
    }
}

// ---------------------------------------------------------------------------
// OpenAI wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ToolDef {
    #[serde(rename = "type")]
    tool_type: String,
    function: FunctionDef,
}

#[derive(Serialize)]
struct FunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: ToolCallFunction,
}

#[derive(Deserialize)]
struct ToolCallFunction {
    arguments: String,
}

// ---------------------------------------------------------------------------
// Anthropic wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
}

impl AnthropicUsage {
    fn to_usage(&self) -> Usage {
        let cached = self.cache_read_input_tokens.unwrap_or(0);
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            prompt_tokens_details: if cached > 0 {
                Some(PromptTokensDetails { cached_tokens: cached })
            } else {
                None
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u32,
}

pub struct LlmResult {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
    pub duration_ms: u64,
}

pub struct ToolCallResult<T> {
    pub value: T,
    pub usage: Option<Usage>,
    pub model: String,
    pub duration_ms: u64,
}

pub struct EmbedResult {
    pub embeddings: Vec<Vec<f32>>,
    pub usage: Option<Usage>,
}

fn add_auth(cfg: &AiConfig, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    let mut b = builder;
    if !cfg.llm_key.is_empty() {
        match cfg.provider {
            LlmProvider::Anthropic => {
                b = b
                    .header("x-api-key", &cfg.llm_key)
                    .header("anthropic-version", "2023-06-01");
            }
            LlmProvider::OpenAI => {
                b = b.header("Authorization", format!("Bearer {}", cfg.llm_key));
            }
        }
    }
    b
}

// ---------------------------------------------------------------------------
// LLM chat
// ---------------------------------------------------------------------------

/// Send a chat completion request at the given tier, return text + usage.
pub async fn llm_chat(
    cfg: &AiConfig,
    tier: ModelTier,
    system: &str,
    user: &str,
    max_tokens: u32,
    temperature: f64,
) -> Result<LlmResult, HmlrError> {
    let model = cfg.model_for(tier).to_string();
    match cfg.provider {
        LlmProvider::Anthropic => {
            llm_chat_anthropic(cfg, &model, system, user, max_tokens, temperature).await
        }
        LlmProvider::OpenAI => {
            llm_chat_openai(cfg, &model, system, user, max_tokens, temperature).await
        }
    }
}

async fn llm_chat_openai(
    cfg: &AiConfig,
    model: &str,
    system: &str,
    user: &str,
    max_tokens: u32,
    temperature: f64,
) -> Result<LlmResult, HmlrError> {
    let req = ChatRequest {
        model: model.to_string(),
        messages: vec![
            ChatMessage { role: "system".into(), content: system.into() },
            ChatMessage { role: "user".into(), content: user.into() },
        ],
        max_tokens,
        temperature,
        tools: None,
        tool_choice: None,
    };

    let builder = add_auth(cfg, cfg.client.post(&cfg.llm_url).json(&req));

    let start = std::time::Instant::now();
    let resp = builder
        .send()
        .await
        .map_err(|e| ai_err(format!("LLM request failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(status_err(status, body));
    }

    let chat: ChatResponse = resp
        .json()
        .await
        .map_err(|e| HmlrError::Parse(format!("LLM response parse failed: {e}")))?;
    let duration_ms = start.elapsed().as_millis() as u64;
    let content = chat
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    Ok(LlmResult { content, usage: chat.usage, model: model.to_string(), duration_ms })
}

async fn llm_chat_anthropic(
    cfg: &AiConfig,
    model: &str,
    system: &str,
    user: &str,
    max_tokens: u32,
    temperature: f64,
) -> Result<LlmResult, HmlrError> {
    let req = AnthropicRequest {
        model: model.to_string(),
        max_tokens,
        system: if system.is_empty() { None } else { Some(system.to_string()) },
        messages: vec![AnthropicMessage { role: "user".into(), content: user.into() }],
        temperature,
        tools: None,
        tool_choice: None,
    };

    let builder = add_auth(cfg, cfg.client.post(&cfg.llm_url).json(&req));

    let start = std::time::Instant::now();
    let resp = builder
        .send()
        .await
        .map_err(|e| ai_err(format!("Anthropic request failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(status_err(status, body));
    }

    let ar: AnthropicResponse = resp
        .json()
        .await
        .map_err(|e| HmlrError::Parse(format!("Anthropic response parse failed: {e}")))?;
    let duration_ms = start.elapsed().as_millis() as u64;

    let content = ar
        .content
        .iter()
        .filter(|b| b.block_type == "text")
        .filter_map(|b| b.text.as_deref())
        .collect::<Vec<_>>()
        .join("");

    let usage = ar.usage.as_ref().map(|u| u.to_usage());
    Ok(LlmResult { content, usage, model: model.to_string(), duration_ms })
}

// ---------------------------------------------------------------------------
// LLM tool call — structured output
// ---------------------------------------------------------------------------

/// Call the LLM with a function/tool definition, get back structured JSON.
/// Forces the model to call the named function and parses the arguments.
pub async fn llm_tool_call<T: serde::de::DeserializeOwned>(
    cfg: &AiConfig,
    tier: ModelTier,
    system: &str,
    user: &str,
    fn_name: &str,
    fn_desc: &str,
    parameters: serde_json::Value,
) -> Result<ToolCallResult<T>, HmlrError> {
    let model = cfg.model_for(tier).to_string();
    match cfg.provider {
        LlmProvider::Anthropic => {
            llm_tool_call_anthropic(cfg, &model, system, user, fn_name, fn_desc, parameters).await
        }
        LlmProvider::OpenAI => {
            llm_tool_call_openai(cfg, &model, system, user, fn_name, fn_desc, parameters).await
        }
    }
}

async fn llm_tool_call_openai<T: serde::de::DeserializeOwned>(
    cfg: &AiConfig,
    model: &str,
    system: &str,
    user: &str,
    fn_name: &str,
    fn_desc: &str,
    parameters: serde_json::Value,
) -> Result<ToolCallResult<T>, HmlrError> {
    let req = ChatRequest {
        model: model.to_string(),
        messages: vec![
            ChatMessage { role: "system".into(), content: system.into() },
            ChatMessage { role: "user".into(), content: user.into() },
        ],
        max_tokens: 2048,
        temperature: 0.1,
        tools: Some(vec![ToolDef {
            tool_type: "function".into(),
            function: FunctionDef {
                name: fn_name.into(),
                description: fn_desc.into(),
                parameters,
            },
        }]),
        tool_choice: Some(serde_json::json!({"type": "function", "function": {"name": fn_name}})),
    };

    let builder = add_auth(cfg, cfg.client.post(&cfg.llm_url).json(&req));

    let start = std::time::Instant::now();
    let resp = builder
        .send()
        .await
        .map_err(|e| ai_err(format!("LLM tool call failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(status_err(status, body));
    }

    let chat: ChatResponse = resp
        .json()
        .await
        .map_err(|e| HmlrError::Parse(format!("LLM tool response parse failed: {e}")))?;
    let duration_ms = start.elapsed().as_millis() as u64;

    let args = chat
        .choices
        .first()
        .and_then(|c| c.message.tool_calls.as_ref())
        .and_then(|tc| tc.first())
        .map(|tc| tc.function.arguments.clone())
        .ok_or_else(|| HmlrError::Parse("no tool call in response".into()))?;

    let value: T = serde_json::from_str(&args)
        .map_err(|e| HmlrError::Parse(format!("tool call arguments parse failed: {e}: {args}")))?;

    Ok(ToolCallResult { value, usage: chat.usage, model: model.to_string(), duration_ms })
}

async fn llm_tool_call_anthropic<T: serde::de::DeserializeOwned>(
    cfg: &AiConfig,
    model: &str,
    system: &str,
    user: &str,
    fn_name: &str,
    fn_desc: &str,
    parameters: serde_json::Value,
) -> Result<ToolCallResult<T>, HmlrError> {
    let req = AnthropicRequest {
        model: model.to_string(),
        max_tokens: 2048,
        system: if system.is_empty() { None } else { Some(system.to_string()) },
        messages: vec![AnthropicMessage { role: "user".into(), content: user.into() }],
        temperature: 0.1,
        tools: Some(vec![AnthropicTool {
            name: fn_name.into(),
            description: fn_desc.into(),
            input_schema: parameters,
        }]),
        tool_choice: Some(serde_json::json!({"type": "tool", "name": fn_name})),
    };

    let builder = add_auth(cfg, cfg.client.post(&cfg.llm_url).json(&req));

    let start = std::time::Instant::now();
    let resp = builder
        .send()
        .await
        .map_err(|e| ai_err(format!("Anthropic tool call failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(status_err(status, body));
    }

    let ar: AnthropicResponse = resp
        .json()
        .await
        .map_err(|e| HmlrError::Parse(format!("Anthropic tool response parse failed: {e}")))?;
    let duration_ms = start.elapsed().as_millis() as u64;

    let input = ar
        .content
        .iter()
        .find(|b| b.block_type == "tool_use")
        .and_then(|b| b.input.as_ref())
        .ok_or_else(|| HmlrError::Parse("no tool_use block in Anthropic response".into()))?;

    let args = serde_json::to_string(input)
        .map_err(|e| HmlrError::Parse(format!("failed to serialize tool input: {e}")))?;

    let value: T = serde_json::from_str(&args)
        .map_err(|e| HmlrError::Parse(format!("tool call arguments parse failed: {e}: {args}")))?;

    let usage = ar.usage.as_ref().map(|u| u.to_usage());
    Ok(ToolCallResult { value, usage, model: model.to_string(), duration_ms })
}

// ---------------------------------------------------------------------------
// Embeddings (always OpenAI-compatible)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

/// Generate unit-norm embeddings for one or more texts.
pub async fn get_embeddings(cfg: &AiConfig, texts: &[String]) -> Result<EmbedResult, HmlrError> {
    if texts.is_empty() {
        return Ok(EmbedResult { embeddings: vec![], usage: None });
    }

    let req = EmbedRequest {
        model: cfg.embed_model.clone(),
        input: texts.to_vec(),
        dimensions: Some(cfg.embed_dimensions),
    };

    let mut builder = cfg.client.post(&cfg.embed_url).json(&req);
    if !cfg.embed_key.is_empty() {
        builder = builder.header("Authorization", format!("Bearer {}", cfg.embed_key));
    }

    let resp = builder
        .send()
        .await
        .map_err(|e| ai_err(format!("embedding request failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(status_err(status, body));
    }

    let embed_resp: EmbedResponse = resp
        .json()
        .await
        .map_err(|e| HmlrError::Parse(format!("embedding response parse failed: {e}")))?;

    let embeddings: Vec<Vec<f32>> = embed_resp
        .data
        .into_iter()
        .map(|d| normalize(d.embedding))
        .collect();
    if embeddings.len() != texts.len() {
        return Err(ai_err(format!(
            "embedding count mismatch: sent {} texts, got {} embeddings",
            texts.len(),
            embeddings.len()
        )));
    }
    Ok(EmbedResult { embeddings, usage: embed_resp.usage })
}

/// Embed a single text with exponential-backoff retry on transient errors.
pub async fn embed_one(cfg: &AiConfig, text: &str) -> Result<Vec<f32>, HmlrError> {
    use backon::{ExponentialBuilder, Retryable};

    let texts = vec![text.to_string()];
    let result = (|| get_embeddings(cfg, &texts))
        .retry(ExponentialBuilder::default().with_max_times(3))
        .when(HmlrError::is_retryable)
        .notify(|err, dur| {
            tracing::warn!(error = %err, retry_after = ?dur, "embedding failed, retrying");
        })
        .await?;
    result
        .embeddings
        .into_iter()
        .next()
        .ok_or_else(|| ai_err("embedding response was empty"))
}

// ---------------------------------------------------------------------------
// Vector utilities
// ---------------------------------------------------------------------------

/// Scale a vector to unit L2 norm. Zero vectors pass through unchanged.
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
    v
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (ai, bi) = (a[i] as f64, b[i] as f64);
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Serialize an f32 vector to bytes (little-endian) for SQLite BLOB storage.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize bytes back to an f32 vector.
pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("4 bytes");
            f32::from_le_bytes(arr)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical() {
        let a = [1.0, 0.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_orthogonal() {
        let a = [1.0, 0.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn cosine_angled() {
        let a = [1.0, 0.0, 0.0, 0.0];
        let b = [0.7071, 0.7071, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 0.7071).abs() < 1e-3);
    }

    #[test]
    fn embedding_bytes_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.75, 0.0];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&v)), v);
    }

    #[test]
    fn normalize_unit_norm() {
        let v = normalize(vec![3.0, 4.0]);
        let norm: f64 = v.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_zero_vector_unchanged() {
        assert_eq!(normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
