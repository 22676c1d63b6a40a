//! Capability contracts for external providers.
//!
//! The core never talks to a model vendor directly: embedding generation and
//! chat go through these traits so cloud, local, or stub providers can be
//! swapped without touching the engine. One concrete embedding client is
//! shipped (Ollama) so local indexing works out of the box.

use crate::error::{CoreError, Result};
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::Ollama;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Embedding client
// ---------------------------------------------------------------------------

/// A provider that turns text into fixed-dimension vectors.
///
/// `provider_fingerprint` must be stable across a model/version/config;
/// changing it invalidates existing embeddings for that model.
pub trait EmbeddingClient: Send + Sync {
    fn model_name(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn provider_fingerprint(&self) -> &str;
    /// Embed a batch of texts. Failures are caught per batch by the indexer.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ---------------------------------------------------------------------------
// LLM provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ToolUse,
    MaxTokens,
    EndTurn,
}

pub struct ToolUseRequest {
    pub messages: Vec<ChatMessage>,
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
}

pub struct ToolUseResponse {
    pub stop_reason: StopReason,
    pub text_content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Verbatim assistant message for conversation replay.
    pub raw_assistant_message: serde_json::Value,
}

/// Streaming + non-streaming chat. Tool rounds must use the non-streaming
/// form.
pub trait LlmProvider: Send + Sync {
    /// Stream a reply, invoking `on_delta` per text delta. Returns the full
    /// accumulated text.
    fn chat(
        &self,
        messages: &[ChatMessage],
        system_prompt: &str,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<String>;

    fn chat_complete(&self, messages: &[ChatMessage], system_prompt: &str) -> Result<String>;

    fn create_tool_use_message(&self, request: ToolUseRequest) -> Result<ToolUseResponse>;
}

// ---------------------------------------------------------------------------
// Ollama embedding client
// ---------------------------------------------------------------------------

/// Embedding client backed by a local Ollama daemon. The dimension is probed
/// once at construction by embedding a test string.
pub struct OllamaEmbeddingClient {
    model: String,
    dimensions: usize,
    fingerprint: String,
    ollama: Ollama,
    runtime: tokio::runtime::Runtime,
}

impl OllamaEmbeddingClient {
    pub fn new(model: &str) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(CoreError::validation("embedding model must be provided"));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CoreError::llm(format!("tokio runtime: {e}")))?;
        let ollama = Ollama::default();

        let probe = Self::request(&runtime, &ollama, model, vec!["dimension probe".to_string()])?;
        let dimensions = probe
            .first()
            .map(|v| v.len())
            .filter(|len| *len > 0)
            .ok_or_else(|| {
                CoreError::llm(format!("model '{model}' returned an empty embedding"))
            })?;

        Ok(Self {
            fingerprint: format!("ollama/{model}"),
            model: model.to_string(),
            dimensions,
            ollama,
            runtime,
        })
    }

    fn request(
        runtime: &tokio::runtime::Runtime,
        ollama: &Ollama,
        model: &str,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>> {
        let request =
            GenerateEmbeddingsRequest::new(model.to_string(), EmbeddingsInput::Multiple(texts));
        let response = runtime
            .block_on(ollama.generate_embeddings(request))
            .map_err(|e| CoreError::llm(format!("ollama embeddings: {e}")))?;
        Ok(response.embeddings)
    }
}

impl EmbeddingClient for OllamaEmbeddingClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = Self::request(&self.runtime, &self.ollama, &self.model, texts.to_vec())?;
        if vectors.len() != texts.len() {
            return Err(CoreError::llm(format!(
                "ollama returned {} embeddings for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        for v in &vectors {
            if v.len() != self.dimensions {
                return Err(CoreError::llm(format!(
                    "embedding dimension drift: expected {}, got {}",
                    self.dimensions,
                    v.len()
                )));
            }
        }
        Ok(vectors)
    }
}
