//! OpenAI-compatible HTTP backend (chat completions + embeddings).
//!
//! Defaults target OpenRouter; any server speaking the same wire format
//! works by overriding `DEBATE_API_BASE`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    Embedder, GenerationError, PersonaProfile, StatementGenerator, StatementRequest,
    VoteDecision, VoteGenerator, VoteRequest,
};

pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_CHAT_MODEL: &str = "mistralai/mistral-small-3.2-24b-instruct";
pub const DEFAULT_EMBEDDING_MODEL: &str = "openai/text-embedding-3-small";

/// Connection settings for [`ChatCompletionsBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub default_model: String,
    pub embedding_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            default_model: DEFAULT_CHAT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 512,
            request_timeout_secs: 300,
        }
    }
}

impl HttpBackendConfig {
    /// Read overrides from the environment.
    ///
    /// `DEBATE_API_BASE`, `DEBATE_API_KEY` (falls back to
    /// `OPENROUTER_API_KEY`), `DEBATE_DEFAULT_MODEL`, `DEBATE_EMBEDDING_MODEL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = std::env::var("DEBATE_API_BASE") {
            config.api_base = base;
        }
        config.api_key = std::env::var("DEBATE_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        if let Ok(model) = std::env::var("DEBATE_DEFAULT_MODEL") {
            config.default_model = model;
        }
        if let Ok(model) = std::env::var("DEBATE_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Statements, votes and embeddings over one HTTP client.
pub struct ChatCompletionsBackend {
    http: reqwest::Client,
    config: HttpBackendConfig,
}

impl ChatCompletionsBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GenerationError::Permanent(format!("HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> Result<Self, GenerationError> {
        Self::new(HttpBackendConfig::from_env())
    }

    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn chat(
        &self,
        persona: &PersonaProfile,
        system_prompt: String,
        user_content: String,
    ) -> Result<String, GenerationError> {
        let model = persona
            .model
            .model
            .as_deref()
            .unwrap_or(&self.config.default_model);
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_content,
                },
            ],
            max_tokens: persona.model.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: persona.model.temperature.unwrap_or(self.config.temperature),
        };

        debug!(model, persona = %persona.name, "Chat completion request");
        let response = self
            .authorized(self.http.post(self.config.endpoint("chat/completions")))
            .json(&request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Permanent(format!("malformed chat response: {}", e)))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(GenerationError::Transient("empty completion".to_string()));
        }
        Ok(content)
    }
}

fn classify_send_error(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        GenerationError::Transient(err.to_string())
    } else {
        GenerationError::Permanent(err.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> GenerationError {
    let message = format!("HTTP {}: {}", status, body);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        GenerationError::Transient(message)
    } else {
        GenerationError::Permanent(message)
    }
}

/// System prompt shared by statement and vote calls.
pub fn persona_prompt(persona: &PersonaProfile, topic: &str) -> String {
    let mut prompt = format!(
        "You are {}, taking part in a moderated debate on: {}.",
        persona.name, topic
    );
    if !persona.background.trim().is_empty() {
        prompt.push_str(&format!("\nYour background: {}", persona.background.trim()));
    }
    prompt.push_str("\nStay in character and speak in the first person.");
    prompt
}

pub fn statement_prompt(request: &StatementRequest) -> String {
    let mut prompt = String::new();
    if request.context.memory.is_empty() {
        prompt.push_str("No one has said anything you reacted to yet.\n");
    } else {
        prompt.push_str("Statements you reacted to, oldest first:\n");
        prompt.push_str(&request.context.memory_text());
        prompt.push('\n');
    }
    if let (Some(speaker), Some(statement)) = (
        &request.context.previous_speaker,
        &request.context.previous_statement,
    ) {
        prompt.push_str(&format!("\nThe last speaker, {}, said: {}\n", speaker, statement));
    }
    if let Some(own) = &request.context.own_last_statement {
        prompt.push_str(&format!("\nYour previous statement was: {}\n", own));
    }
    prompt.push_str("\nGive your opinion in a few sentences.");
    prompt
}

pub fn vote_prompt(request: &VoteRequest) -> String {
    let mut prompt = String::new();
    if request.memory.is_empty() {
        prompt.push_str("You did not react to anyone during the debate.\n");
    } else {
        prompt.push_str("Statements you reacted to, oldest first:\n");
        prompt.push_str(&request.memory.join("\n"));
        prompt.push('\n');
    }
    if request.last_statement.trim().is_empty() {
        prompt.push_str("You did not speak during the debate.\n");
    } else {
        prompt.push_str(&format!("Your final statement was: {}\n", request.last_statement));
    }
    prompt.push_str(
        "\nThe debate is over. Vote for or against the proposal. Reply with JSON only: \
         {\"vote\": true|false, \"reasoning\": \"...\"}",
    );
    prompt
}

/// Extract a vote from model output.
///
/// Accepts a JSON object anywhere in the text with a `vote` field (bool or
/// yes/no string) and optional `reasoning`. Falls back to a leading
/// yes/no/for/against word.
pub fn parse_vote_response(text: &str) -> Result<VoteDecision, GenerationError> {
    #[derive(Deserialize)]
    struct RawVote {
        vote: serde_json::Value,
        #[serde(default)]
        reasoning: Option<String>,
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(raw) = serde_json::from_str::<RawVote>(&text[start..=end]) {
                let decision = match &raw.vote {
                    serde_json::Value::Bool(b) => Some(*b),
                    serde_json::Value::String(s) => word_to_vote(s),
                    _ => None,
                };
                if let Some(decision) = decision {
                    return Ok(VoteDecision {
                        decision,
                        rationale: raw.reasoning.unwrap_or_default().trim().to_string(),
                    });
                }
            }
        }
    }

    let first = text
        .split(|c: char| !c.is_alphanumeric())
        .find(|w| !w.is_empty())
        .unwrap_or_default();
    match word_to_vote(first) {
        Some(decision) => Ok(VoteDecision {
            decision,
            rationale: text.trim().to_string(),
        }),
        // Unparseable output may parse on a fresh sample.
        None => Err(GenerationError::Transient(format!(
            "unparseable vote: {}",
            text.chars().take(120).collect::<String>()
        ))),
    }
}

fn word_to_vote(word: &str) -> Option<bool> {
    match word.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "yea" | "for" | "approve" => Some(true),
        "false" | "no" | "nay" | "against" | "reject" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl StatementGenerator for ChatCompletionsBackend {
    async fn generate_statement(
        &self,
        request: StatementRequest,
    ) -> Result<String, GenerationError> {
        let system = persona_prompt(&request.persona, &request.topic);
        let user = statement_prompt(&request);
        self.chat(&request.persona, system, user).await
    }
}

#[async_trait]
impl VoteGenerator for ChatCompletionsBackend {
    async fn generate_vote(&self, request: VoteRequest) -> Result<VoteDecision, GenerationError> {
        let system = persona_prompt(&request.persona, &request.topic);
        let user = vote_prompt(&request);
        let text = self.chat(&request.persona, system, user).await?;
        parse_vote_response(&text)
    }
}

#[async_trait]
impl Embedder for ChatCompletionsBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
        let request = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: text,
        };
        let response = self
            .authorized(self.http.post(self.config.endpoint("embeddings")))
            .json(&request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            GenerationError::Permanent(format!("malformed embedding response: {}", e))
        })?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GenerationError::Permanent("empty embedding".to_string()))
    }
}
