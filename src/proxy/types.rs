//! Canonical (OpenAI-compatible) request and response types.
//!
//! Every backend is presented to clients through these shapes; provider
//! adapters translate into and out of them.

use serde::{Deserialize, Serialize};

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    /// Newer OpenAI name for system-level instructions.
    Developer,
    User,
    Assistant,
    Tool,
    Function,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Developer => "developer",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Function => "function",
        }
    }

    /// Roles carrying instructions rather than conversation turns.
    pub fn is_instruction(&self) -> bool {
        matches!(self, Role::System | Role::Developer)
    }
}

/// Chat completion request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    /// Absent means the serving provider's default model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Message content: a plain string or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(text.into())),
            name: None,
        }
    }

    /// Text of the message; non-text parts are skipped, text parts concatenated.
    pub fn text(&self) -> String {
        match &self.content {
            None => String::new(),
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Number of parts that are not plain text.
    pub fn non_text_parts(&self) -> usize {
        match &self.content {
            Some(MessageContent::Parts(parts)) => {
                parts.iter().filter(|p| p.kind != "text").count()
            }
            _ => 0,
        }
    }
}

/// Stop sequence can be a string or array of strings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StopSequence {
    Single(String),
    Multiple(Vec<String>),
}

impl StopSequence {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StopSequence::Single(s) => vec![s.clone()],
            StopSequence::Multiple(v) => v.clone(),
        }
    }
}

/// Options controlling streaming response behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamOptions {
    /// When true, the final streaming chunk includes a usage object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn stop_sequences(&self) -> Vec<String> {
        self.stop.as_ref().map(StopSequence::to_vec).unwrap_or_default()
    }

    /// Reject requests no backend could serve.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.messages.is_empty() {
            return Err(crate::error::Error::BadRequest(
                "messages must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ensure stream_options includes `include_usage: true` for streaming requests.
///
/// Merges with any existing client-provided stream_options rather than overwriting.
/// Returns true if the request was changed.
pub fn ensure_stream_options(request: &mut ChatCompletionRequest) -> bool {
    match &mut request.stream_options {
        Some(opts) if opts.include_usage.is_some() => false,
        Some(opts) => {
            opts.include_usage = Some(true);
            true
        }
        None => {
            request.stream_options = Some(StreamOptions {
                include_usage: Some(true),
            });
            true
        }
    }
}

/// Chat completion response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    #[serde(default = "chat_completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

fn chat_completion_object() -> String {
    "chat.completion".to_string()
}

/// A completion choice.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

impl ChatCompletionResponse {
    /// Single-choice assistant response stamped with a fresh id.
    pub fn assistant(
        model: impl Into<String>,
        text: impl Into<String>,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) -> Self {
        Self {
            id: completion_id(),
            object: chat_completion_object(),
            created: unix_now(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: Message::new(Role::Assistant, text),
                finish_reason,
            }],
            usage,
        }
    }
}

/// Streaming chunk response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    #[serde(default = "chat_completion_chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

fn chat_completion_chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

/// A streaming choice delta.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// Delta content in streaming response.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    /// A single-choice chunk; `usage` is attached only when given.
    pub fn new(
        id: &str,
        created: i64,
        model: &str,
        delta: Delta,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: chat_completion_chunk_object(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    /// Concatenated delta text across choices.
    pub fn text(&self) -> String {
        self.choices
            .iter()
            .filter_map(|c| c.delta.content.as_deref())
            .collect()
    }
}

// ============================================================================
// Legacy text completions
// ============================================================================

/// `prompt` can be one string or a list of strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Prompt {
    Single(String),
    Multiple(Vec<String>),
}

/// Legacy completion request, served through the chat path.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: Prompt,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop: Option<StopSequence>,
    #[serde(default)]
    pub user: Option<String>,
}

impl CompletionRequest {
    /// Equivalent chat request: the prompt becomes one user message.
    ///
    /// A list of prompts is joined with newlines.
    pub fn into_chat(self) -> ChatCompletionRequest {
        let prompt = match self.prompt {
            Prompt::Single(p) => p,
            Prompt::Multiple(ps) => ps.join("\n"),
        };
        ChatCompletionRequest {
            model: self.model,
            messages: vec![Message::new(Role::User, prompt)],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: self.stream,
            stream_options: None,
            top_p: self.top_p,
            frequency_penalty: None,
            presence_penalty: None,
            stop: self.stop,
            user: self.user,
        }
    }
}

/// Legacy completion response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<TextChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextChoice {
    pub text: String,
    pub index: u32,
    pub finish_reason: Option<String>,
}

impl From<ChatCompletionResponse> for TextCompletionResponse {
    fn from(chat: ChatCompletionResponse) -> Self {
        Self {
            id: chat.id,
            object: "text_completion".to_string(),
            created: chat.created,
            model: chat.model,
            choices: chat
                .choices
                .into_iter()
                .map(|c| TextChoice {
                    text: c.message.text(),
                    index: c.index,
                    finish_reason: c.finish_reason,
                })
                .collect(),
            usage: chat.usage,
        }
    }
}

impl From<ChatCompletionChunk> for TextCompletionResponse {
    fn from(chunk: ChatCompletionChunk) -> Self {
        Self {
            id: chunk.id,
            object: "text_completion".to_string(),
            created: chunk.created,
            model: chunk.model,
            choices: chunk
                .choices
                .into_iter()
                .map(|c| TextChoice {
                    text: c.delta.content.unwrap_or_default(),
                    index: c.index,
                    finish_reason: c.finish_reason,
                })
                .collect(),
            usage: chunk.usage,
        }
    }
}

// ============================================================================
// Embeddings
// ============================================================================

/// Embedding input: text(s) or pre-tokenized input(s).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Multiple(Vec<String>),
    Tokens(Vec<u32>),
    TokenBatches(Vec<Vec<u32>>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input: EmbeddingInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Float vector, or base64 when `encoding_format = "base64"`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EmbeddingVector {
    Float(Vec<f32>),
    Base64(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Embedding {
    pub object: String,
    pub embedding: EmbeddingVector,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct EmbeddingUsage {
    pub prompt_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<Embedding>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<EmbeddingUsage>,
}

/// Fresh `chatcmpl-` identifier.
pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to build a minimal ChatCompletionRequest for testing.
    fn minimal_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: Some("gpt-4o".to_string()),
            messages: vec![Message::new(Role::User, "hello")],
            temperature: None,
            max_tokens: None,
            stream: Some(true),
            stream_options: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            user: None,
        }
    }

    #[test]
    fn ensure_stream_options_sets_when_none() {
        let mut req = minimal_request();
        assert!(ensure_stream_options(&mut req));
        assert_eq!(req.stream_options.unwrap().include_usage, Some(true));
    }

    #[test]
    fn ensure_stream_options_preserves_existing_false() {
        let mut req = minimal_request();
        req.stream_options = Some(StreamOptions {
            include_usage: Some(false),
        });
        assert!(!ensure_stream_options(&mut req));
        assert_eq!(req.stream_options.unwrap().include_usage, Some(false));
    }

    #[test]
    fn stream_options_serialized_after_ensure() {
        let mut req = minimal_request();
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("stream_options"), "{}", json);

        ensure_stream_options(&mut req);
        let json = serde_json::to_string(&req).unwrap();
        assert!(
            json.contains(r#""stream_options":{"include_usage":true}"#),
            "{}",
            json
        );
    }

    #[test]
    fn model_is_optional() {
        let req: ChatCompletionRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert!(req.model.is_none());
        assert!(!req.is_streaming());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn empty_messages_rejected() {
        let req: ChatCompletionRequest = serde_json::from_str(r#"{"messages":[]}"#).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn unknown_role_rejected() {
        let result: Result<ChatCompletionRequest, _> =
            serde_json::from_str(r#"{"messages":[{"role":"wizard","content":"hi"}]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn multipart_content_text_is_joined() {
        let msg: Message = serde_json::from_str(
            r#"{"role":"user","content":[
                {"type":"text","text":"look at "},
                {"type":"image_url"},
                {"type":"text","text":"this"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(msg.text(), "look at this");
        assert_eq!(msg.non_text_parts(), 1);
    }

    #[test]
    fn null_content_is_empty_text() {
        let msg: Message = serde_json::from_str(r#"{"role":"assistant","content":null}"#).unwrap();
        assert_eq!(msg.text(), "");
    }

    #[test]
    fn completion_request_becomes_single_user_message() {
        let req: CompletionRequest = serde_json::from_str(
            r#"{"model":"gpt-3.5-turbo","prompt":["a","b"],"max_tokens":5}"#,
        )
        .unwrap();
        let chat = req.into_chat();
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].role, Role::User);
        assert_eq!(chat.messages[0].text(), "a\nb");
        assert_eq!(chat.max_tokens, Some(5));
    }

    #[test]
    fn chat_response_reshaped_to_text_completion() {
        let chat = ChatCompletionResponse::assistant(
            "m",
            "done",
            Some("stop".to_string()),
            Some(Usage::new(3, 4)),
        );
        let text = TextCompletionResponse::from(chat);
        assert_eq!(text.object, "text_completion");
        assert_eq!(text.choices[0].text, "done");
        assert_eq!(text.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn chunk_skips_absent_usage() {
        let chunk = ChatCompletionChunk::new("id", 1, "m", Delta::default(), None);
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(!json.contains("usage"));
        assert!(json.contains("chat.completion.chunk"));
    }

    #[test]
    fn usage_total_saturates() {
        let usage = Usage::new(u32::MAX, 1);
        assert_eq!(usage.total_tokens, u32::MAX);
        assert_eq!(Usage::new(3, 4).total_tokens, 7);
    }
}
